//! Shared fixtures for unit and integration tests.

use std::path::PathBuf;

use crate::media::{MediaResource, ResourceId};

/// Creates a track with the given container suffix and bitrate.
pub fn sample_track(format: &str, bitrate: u32) -> MediaResource {
    let mimetype = mime_guess::from_ext(format)
        .first()
        .map(|mime| mime.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    MediaResource {
        id: ResourceId::generate(),
        path: PathBuf::from(format!("/music/Artist/Album/01 Song.{format}")),
        format: format.to_string(),
        bitrate,
        mimetype,
        duration: 180,
        title: "Song".to_string(),
        album: "Album".to_string(),
        artist: "Artist".to_string(),
        track_number: 1,
        disc_number: 1,
        genre: None,
        year: None,
        album_track_count: 10,
    }
}

/// Creates a track backed by a real file with `contents` inside `dir`.
pub fn track_on_disk(
    dir: &std::path::Path,
    format: &str,
    bitrate: u32,
    contents: &[u8],
) -> MediaResource {
    let path = dir.join(format!("track.{format}"));
    std::fs::write(&path, contents).expect("failed to write fixture track");

    MediaResource {
        path,
        ..sample_track(format, bitrate)
    }
}
