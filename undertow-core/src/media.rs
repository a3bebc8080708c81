//! Media model shared by negotiation, templating, caching and streaming.
//!
//! `MediaResource` is owned by the library and is treated as immutable for the
//! duration of a request. `TranscodeTarget` and `CacheFingerprint` are derived
//! per request and never persisted outside the transcode cache.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Stable identifier of a media entity in the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Creates identifier from an existing UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of the requesting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored track that can be streamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaResource {
    pub id: ResourceId,
    pub path: PathBuf,
    /// Container suffix as found on disk, e.g. `flac`
    pub format: String,
    /// Nominal bitrate in kbps
    pub bitrate: u32,
    pub mimetype: String,
    /// Duration in whole seconds
    pub duration: u32,
    pub title: String,
    pub album: String,
    pub artist: String,
    pub track_number: u32,
    pub disc_number: u32,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Number of tracks in the album this resource belongs to
    pub album_track_count: u32,
}

impl MediaResource {
    /// Lower-cased container suffix used for format comparisons.
    pub fn suffix(&self) -> String {
        self.format.to_lowercase()
    }
}

/// Negotiated output for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTarget {
    pub source_suffix: String,
    pub suffix: String,
    /// Target bitrate in kbps
    pub bitrate: u32,
    pub mimetype: String,
    pub requires_transcode: bool,
}

impl TranscodeTarget {
    /// Advisory output size in bytes for a track of `duration` seconds.
    ///
    /// Computed as `bitrate_kbps * 1000 * duration / 8`. Encoders rarely hit
    /// the nominal bitrate exactly, so callers must treat this as a hint.
    pub fn estimated_size(&self, duration: u32) -> u64 {
        u64::from(self.bitrate) * 1000 * u64::from(duration) / 8
    }

    /// Cache key addressing the artifact this target produces for `id`.
    pub fn fingerprint(&self, id: ResourceId) -> CacheFingerprint {
        CacheFingerprint::new(id, self.bitrate, &self.suffix)
    }
}

/// Deterministic cache key for a transcoded artifact.
///
/// Identity is `(resource id, target bitrate, target suffix)` and nothing
/// else; two equal fingerprints always name byte-identical output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheFingerprint(String);

impl CacheFingerprint {
    pub fn new(id: ResourceId, bitrate: u32, suffix: &str) -> Self {
        Self(format!("{id}-{bitrate}.{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used for on-disk storage: hex SHA-1 of the key.
    pub fn file_name(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
