//! HTTP request handlers

use std::path::PathBuf;

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::Response;
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use undertow_core::{CachedStream, StreamBody, StreamRequest, UserId};

use crate::error::ApiError;
use crate::server::AppState;

/// Query parameters of the Subsonic `stream` call
#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub id: Option<String>,
    /// Requesting user name
    pub u: Option<String>,
    #[serde(rename = "maxBitRate")]
    pub max_bit_rate: Option<String>,
    pub format: Option<String>,
    #[serde(rename = "estimateContentLength")]
    pub estimate_content_length: Option<String>,
    #[serde(rename = "timeOffset")]
    pub time_offset: Option<String>,
    pub size: Option<String>,
}

impl StreamQuery {
    fn into_parts(self) -> (Option<String>, StreamRequest) {
        let request = StreamRequest {
            id: self.id,
            max_bit_rate: self.max_bit_rate,
            format: self.format,
            estimate_content_length: self.estimate_content_length,
            time_offset: self.time_offset,
            size: self.size,
        };
        (self.u, request)
    }
}

/// Streams a track, transcoding it when the negotiated output differs
/// from the stored file.
///
/// # Errors
/// Any `ApiError`; rendered as a Subsonic JSON error body.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let (user, stream_request) = query.into_parts();
    let user = user
        .filter(|u| !u.is_empty())
        .map(UserId::new)
        .ok_or(ApiError::MissingParameter { name: "u" })?;

    let response = state.streaming.stream(&user, &stream_request).await?;

    match response.body {
        StreamBody::File(path) => Ok(serve_file(path, &response.mimetype, request).await),
        StreamBody::Transcoded(stream) => {
            transcoded_response(stream, &response.mimetype, response.content_length)
        }
    }
}

/// Cache statistics as JSON.
pub async fn cache_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.streaming.cache().statistics();
    Json(serde_json::json!({
        "entries": stats.entry_count,
        "total_size": stats.total_size,
        "in_flight": stats.in_flight,
        "hits": stats.hit_count,
        "misses": stats.miss_count,
        "attaches": stats.attach_count,
        "evictions": stats.eviction_count,
        "hit_rate": stats.hit_rate,
    }))
}

/// Serves a file with range and conditional request support.
async fn serve_file(path: PathBuf, mimetype: &str, request: Request) -> Response {
    let service = match mimetype.parse::<mime_guess::Mime>() {
        Ok(mime) => ServeFile::new_with_mime(&path, &mime),
        Err(_) => ServeFile::new(&path),
    };

    let response = service
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    response.map(Body::new)
}

fn transcoded_response(
    stream: CachedStream,
    mimetype: &str,
    content_length: Option<u64>,
) -> Result<Response, ApiError> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mimetype);
    // Estimated from the bitrate; the real output may differ
    if let Some(length) = content_length {
        builder = builder.header(header::CONTENT_LENGTH, length);
    }

    builder
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Response {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::to_bytes;
    use axum::http::{Request, StatusCode, header};
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;
    use undertow_core::config::{CacheConfig, TranscodingConfig};
    use undertow_core::test_fixtures::track_on_disk;
    use undertow_core::{
        InMemoryLibrary, MediaResource, StreamingService, TranscodeCache, Transcoder,
    };

    use crate::server::{AppState, router};

    struct TestApp {
        _dir: TempDir,
        router: Router,
        track: MediaResource,
        library: Arc<InMemoryLibrary>,
    }

    fn test_app(transcoding: TranscodingConfig) -> TestApp {
        let dir = tempdir().unwrap();
        let track = track_on_disk(dir.path(), "mp3", 320, b"0123456789");
        let library = Arc::new(InMemoryLibrary::new());
        library.insert_track(track.clone());

        let cache = TranscodeCache::open(CacheConfig {
            directory: dir.path().join("cache"),
            ..Default::default()
        })
        .unwrap();
        let streaming = StreamingService::new(
            library.clone(),
            library.clone(),
            cache,
            Transcoder::new(transcoding),
        );

        TestApp {
            _dir: dir,
            router: router(AppState::new(streaming)),
            track,
            library,
        }
    }

    fn get(uri: &str) -> Request<axum::body::Body> {
        Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_direct_stream_serves_file() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!("/rest/stream?id={}&u=alice", app.track.id);

        let response = app.router.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_direct_stream_honors_range() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!("/rest/stream.view?id={}&u=alice", app.track.id);
        let request = Request::builder()
            .uri(uri)
            .header(header::RANGE, "bytes=2-5")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"2345");
    }

    #[tokio::test]
    async fn test_transcoded_stream_with_estimate() {
        let app =
            test_app(TranscodingConfig::default().with_command("transcoder", "cat %srcpath"));
        let uri = format!(
            "/rest/stream?id={}&u=alice&format=ogg&estimateContentLength=true",
            app.track.id
        );

        let response = app.router.clone().oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/ogg");
        let expected = (320u64 * 1000 * 180 / 8).to_string();
        assert_eq!(response.headers()[header::CONTENT_LENGTH], expected.as_str());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"0123456789");

        for _ in 0..100 {
            if app.library.play_stats(app.track.id).play_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.library.play_stats(app.track.id).play_count, 1);
    }

    #[tokio::test]
    async fn test_unsupported_parameter_is_bad_request() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!("/rest/stream?id={}&u=alice&timeOffset=30", app.track.id);

        let response = app.router.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], 0);
        assert_eq!(body["error"]["message"], "Unsupported parameter 'timeOffset'");
    }

    #[tokio::test]
    async fn test_missing_user_is_bad_request() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!("/rest/stream?id={}", app.track.id);

        let response = app.router.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"]["code"], 10);
    }

    #[tokio::test]
    async fn test_unknown_track_is_not_found() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!(
            "/rest/stream?id={}&u=alice",
            undertow_core::ResourceId::generate()
        );

        let response = app.router.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"]["code"], 70);
    }

    #[tokio::test]
    async fn test_missing_transcoder_is_server_error() {
        let app = test_app(TranscodingConfig::default());
        let uri = format!("/rest/stream?id={}&u=alice&format=ogg", app.track.id);

        let response = app.router.oneshot(get(&uri)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"]["message"], "Cannot transcode from mp3 to ogg");
    }

    #[tokio::test]
    async fn test_cache_stats_endpoint() {
        let app = test_app(TranscodingConfig::default());

        let response = app.router.oneshot(get("/api/cache")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["entries"], 0);
        assert_eq!(body["in_flight"], 0);
    }
}
