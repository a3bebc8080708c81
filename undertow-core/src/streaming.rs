//! Stream orchestration
//!
//! Resolves a track, negotiates the output, and either serves the source file
//! directly, serves a cached artifact, or attaches to a transcode production
//! through the cache. Play bookkeeping runs in the background and never
//! affects the response.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::cache::{CacheError, CacheLookup, CachedStream, TranscodeCache};
use crate::library::{LibraryError, MediaLibrary, PreferenceStore};
use crate::media::{MediaResource, ResourceId, TranscodeTarget, UserId};
use crate::negotiation::{FormatRequest, NegotiationError, negotiate};
use crate::transcoding::{TranscodeStream, Transcoder};

/// Errors that can occur while serving a stream request
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Required parameter '{name}' is missing")]
    MissingParameter { name: &'static str },

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl StreamingError {
    /// True when the request itself was malformed.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StreamingError::MissingParameter { .. } | StreamingError::Negotiation(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StreamingError::Library(LibraryError::NotFound { .. })
        )
    }
}

/// Stream request parameters as received from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub id: Option<String>,
    pub max_bit_rate: Option<String>,
    pub format: Option<String>,
    pub estimate_content_length: Option<String>,
    pub time_offset: Option<String>,
    pub size: Option<String>,
}

impl StreamRequest {
    pub fn for_track(id: ResourceId) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// Only the literal `true` enables the size estimate.
    pub fn wants_estimate(&self) -> bool {
        self.estimate_content_length.as_deref() == Some("true")
    }

    fn resource_id(&self) -> Result<ResourceId, StreamingError> {
        let raw = self
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(StreamingError::MissingParameter { name: "id" })?;

        raw.parse().map_err(|e: uuid::Error| {
            StreamingError::Negotiation(NegotiationError::InvalidParameter {
                name: "id",
                reason: e.to_string(),
            })
        })
    }

    fn format_request(&self) -> Result<FormatRequest, NegotiationError> {
        FormatRequest::from_params(
            self.max_bit_rate.as_deref(),
            self.format.as_deref(),
            self.time_offset.as_deref(),
            self.size.as_deref(),
        )
    }
}

/// Where the response bytes come from.
#[derive(Debug)]
pub enum StreamBody {
    /// Source file or completed cache artifact
    File(PathBuf),
    /// Live transcode output
    Transcoded(CachedStream),
}

/// Ready-to-send stream response.
#[derive(Debug)]
pub struct StreamResponse {
    pub body: StreamBody,
    pub mimetype: String,
    /// Advisory length of a transcoded body, only when requested
    pub content_length: Option<u64>,
    pub target: TranscodeTarget,
}

/// Serves stream requests against one library, preference store and cache.
#[derive(Clone)]
pub struct StreamingService {
    library: Arc<dyn MediaLibrary>,
    preferences: Arc<dyn PreferenceStore>,
    cache: TranscodeCache,
    transcoder: Transcoder,
}

impl StreamingService {
    pub fn new(
        library: Arc<dyn MediaLibrary>,
        preferences: Arc<dyn PreferenceStore>,
        cache: TranscodeCache,
        transcoder: Transcoder,
    ) -> Self {
        Self {
            library,
            preferences,
            cache,
            transcoder,
        }
    }

    pub fn cache(&self) -> &TranscodeCache {
        &self.cache
    }

    pub fn transcoder(&self) -> &Transcoder {
        &self.transcoder
    }

    /// Resolves and starts the response for `request` on behalf of `user`.
    ///
    /// Parameter errors are reported before any lookup or process work.
    ///
    /// # Errors
    /// - `StreamingError::MissingParameter` - No track id
    /// - `StreamingError::Negotiation` - Unsupported or malformed parameter
    /// - `StreamingError::Library` - Unknown track or backend failure
    /// - `StreamingError::Cache` - No transcoder configured, spawn failure or cache I/O
    pub async fn stream(
        &self,
        user: &UserId,
        request: &StreamRequest,
    ) -> Result<StreamResponse, StreamingError> {
        let id = request.resource_id()?;
        let format_request = request.format_request()?;

        let resource = self.library.track(id).await?;
        let preferences = self.preferences.preferences_for(user).await?;
        let target = negotiate(
            &resource,
            &format_request,
            &preferences,
            self.transcoder.config().default_target(),
        );

        let response = if target.requires_transcode {
            self.transcoded(user, &resource, target, request.wants_estimate())
                .await?
        } else {
            tracing::debug!(
                "Serving track {} directly from {}",
                resource.id,
                resource.path.display()
            );
            StreamResponse {
                body: StreamBody::File(resource.path.clone()),
                mimetype: resource.mimetype.clone(),
                content_length: None,
                target,
            }
        };

        self.spawn_record_play(resource.id, user.clone());
        Ok(response)
    }

    async fn transcoded(
        &self,
        user: &UserId,
        resource: &MediaResource,
        target: TranscodeTarget,
        wants_estimate: bool,
    ) -> Result<StreamResponse, StreamingError> {
        let estimate = wants_estimate.then(|| target.estimated_size(resource.duration));
        let key = target.fingerprint(resource.id);

        let transcoder = self.transcoder.clone();
        let user = user.clone();
        let source = resource.clone();
        let output = target.clone();
        let lookup = self
            .cache
            .get_or_produce(&key, move |cancel| async move {
                tracing::info!(
                    "Transcoding track {} for user {}. Source: {} at {}kbps. Dest: {} at {}kbps",
                    source.id,
                    user,
                    output.source_suffix,
                    source.bitrate,
                    output.suffix,
                    output.bitrate
                );
                transcoder
                    .start(&source, &output, estimate, cancel)
                    .await
                    .map(TranscodeStream::into_stream)
            })
            .await?;

        let (body, content_length) = match lookup {
            CacheLookup::Hit(path) => (StreamBody::File(path), None),
            CacheLookup::Attached(stream) | CacheLookup::Produced(stream) => {
                (StreamBody::Transcoded(stream), estimate)
            }
        };

        Ok(StreamResponse {
            body,
            mimetype: target.mimetype.clone(),
            content_length,
            target,
        })
    }

    fn spawn_record_play(&self, id: ResourceId, user: UserId) {
        let library = Arc::clone(&self.library);
        tokio::spawn(async move {
            if let Err(e) = library.record_play(id, &user, Utc::now()).await {
                tracing::warn!("Failed to record play of {} for {}: {}", id, user, e);
            }
        });
    }
}

impl std::fmt::Debug for StreamingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("cache", &self.cache)
            .field("transcoder", &self.transcoder)
            .finish_non_exhaustive()
    }
}
