//! Undertow Core - on-the-fly transcoding with a shared streaming cache
//!
//! This crate provides the building blocks for serving audio to clients that
//! ask for a different format or bitrate than what is stored: format
//! negotiation, transcoder command templating, external process pipelines,
//! cancellable byte streams, and a disk cache that runs at most one
//! transcode per output.

pub mod cache;
pub mod config;
pub mod library;
pub mod media;
pub mod negotiation;
pub mod streaming;
pub mod tracing_setup;
pub mod transcoding;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

// Re-export main types for convenient access
pub use cache::{CacheError, CacheLookup, CacheStats, CachedStream, TranscodeCache};
pub use config::{ConfigError, UndertowConfig};
pub use library::{InMemoryLibrary, LibraryError, MediaLibrary, PreferenceStore};
pub use media::{CacheFingerprint, MediaResource, ResourceId, TranscodeTarget, UserId};
pub use negotiation::{ClientPreferences, FormatRequest, NegotiationError, negotiate};
pub use streaming::{StreamBody, StreamRequest, StreamResponse, StreamingError, StreamingService};
pub use transcoding::{Transcoder, TranscodingError};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transcoding error: {0}")]
    Transcoding(#[from] TranscodingError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),

    #[error("Streaming error: {0}")]
    Streaming(#[from] StreamingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Negotiation(e) => e.to_string(),
            UndertowError::Streaming(StreamingError::MissingParameter { name }) => {
                format!("Required parameter '{name}' is missing")
            }
            UndertowError::Streaming(StreamingError::Negotiation(e)) => e.to_string(),
            UndertowError::Library(LibraryError::NotFound { kind, .. })
            | UndertowError::Streaming(StreamingError::Library(LibraryError::NotFound {
                kind,
                ..
            })) => format!("{kind} not found"),
            UndertowError::Transcoding(TranscodingError::NoTranscoderAvailable {
                source_format,
                target_format,
            })
            | UndertowError::Cache(CacheError::Transcoding(
                TranscodingError::NoTranscoderAvailable {
                    source_format,
                    target_format,
                },
            ))
            | UndertowError::Streaming(StreamingError::Cache(CacheError::Transcoding(
                TranscodingError::NoTranscoderAvailable {
                    source_format,
                    target_format,
                },
            ))) => format!("Cannot transcode from {source_format} to {target_format}"),
            UndertowError::Config(_) => "Configuration error occurred".to_string(),
            UndertowError::Transcoding(_) | UndertowError::Cache(_) => {
                "Transcoding error occurred".to_string()
            }
            UndertowError::Library(_) => "Library error occurred".to_string(),
            UndertowError::Streaming(_) => "Streaming error occurred".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            UndertowError::Negotiation(_) => true,
            UndertowError::Streaming(e) => e.is_user_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
