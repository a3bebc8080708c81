//! On-the-fly transcoding through external processes
//!
//! Selects a configured command for a `(source, target)` pair, spawns it as a
//! single transcoder or as a decoder piped into an encoder, and exposes the
//! terminal stdout as a cancellable stream of byte chunks.

pub mod command;
pub mod process;
pub mod stream;

pub use command::{CommandTemplate, TemplateValues, prepare_command_line};
pub use process::ProcessGraph;
pub use stream::{StreamOptions, StreamState, TranscodeStream};

use tokio_util::sync::CancellationToken;

use crate::config::TranscodingConfig;
use crate::media::{MediaResource, TranscodeTarget};

/// Errors that can occur while transcoding
#[derive(Debug, thiserror::Error)]
pub enum TranscodingError {
    #[error("No way to transcode from {source_format} to {target_format}")]
    NoTranscoderAvailable {
        source_format: String,
        target_format: String,
    },

    #[error("Invalid transcoder command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Failed to start transcoding process '{program}': {reason}")]
    StartFailure { program: String, reason: String },

    #[error("Transcoding aborted after {sent} bytes (estimate: {estimate:?})")]
    Aborted { sent: u64, estimate: Option<u64> },

    #[error("Transcoding process failed: {reason}")]
    ProcessFailure { reason: String },
}

/// Resolved process layout for one transcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderPlan {
    /// One process reading the source and writing the target
    Direct { command: Vec<String> },
    /// Decoder stdout piped into encoder stdin
    Piped {
        decoder: Vec<String>,
        encoder: Vec<String>,
    },
}

/// Chooses and starts transcoding processes according to configuration.
#[derive(Debug, Clone)]
pub struct Transcoder {
    config: TranscodingConfig,
}

impl Transcoder {
    pub fn new(config: TranscodingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranscodingConfig {
        &self.config
    }

    /// Resolves the command layout for `target`.
    ///
    /// Tried in order: pair transcoder, decoder + encoder, generic transcoder.
    ///
    /// # Errors
    /// - `TranscodingError::NoTranscoderAvailable` - Nothing configured for the pair
    /// - `TranscodingError::InvalidCommand` - A template could not be tokenized
    pub fn plan(
        &self,
        resource: &MediaResource,
        target: &TranscodeTarget,
    ) -> Result<TranscoderPlan, TranscodingError> {
        let source = target.source_suffix.as_str();
        let values = TemplateValues::new(resource, source, &target.suffix, target.bitrate);

        if let Some(command) =
            prepare_command_line(self.config.pair_transcoder(source, &target.suffix), &values)?
        {
            return Ok(TranscoderPlan::Direct { command });
        }

        let decoder = prepare_command_line(self.config.decoder(source), &values)?;
        let encoder = prepare_command_line(self.config.encoder(&target.suffix), &values)?;
        if let (Some(decoder), Some(encoder)) = (decoder, encoder) {
            return Ok(TranscoderPlan::Piped { decoder, encoder });
        }

        if let Some(command) = prepare_command_line(self.config.generic_transcoder(), &values)? {
            return Ok(TranscoderPlan::Direct { command });
        }

        tracing::info!(
            "No way to transcode from {} to {}",
            source,
            target.suffix
        );
        Err(TranscodingError::NoTranscoderAvailable {
            source_format: source.to_string(),
            target_format: target.suffix.clone(),
        })
    }

    /// Plans, spawns and wraps the processes for `target`.
    ///
    /// # Errors
    /// - `TranscodingError::NoTranscoderAvailable` - Nothing configured for the pair
    /// - `TranscodingError::InvalidCommand` - A template could not be tokenized
    /// - `TranscodingError::StartFailure` - A process could not be spawned
    pub async fn start(
        &self,
        resource: &MediaResource,
        target: &TranscodeTarget,
        estimate: Option<u64>,
        cancel: CancellationToken,
    ) -> Result<TranscodeStream, TranscodingError> {
        let plan = self.plan(resource, target)?;
        let graph = ProcessGraph::spawn(&plan).await?;

        let options = StreamOptions {
            chunk_size: self.config.chunk_size,
            estimate,
            completion_threshold: self.config.completion_threshold,
        };

        Ok(TranscodeStream::new(graph, options, cancel))
    }
}
