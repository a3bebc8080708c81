//! Centralized configuration for Undertow.
//!
//! All tunable parameters and command templates are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Invalid configuration file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Central configuration for all Undertow components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UndertowConfig {
    pub transcoding: TranscodingConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
}

/// External transcoder command templates and stream tuning.
///
/// Command templates live under the keys `transcoder_<src>_<dst>`,
/// `decoder_<src>`, `decoder`, `encoder_<dst>`, `encoder` and `transcoder`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    pub commands: BTreeMap<String, String>,
    /// Suffix used when a bitrate cap forces a transcode and no format was asked for
    pub default_transcode_target: Option<String>,
    /// Bytes read from the terminal process per chunk
    pub chunk_size: usize,
    /// Fraction of the size estimate past which a cancelled stream runs to completion
    pub completion_threshold: f64,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            default_transcode_target: None,
            chunk_size: 8192, // 8 KiB
            completion_threshold: 0.95,
        }
    }
}

impl TranscodingConfig {
    /// Adds or replaces a command template.
    pub fn with_command(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.commands.insert(key.into(), template.into());
        self
    }

    /// Looks up a template, treating empty strings as absent.
    pub fn command(&self, key: &str) -> Option<&str> {
        self.commands
            .get(key)
            .map(|template| template.as_str())
            .filter(|template| !template.trim().is_empty())
    }

    /// Direct transcoder for a specific `(source, target)` pair.
    pub fn pair_transcoder(&self, source: &str, target: &str) -> Option<&str> {
        self.command(&format!("transcoder_{source}_{target}"))
    }

    /// Decoder for `source`, falling back to the generic decoder.
    pub fn decoder(&self, source: &str) -> Option<&str> {
        self.command(&format!("decoder_{source}"))
            .or_else(|| self.command("decoder"))
    }

    /// Encoder for `target`, falling back to the generic encoder.
    pub fn encoder(&self, target: &str) -> Option<&str> {
        self.command(&format!("encoder_{target}"))
            .or_else(|| self.command("encoder"))
    }

    /// Catch-all transcoder.
    pub fn generic_transcoder(&self) -> Option<&str> {
        self.command("transcoder")
    }

    /// Configured default target, ignoring empty values.
    pub fn default_target(&self) -> Option<&str> {
        self.default_transcode_target
            .as_deref()
            .filter(|suffix| !suffix.is_empty())
    }
}

/// Transcode cache storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding completed and in-flight artifacts
    pub directory: PathBuf,
    /// Maximum total size of retained artifacts in bytes
    pub max_total_size: u64,
    /// Artifacts larger than this are streamed but not retained
    pub max_entry_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("cache/transcodes"),
            max_total_size: 512 * 1024 * 1024, // 512 MiB
            max_entry_size: 256 * 1024 * 1024, // 256 MiB
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 4040)),
        }
    }
}

const COMMAND_ENV_PREFIXES: [&str; 3] = ["TRANSCODER", "DECODER", "ENCODER"];

impl UndertowConfig {
    /// Loads configuration from a JSON file. Missing sections use defaults.
    ///
    /// # Errors
    /// - `ConfigError::Read` - File could not be read
    /// - `ConfigError::Parse` - File is not valid configuration JSON
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        Self::default().with_overrides(std::env::vars())
    }

    /// Applies `UNDERTOW_*` overrides from the given variables.
    pub fn with_overrides(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix("UNDERTOW_") else {
                continue;
            };

            match key {
                "CACHE_DIR" => self.cache.directory = PathBuf::from(value),
                "CACHE_MAX_SIZE" => {
                    if let Ok(size) = value.parse::<u64>() {
                        self.cache.max_total_size = size;
                    }
                }
                "DEFAULT_TRANSCODE_TARGET" => {
                    self.transcoding.default_transcode_target = Some(value.to_lowercase());
                }
                "CHUNK_SIZE" => {
                    if let Ok(size) = value.parse::<usize>() {
                        if size > 0 {
                            self.transcoding.chunk_size = size;
                        }
                    }
                }
                "BIND" => {
                    if let Ok(address) = value.parse::<SocketAddr>() {
                        self.server.bind_address = address;
                    }
                }
                _ if COMMAND_ENV_PREFIXES
                    .iter()
                    .any(|prefix| key.starts_with(prefix)) =>
                {
                    self.transcoding.commands.insert(key.to_lowercase(), value);
                }
                _ => {}
            }
        }

        self
    }
}
