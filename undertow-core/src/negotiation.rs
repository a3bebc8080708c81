//! Output format and bitrate negotiation.
//!
//! Pure function of the source track, the request parameters, the stored
//! client preferences and the configured default transcode target.

use serde::{Deserialize, Serialize};

use crate::media::{MediaResource, TranscodeTarget};

const FALLBACK_MIMETYPE: &str = "application/octet-stream";

/// Errors detected before any transcoding work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    #[error("Unsupported parameter '{name}'")]
    UnsupportedParameter { name: &'static str },

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Stored per-user output preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPreferences {
    pub format: Option<String>,
    /// Preferred bitrate in kbps
    pub bitrate: Option<u32>,
}

/// Negotiation inputs taken from the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatRequest {
    /// Bitrate cap in kbps, `Some(0)` meaning no limit
    pub max_bit_rate: Option<u32>,
    /// Requested suffix, or `raw` for the source format
    pub format: Option<String>,
}

impl FormatRequest {
    /// Builds a request from raw transport values.
    ///
    /// # Errors
    /// - `NegotiationError::UnsupportedParameter` - `timeOffset` or `size` present
    /// - `NegotiationError::InvalidParameter` - Non-numeric bitrate or malformed format
    pub fn from_params(
        max_bit_rate: Option<&str>,
        format: Option<&str>,
        time_offset: Option<&str>,
        size: Option<&str>,
    ) -> Result<Self, NegotiationError> {
        if time_offset.is_some() {
            return Err(NegotiationError::UnsupportedParameter { name: "timeOffset" });
        }
        if size.is_some() {
            return Err(NegotiationError::UnsupportedParameter { name: "size" });
        }

        let max_bit_rate = max_bit_rate
            .filter(|value| !value.is_empty())
            .map(|value| {
                value
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| NegotiationError::InvalidParameter {
                        name: "maxBitRate",
                        reason: e.to_string(),
                    })
            })
            .transpose()?;

        let format = format
            .filter(|value| !value.is_empty())
            .map(|value| value.to_lowercase());
        if let Some(suffix) = &format {
            if !is_plain_suffix(suffix) {
                return Err(NegotiationError::InvalidParameter {
                    name: "format",
                    reason: format!("'{suffix}' is not a file suffix"),
                });
            }
        }

        Ok(Self {
            max_bit_rate,
            format,
        })
    }
}

fn is_plain_suffix(suffix: &str) -> bool {
    suffix.len() <= 16 && suffix.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Computes the output target for `resource`.
///
/// Precedence: explicit request format, then preferred format; preferred
/// bitrate only lowers; a nonzero `max_bit_rate` caps and, when no format was
/// chosen, switches to `default_target`.
pub fn negotiate(
    resource: &MediaResource,
    request: &FormatRequest,
    preferences: &ClientPreferences,
    default_target: Option<&str>,
) -> TranscodeTarget {
    let source_suffix = resource.suffix();
    let mut suffix = source_suffix.clone();
    let mut bitrate = resource.bitrate;

    let mut using_default_format = false;
    if let Some(format) = &request.format {
        if format != "raw" {
            suffix = format.clone();
        }
    } else if let Some(format) = preferences.format.as_deref().filter(|f| !f.is_empty()) {
        suffix = format.to_lowercase();
    } else {
        using_default_format = true;
    }

    if let Some(preferred) = preferences.bitrate.filter(|rate| *rate > 0) {
        if preferred < bitrate {
            bitrate = preferred;
        }
    }

    if let Some(max) = request.max_bit_rate.filter(|rate| *rate != 0) {
        if bitrate > max {
            bitrate = max;
            if using_default_format {
                if let Some(target) = default_target.filter(|t| !t.is_empty()) {
                    suffix = target.to_lowercase();
                }
            }
        }
    }

    let mimetype = if suffix != source_suffix {
        mime_guess::from_ext(&suffix)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| FALLBACK_MIMETYPE.to_string())
    } else {
        resource.mimetype.clone()
    };

    let requires_transcode = suffix != source_suffix || bitrate != resource.bitrate;

    TranscodeTarget {
        source_suffix,
        suffix,
        bitrate,
        mimetype,
        requires_transcode,
    }
}
