//! Argument vector rendering for external transcoder commands.
//!
//! Templates are tokenized with shell quoting rules first, then placeholders
//! are replaced inside each token. Substituted values are never re-split, so a
//! title containing spaces stays a single argument.

use super::TranscodingError;
use crate::media::MediaResource;

/// Placeholders understood in command templates.
const PLACEHOLDERS: [&str; 12] = [
    "%srcpath",
    "%srcfmt",
    "%outfmt",
    "%outrate",
    "%title",
    "%album",
    "%artist",
    "%tracknumber",
    "%totaltracks",
    "%discnumber",
    "%genre",
    "%year",
];

/// Per-track values substituted into a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateValues {
    values: [String; 12],
}

impl TemplateValues {
    /// Collects substitution values for `resource` transcoded to `output_format`.
    pub fn new(
        resource: &MediaResource,
        input_format: &str,
        output_format: &str,
        output_bitrate: u32,
    ) -> Self {
        Self {
            values: [
                resource.path.to_string_lossy().into_owned(),
                input_format.to_string(),
                output_format.to_string(),
                output_bitrate.to_string(),
                resource.title.clone(),
                resource.album.clone(),
                resource.artist.clone(),
                resource.track_number.to_string(),
                resource.album_track_count.to_string(),
                resource.disc_number.to_string(),
                resource.genre.clone().unwrap_or_default(),
                resource.year.map(|year| year.to_string()).unwrap_or_default(),
            ],
        }
    }

    /// Single left-to-right pass; inserted values are never rescanned.
    fn substitute(&self, token: &str) -> String {
        let mut rendered = String::with_capacity(token.len());
        let mut rest = token;

        while let Some(index) = rest.find('%') {
            rendered.push_str(&rest[..index]);
            let candidate = &rest[index..];

            match PLACEHOLDERS
                .iter()
                .position(|placeholder| candidate.starts_with(placeholder))
            {
                Some(slot) => {
                    rendered.push_str(&self.values[slot]);
                    rest = &candidate[PLACEHOLDERS[slot].len()..];
                }
                None => {
                    rendered.push('%');
                    rest = &candidate[1..];
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

/// A command template as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    tokens: Vec<String>,
}

impl CommandTemplate {
    /// Tokenizes `template`. Returns `Ok(None)` for an empty template.
    ///
    /// # Errors
    /// - `TranscodingError::InvalidCommand` - Unbalanced quotes in the template
    pub fn parse(template: &str) -> Result<Option<Self>, TranscodingError> {
        let tokens =
            shell_words::split(template).map_err(|e| TranscodingError::InvalidCommand {
                reason: format!("{template:?}: {e}"),
            })?;

        if tokens.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Self { tokens }))
        }
    }

    /// Renders the argument vector. The first element is the program.
    pub fn render(&self, values: &TemplateValues) -> Vec<String> {
        self.tokens
            .iter()
            .map(|token| values.substitute(token))
            .collect()
    }
}

/// Parses and renders `template` in one step.
///
/// # Errors
/// - `TranscodingError::InvalidCommand` - Unbalanced quotes in the template
pub fn prepare_command_line(
    template: Option<&str>,
    values: &TemplateValues,
) -> Result<Option<Vec<String>>, TranscodingError> {
    let Some(template) = template else {
        return Ok(None);
    };

    Ok(CommandTemplate::parse(template)?.map(|parsed| parsed.render(values)))
}
