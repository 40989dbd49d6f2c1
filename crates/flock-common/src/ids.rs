//! ---
//! flk_section: "01-core-functionality"
//! flk_subsection: "module"
//! flk_type: "source"
//! flk_scope: "code"
//! flk_description: "Shared primitives and utilities for the driver runtime."
//! flk_version: "v0.0.0-prealpha"
//! flk_owner: "tbd"
//! ---
//! Formatting of numeric vehicle indices into display identifiers.
//!
//! Templates use the positional placeholder syntax operators already write in
//! fleet configuration files: `{0}`, `{}`, `{0:02}`, `{0:3}` and `{0:03d}`.
//! Literal braces are written as `{{` and `}}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing an identifier template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdFormatError {
    #[error("unbalanced brace at offset {0} in id format")]
    UnbalancedBrace(usize),
    #[error("unsupported placeholder `{{{0}}}` in id format")]
    UnsupportedPlaceholder(String),
    #[error("id format `{0}` does not reference the vehicle index")]
    MissingPlaceholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Index { zero_pad: bool, width: usize },
}

/// Parsed identifier template mapping a numeric index to a display id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdFormat {
    template: String,
    segments: Vec<Segment>,
}

impl IdFormat {
    /// Parse a template such as `"V-{0:02}"`.
    pub fn parse(template: &str) -> Result<Self, IdFormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((offset, ch)) = chars.next() {
            match ch {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(IdFormatError::UnbalancedBrace(offset)),
                '{' => {
                    let mut field = String::new();
                    let mut closed = false;
                    for (_, inner) in chars.by_ref() {
                        if inner == '}' {
                            closed = true;
                            break;
                        }
                        field.push(inner);
                    }
                    if !closed {
                        return Err(IdFormatError::UnbalancedBrace(offset));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_placeholder(&field)?);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.iter().any(|s| matches!(s, Segment::Index { .. })) {
            return Err(IdFormatError::MissingPlaceholder(template.to_owned()));
        }

        Ok(Self {
            template: template.to_owned(),
            segments,
        })
    }

    /// Render the display identifier for a numeric index.
    pub fn format(&self, index: u32) -> String {
        let mut out = String::with_capacity(self.template.len() + 4);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Index {
                    zero_pad: true,
                    width,
                } => out.push_str(&format!("{:0width$}", index, width = *width)),
                Segment::Index {
                    zero_pad: false,
                    width,
                } => out.push_str(&format!("{:>width$}", index, width = *width)),
            }
        }
        out
    }

    /// The raw template this format was parsed from.
    pub fn as_str(&self) -> &str {
        &self.template
    }
}

fn parse_placeholder(field: &str) -> Result<Segment, IdFormatError> {
    let unsupported = || IdFormatError::UnsupportedPlaceholder(field.to_owned());
    let (name, width_spec) = match field.split_once(':') {
        Some((name, width_spec)) => (name, width_spec),
        None => (field, ""),
    };
    if !(name.is_empty() || name == "0") {
        return Err(unsupported());
    }

    let width_spec = width_spec.strip_suffix('d').unwrap_or(width_spec);
    let zero_pad = width_spec.starts_with('0');
    let digits = width_spec.trim_start_matches('0');
    let width = if digits.is_empty() {
        0
    } else {
        digits.parse::<usize>().map_err(|_| unsupported())?
    };
    Ok(Segment::Index { zero_pad, width })
}

impl Default for IdFormat {
    fn default() -> Self {
        Self {
            template: "{0:02}".to_owned(),
            segments: vec![Segment::Index {
                zero_pad: true,
                width: 2,
            }],
        }
    }
}

impl FromStr for IdFormat {
    type Err = IdFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdFormat {
    type Error = IdFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdFormat> for String {
    fn from(value: IdFormat) -> Self {
        value.template
    }
}

impl fmt::Display for IdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Replace characters that are not allowed in object identifiers.
///
/// Letters, digits and `-_.:` pass through; anything else becomes `_`.
pub fn make_valid_vehicle_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let id: String = trimmed
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() {
        "_".to_owned()
    } else {
        id
    }
}
