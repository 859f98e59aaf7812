//! Immutable prompt template.
//!
//! K_i: A template is parsed once per run and rendered per row; rendering
//! never mutates the template.
//! K_i: Syntax follows format strings: `{caption}` is substituted,
//! `{{` and `}}` are literal braces, anything else in braces is rejected.

use super::ConfigError;
use regex::Regex;
use std::sync::LazyLock;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]").expect("static regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Caption,
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    /// Parse a template string.
    ///
    /// B_i(template well formed) → Result
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut segments = Vec::new();
        let mut text = String::new();
        let mut last = 0;

        for caps in TOKEN_RE.captures_iter(source) {
            let whole = caps.get(0).expect("group 0 always matches");
            text.push_str(&source[last..whole.start()]);
            last = whole.end();

            match whole.as_str() {
                "{{" => text.push('{'),
                "}}" => text.push('}'),
                "{" | "}" => {
                    return Err(ConfigError::MalformedTemplate {
                        position: whole.start(),
                        reason: format!("unmatched '{}'", whole.as_str()),
                    });
                }
                _ => {
                    let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                    if name != "caption" {
                        return Err(ConfigError::UnknownPlaceholder(name.to_string()));
                    }
                    if !text.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut text)));
                    }
                    segments.push(Segment::Caption);
                }
            }
        }

        text.push_str(&source[last..]);
        if !text.is_empty() {
            segments.push(Segment::Text(text));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// The template text as written.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the template references `{caption}`.
    pub fn uses_caption(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Caption))
    }

    /// Render the prompt for one row.
    ///
    /// A missing caption renders as the empty string; the pipeline refuses
    /// to start when the template needs a caption column it does not have.
    pub fn render(&self, caption: Option<&str>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Caption => out.push_str(caption.unwrap_or_default()),
            }
        }
        out
    }
}

impl std::str::FromStr for PromptTemplate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
