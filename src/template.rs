//! Message templates: loading and rendering rows into message text.
//!
//! Rendering never fails: a placeholder naming a column the row does not
//! have renders as an empty string. Two dialects share one
//! [`TemplateRenderer`] interface:
//! - [`SafeRenderer`]: `{name}` placeholders, `{{` / `}}` for literal braces
//! - [`EscapedRenderer`]: `{{ name }}` placeholders, every single brace is
//!   literal (HTML with inline CSS/JS)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ConfigError;
use crate::source::Row;

static DOUBLE_BRACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Marker delimiter; cannot appear in user text read from UTF-8 files in
/// any meaningful way and contains no braces.
const MARKER_FENCE: char = '\u{0}';

/// Template dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// `{name}` placeholders.
    #[default]
    Safe,
    /// `{{ name }}` placeholders; single braces are literal.
    Escaped,
}

impl Dialect {
    pub fn renderer(&self) -> Box<dyn TemplateRenderer> {
        match self {
            Self::Safe => Box::new(SafeRenderer),
            Self::Escaped => Box::new(EscapedRenderer),
        }
    }

    /// Placeholder syntax for a column, as shown to users.
    pub fn placeholder(&self, column: &str) -> String {
        match self {
            Self::Safe => format!("{{{column}}}"),
            Self::Escaped => format!("{{{{{column}}}}}"),
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "safe" | "single" | "plain" => Ok(Self::Safe),
            "escaped" | "double" | "html" => Ok(Self::Escaped),
            other => Err(ConfigError::InvalidValue {
                key: "dialect".into(),
                message: format!("unknown template dialect '{other}'"),
            }),
        }
    }
}

/// Turns a template and a row into final text. Total and side-effect free.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, row: &Row) -> String;
}

/// `{name}` substitution with `_upper` / `_lower` variants for every column.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafeRenderer;

impl TemplateRenderer for SafeRenderer {
    fn render(&self, template: &str, row: &Row) -> String {
        substitute(template, &augmented_values(row))
    }
}

/// `{{ name }}` substitution for bodies that carry their own braces.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapedRenderer;

impl TemplateRenderer for EscapedRenderer {
    fn render(&self, template: &str, row: &Row) -> String {
        // 1. {{ name }} -> unique marker
        let mut names: Vec<String> = Vec::new();
        let marked = DOUBLE_BRACE.replace_all(template, |caps: &regex::Captures<'_>| {
            let marker = format!("{MARKER_FENCE}TMPL_VAR_{}{MARKER_FENCE}", names.len());
            names.push(caps[1].to_string());
            marker
        });

        // 2. every remaining brace becomes literal
        let mut escaped = marked.replace('{', "{{").replace('}', "}}");

        // 3. markers -> single-brace placeholders
        for (idx, name) in names.iter().enumerate() {
            let marker = format!("{MARKER_FENCE}TMPL_VAR_{idx}{MARKER_FENCE}");
            escaped = escaped.replacen(&marker, &format!("{{{name}}}"), 1);
        }

        // 4. plain substitution
        SafeRenderer.render(&escaped, row)
    }
}

/// Row values plus `<key>_upper` and `<key>_lower` for every key.
fn augmented_values(row: &Row) -> HashMap<String, String> {
    let mut values: HashMap<String, String> = row
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    for (k, v) in row.iter() {
        values.insert(format!("{k}_upper"), v.to_uppercase());
        values.insert(format!("{k}_lower"), v.to_lowercase());
    }
    values
}

/// Replace `{name}` fields; `{{` and `}}` are literal braces.
///
/// A format spec or conversion (`{name:>5}`, `{name!r}`) is dropped and the
/// bare name is looked up. Unbalanced braces pass through unchanged.
fn substitute(template: &str, values: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") {
            out.push('{');
            rest = &tail[2..];
        } else if tail.starts_with("}}") {
            out.push('}');
            rest = &tail[2..];
        } else if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
        } else {
            let body = &tail[1..];
            match body.find(['{', '}']) {
                Some(end) if body[end..].starts_with('}') => {
                    let field = &body[..end];
                    let name = field.split([':', '!']).next().unwrap_or_default().trim();
                    if let Some(value) = values.get(name) {
                        out.push_str(value);
                    }
                    rest = &body[end + 1..];
                }
                _ => {
                    out.push('{');
                    rest = body;
                }
            }
        }
    }

    out.push_str(rest);
    out
}

/// A message template, loaded from a file or given inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    text: String,
    path: Option<PathBuf>,
}

impl Template {
    /// Read `arg` as a file if such a path exists, otherwise use it verbatim.
    pub fn load(arg: &str) -> Result<Self, ConfigError> {
        let path = Path::new(arg);
        if !arg.is_empty() && path.is_file() {
            let text =
                std::fs::read_to_string(path).map_err(|source| ConfigError::TemplateUnreadable {
                    path: path.to_path_buf(),
                    source,
                })?;
            tracing::debug!(path = %path.display(), bytes = text.len(), "Template loaded from file");
            return Ok(Self {
                text,
                path: Some(path.to_path_buf()),
            });
        }
        Ok(Self::inline(arg))
    }

    pub fn inline(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            path: None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// File the template was read from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn render(&self, renderer: &dyn TemplateRenderer, row: &Row) -> String {
        renderer.render(&self.text, row)
    }
}
