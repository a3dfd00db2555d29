//! YAML error diagnostics for definition files

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

/// YAML syntax error with source location
#[derive(Debug, Error, Diagnostic)]
#[error("invalid YAML: {message}")]
#[diagnostic(code(tflow::yaml::syntax))]
pub struct YamlSyntaxError {
    #[source_code]
    src: NamedSource<String>,

    #[label("error here")]
    span: SourceSpan,

    #[help]
    help: Option<String>,

    /// The underlying error message
    message: String,
}

impl YamlSyntaxError {
    /// Create a syntax error from a serde_yml error
    pub fn from_serde_error(err: &serde_yml::Error, source: &str, filename: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let offset = line_col_to_offset(source, line, column);
        let message = err.to_string();
        let help = generate_help(&message);

        Self {
            src: NamedSource::new(filename, source.to_string()),
            span: SourceSpan::from(offset..offset.saturating_add(1)),
            help,
            message,
        }
    }

    /// File the error was found in
    pub fn filename(&self) -> &str {
        self.src.name()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Byte offset of a 1-based line and column, clamped to the source length
fn line_col_to_offset(source: &str, line: usize, column: usize) -> usize {
    let line_start: usize = source
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    let in_line = source[line_start..]
        .char_indices()
        .nth(column.saturating_sub(1))
        .map_or(source.len() - line_start, |(i, _)| i);
    (line_start + in_line).min(source.len().saturating_sub(1))
}

/// Hints for the YAML mistakes definition authors make most often
const HINTS: &[(&str, &str)] = &[
    ("tab character", "Indent with spaces; YAML does not accept tabs."),
    ("duplicate key", "A key appears twice in the same mapping."),
    ("expected block end", "Indentation is inconsistent around this line."),
    (
        "mapping values are not allowed",
        "Put a space after ':' or quote values that contain a colon.",
    ),
    (
        "unknown variant",
        "Check step_type, decision_type, terminal_status, edge_type or rule_type spelling.",
    ),
    ("missing field", "Every definition needs id, title, created and author."),
    ("invalid ulid", "IDs are a type prefix and a ULID, e.g. STEP-01HV3K9ZQ4M8N2P5R7T9W1XYZA."),
];

fn generate_help(message: &str) -> Option<String> {
    let lower = message.to_lowercase();
    HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, hint)| hint.to_string())
}
