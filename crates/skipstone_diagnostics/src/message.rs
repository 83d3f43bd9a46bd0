//! Persisted per-input build messages and their log rendering.

use crate::severity::Severity;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A warning or error recorded against an input file.
///
/// Messages outlive the build that produced them: they are persisted in the
/// build state and replayed on later incremental builds until the input is
/// reprocessed and its messages are cleared. A message therefore carries
/// everything needed to re-render it without the original generator run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// One-based line of the problem, or `0` when unknown.
    pub line: i32,
    /// One-based column of the problem, or `0` when unknown.
    pub column: i32,
    /// The message text; may be empty when only a cause is known.
    pub text: String,
    /// Whether the message is a warning or an error.
    pub severity: Severity,
    /// Rendered form of the underlying failure, if any.
    pub cause: Option<String>,
}

impl Message {
    /// Creates a new message.
    pub fn new(
        line: i32,
        column: i32,
        text: impl Into<String>,
        severity: Severity,
        cause: Option<String>,
    ) -> Self {
        Self {
            line,
            column,
            text: text.into(),
            severity,
            cause,
        }
    }
}

/// Renders a message the way the default diagnostic router logs it:
/// `<absolute-path>[<line>[:<col>]]: <text>`.
///
/// An empty `text` falls back to the cause, and an absent cause to
/// `"(unknown issue)"`. Line and column are omitted when not positive.
pub fn format_message(
    file: &Path,
    line: i32,
    column: i32,
    text: &str,
    cause: Option<&str>,
) -> String {
    let mut rendered = String::with_capacity(256);
    rendered.push_str(&file.display().to_string());
    if line > 0 {
        rendered.push_str(" [");
        rendered.push_str(&line.to_string());
        if column > 0 {
            rendered.push(':');
            rendered.push_str(&column.to_string());
        }
        rendered.push(']');
    }
    rendered.push_str(": ");
    if !text.is_empty() {
        rendered.push_str(text);
    } else {
        rendered.push_str(cause.unwrap_or("(unknown issue)"));
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_with_line_and_column() {
        let s = format_message(Path::new("/in/a.txt"), 3, 7, "bad token", None);
        assert_eq!(s, "/in/a.txt [3:7]: bad token");
    }

    #[test]
    fn format_with_line_only() {
        let s = format_message(Path::new("/in/a.txt"), 3, 0, "bad token", None);
        assert_eq!(s, "/in/a.txt [3]: bad token");
    }

    #[test]
    fn format_without_position() {
        let s = format_message(Path::new("/in/a.txt"), 0, 0, "bad token", None);
        assert_eq!(s, "/in/a.txt: bad token");
    }

    #[test]
    fn format_falls_back_to_cause() {
        let s = format_message(Path::new("/in/a.txt"), 0, 0, "", Some("io failure"));
        assert_eq!(s, "/in/a.txt: io failure");
    }

    #[test]
    fn format_falls_back_to_placeholder() {
        let s = format_message(Path::new("/in/a.txt"), 0, 0, "", None);
        assert_eq!(s, "/in/a.txt: (unknown issue)");
    }

    #[test]
    fn serde_roundtrip() {
        let msg = Message::new(1, 2, "oops", Severity::Error, Some("cause".to_string()));
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
