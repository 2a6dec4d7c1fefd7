//! postgresql.conf settings scanner
//!
//! Parses the `key = value` grammar of section 20.1.2 of the PostgreSQL
//! manual: `key = value` or `key value`, bare tokens made of `[-.\w]`,
//! single-quoted strings with `''`, `\'` or `\\` escapes, and `#` comments.

use super::settings::Settings;
use crate::error::{Error, Result};

/// What to do with a line the scanner cannot make sense of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Return the error to the caller
    Fatal,
    /// Log it and return the error; the caller aborts the render and
    /// reports a blocked status instead of failing
    Lenient,
}

impl ParseMode {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ParseMode::Fatal
        } else {
            ParseMode::Lenient
        }
    }
}

/// Parse a postgresql.conf style string into an ordered mapping.
///
/// Keys are lowercased; a repeated key keeps the last value.
pub fn parse_config(text: &str, mode: ParseMode) -> Result<Settings> {
    let mut parsed = Settings::new();

    for (idx, line) in text.lines().enumerate() {
        match scan_line(line) {
            Ok(Some((key, value))) => parsed.insert(key.to_lowercase(), value),
            Ok(None) => {}
            Err(reason) => {
                let lineno = idx + 1;
                if mode == ParseMode::Lenient {
                    tracing::debug!("{} line {}: {}", reason, lineno, line);
                }
                return Err(Error::MalformedConfigLine {
                    line: lineno,
                    text: line.to_string(),
                    reason,
                });
            }
        }
    }

    Ok(parsed)
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_simple(c: char) -> bool {
    is_word(c) || c == '-' || c == '.'
}

/// Scan a single line. `Ok(None)` for blank and comment-only lines.
fn scan_line(line: &str) -> std::result::Result<Option<(String, String)>, String> {
    let rest = line.trim_start();
    if rest.is_empty() || rest.starts_with('#') {
        return Ok(None);
    }

    let key_len = rest.find(|c: char| !is_word(c)).unwrap_or(rest.len());
    let key = &rest[..key_len];
    let after_key = &rest[key_len..];

    if key.is_empty() {
        return Err(format!("Missing key {:?}", strip_comment(rest)));
    }

    // Separator is either `\s*=\s*` or at least one whitespace character.
    let after_ws = after_key.trim_start();
    let value_part = if let Some(v) = after_ws.strip_prefix('=') {
        v.trim_start()
    } else if after_ws.len() < after_key.len() {
        after_ws
    } else {
        return Err(format!("Missing key {:?}", strip_comment(rest)));
    };

    if value_part.is_empty() || value_part.starts_with('#') {
        return Err("Missing value".to_string());
    }

    let (value, remainder) = if let Some(quoted) = value_part.strip_prefix('\'') {
        match scan_quoted(quoted) {
            Some(found) => found,
            None => return Err(format!("Badly quoted value {:?}", strip_comment(value_part))),
        }
    } else {
        let len = value_part.find(|c: char| !is_simple(c)).unwrap_or(value_part.len());
        if len == 0 {
            return Err(format!("Badly quoted value {:?}", strip_comment(value_part)));
        }
        (value_part[..len].to_string(), &value_part[len..])
    };

    let remainder = remainder.trim_start();
    if !remainder.is_empty() && !remainder.starts_with('#') {
        return Err(format!("Badly quoted value {:?}", strip_comment(remainder)));
    }

    Ok(Some((key.to_string(), value)))
}

/// Read a quoted value up to its closing quote. Returns the unescaped value
/// and whatever follows the closing quote.
fn scan_quoted(s: &str) -> Option<(String, &str)> {
    let mut value = String::new();
    let mut chars = s.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some((_, '\'' | '\\'))) => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            '\'' if matches!(chars.peek(), Some((_, '\''))) => {
                chars.next();
                value.push('\'');
            }
            '\'' => return Some((value, &s[idx + 1..])),
            c => value.push(c),
        }
    }

    None
}

fn strip_comment(s: &str) -> &str {
    s.split('#').next().unwrap_or(s).trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Settings {
        parse_config(text, ParseMode::Fatal).unwrap()
    }

    fn reason(text: &str) -> String {
        match parse_config(text, ParseMode::Fatal) {
            Err(Error::MalformedConfigLine { reason, .. }) => reason,
            other => panic!("expected a malformed line, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_separators_and_comments() {
        let conf = parse(
            "# comment\n\n  Max_Connections = 100 # trailing\nshared_buffers 128MB\nwork_mem=4MB",
        );
        assert_eq!(conf.get("max_connections"), Some("100"));
        assert_eq!(conf.get("shared_buffers"), Some("128MB"));
        assert_eq!(conf.get("work_mem"), Some("4MB"));
        assert_eq!(conf.len(), 3);
    }

    #[test]
    fn test_parse_quoted_values() {
        let conf = parse(
            "a = 'it''s'\nb = 'it\\'s'\nc = '256 MB # not a comment'\nd = ''\ne = '-1' # neg",
        );
        assert_eq!(conf.get("a"), Some("it's"));
        assert_eq!(conf.get("b"), Some("it's"));
        assert_eq!(conf.get("c"), Some("256 MB # not a comment"));
        assert_eq!(conf.get("d"), Some(""));
        assert_eq!(conf.get("e"), Some("-1"));
    }

    #[test]
    fn test_last_value_wins() {
        let conf = parse("a = 1\nb = 2\nA = 3");
        assert_eq!(conf.get("a"), Some("3"));
        assert_eq!(conf.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_lines() {
        assert!(reason("max_connections").starts_with("Missing key"));
        assert!(reason("'value'").starts_with("Missing key"));
        assert_eq!(reason("max_connections ="), "Missing value");
        assert_eq!(reason("max_connections = # nothing"), "Missing value");
        assert!(reason("shared_buffers = 256 MB").starts_with("Badly quoted value"));
        assert!(reason("listen_addresses = '*").starts_with("Badly quoted value"));
    }

    #[test]
    fn test_error_carries_line_number_and_text() {
        let err = parse_config("a = 1\n\nb = 'x", ParseMode::Lenient).unwrap_err();
        match err {
            Error::MalformedConfigLine { line, text, .. } => {
                assert_eq!(line, 3);
                assert_eq!(text, "b = 'x");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
