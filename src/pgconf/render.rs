//! postgresql.conf renderer
//!
//! The managed settings live in a single marker-delimited section appended
//! to the end of the file. Everything outside the section is kept; lines
//! that would conflict with a managed key are disabled with a comment
//! prefix instead of being removed.

use std::sync::OnceLock;

use regex::Regex;

use super::settings::Settings;
use crate::error::{Error, Result};

pub const START_MARK: &str = "### BEGIN JUJU SETTINGS ###";
pub const END_MARK: &str = "### END JUJU SETTINGS ###";

/// Prefix used to disable a line we took over
pub const DISABLED_PREFIX: &str = "# juju # ";

fn managed_section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?ims)^[ \t]*{}.*^[ \t]*{}[ \t]*$",
            regex::escape(START_MARK),
            regex::escape(END_MARK)
        ))
        .expect("managed section pattern is valid")
    })
}

fn simple_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[-.\w]+$").expect("simple value pattern is valid"))
}

/// Remove the managed section, markers included
pub fn strip_managed_section(text: &str) -> String {
    managed_section_re().replace(text, "").into_owned()
}

/// Prefix every active `key = value` / `key value` line for `key`
fn disable_key(text: &str, key: &str) -> String {
    let re = Regex::new(&format!(r"(?mi)^([ \t]*{}[ \t=].*)$", regex::escape(key)));
    match re {
        Ok(re) => re
            .replace_all(text, format!("{}${{1}}", DISABLED_PREFIX).as_str())
            .into_owned(),
        // Keys come out of the scanner as word characters, escaping keeps the
        // pattern valid for anything else.
        Err(_) => text.to_string(),
    }
}

/// Quote a value unless it is a bare `[-.\w]+` token.
///
/// The server unescapes backslashes inside quoted strings, so they are
/// doubled before quotes are.
pub fn quote_value(value: &str) -> String {
    if simple_value_re().is_match(value) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }
}

/// Append a managed section to `text`, keeping the separator stable so
/// that rendering an already rendered file is a no-op.
pub(crate) fn append_section(mut text: String, lines: &[String]) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(START_MARK);
    for line in lines {
        text.push('\n');
        text.push_str(line);
    }
    text.push('\n');
    text.push_str(END_MARK);
    text
}

/// Render postgresql.conf.
///
/// `managed_extra_lines` are emitted verbatim after the settings, e.g. the
/// `include_if_exists` directive for standby settings or `ssl = on|off`.
/// Nothing is produced if any value would break the one-directive-per-line
/// grammar.
pub fn render(existing: &str, settings: &Settings, managed_extra_lines: &[String]) -> Result<String> {
    for (key, value) in settings.iter() {
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(Error::InvalidConfigValue(key.to_string()));
        }
        if value.contains('\n') || value.contains('\r') {
            return Err(Error::InvalidConfigValue(value.to_string()));
        }
    }
    if let Some(line) = managed_extra_lines.iter().find(|l| l.contains('\n')) {
        return Err(Error::InvalidConfigValue(line.clone()));
    }

    let mut text = strip_managed_section(existing);
    for key in settings.keys() {
        text = disable_key(&text, key);
    }

    let mut section: Vec<String> = settings
        .iter()
        .map(|(k, v)| format!("{} = {}", k, quote_value(v)))
        .collect();
    section.extend(managed_extra_lines.iter().cloned());

    Ok(append_section(text, &section))
}
