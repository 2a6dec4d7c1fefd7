//! PostgreSQL Configuration Module
//!
//! Regenerates `postgresql.conf`, `pg_hba.conf`, `pg_ident.conf` and the
//! standby recovery settings. Everything in here is a pure function over
//! text: reading and pushing the files is the reconciliation driver's job.

pub mod scanner;
pub mod settings;
pub mod render;
pub mod hba;
pub mod ident;
pub mod recovery;

use std::net::IpAddr;

pub use scanner::{parse_config, ParseMode};
pub use settings::{assemble, Settings, DO_NOT_TOUCH_KEYS};
pub use render::{render, strip_managed_section, DISABLED_PREFIX, END_MARK, START_MARK};
pub use hba::{compile, split_extra_pg_auth, HbaRule};
pub use ident::ensure_ident_mapping;
pub use recovery::{render_recovery, RecoveryParams, RecoveryTemplate};

/// Quote an identifier (role, database or address token).
///
/// ASCII identifiers are wrapped in `"` with embedded quotes doubled.
/// Anything else uses the `U&"..."` form with `\XXXX` / `\+XXXXXX` escapes.
pub fn quote_identifier(identifier: &str) -> String {
    if identifier.is_ascii() {
        return format!("\"{}\"", identifier.replace('"', "\"\""));
    }

    let mut escaped = String::with_capacity(identifier.len() * 2);
    for c in identifier.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\"\""),
            c if c.is_ascii() => escaped.push(c),
            c if (c as u32) <= 0xFFFF => escaped.push_str(&format!("\\{:04x}", c as u32)),
            c => escaped.push_str(&format!("\\+{:06x}", c as u32)),
        }
    }
    format!("U&\"{}\"", escaped)
}

/// Convert a bare address into a host range (`/32` or `/128`).
///
/// Values that already carry a prefix length, or that are not IP
/// addresses at all (host names), are returned unchanged.
pub fn addr_to_range(addr: &str) -> String {
    let addr = addr.trim();
    if addr.contains('/') {
        return addr.to_string();
    }
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => format!("{}/32", addr),
        Ok(IpAddr::V6(_)) => format!("{}/128", addr),
        Err(_) => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier_ascii() {
        assert_eq!(quote_identifier("hello"), "\"hello\"");
        assert_eq!(quote_identifier("'"), "\"'\"");
        assert_eq!(quote_identifier("\""), "\"\"\"\"");
        assert_eq!(quote_identifier("\\"), "\"\\\"");
    }

    #[test]
    fn test_quote_identifier_unicode() {
        assert_eq!(
            quote_identifier("\\ aargh \u{0441}\u{043b}\u{043e}\u{043d}"),
            "U&\"\\\\ aargh \\0441\\043b\\043e\\043d\""
        );
    }

    #[test]
    fn test_addr_to_range() {
        assert_eq!(addr_to_range("10.0.0.1"), "10.0.0.1/32");
        assert_eq!(addr_to_range("2001::f00f"), "2001::f00f/128");
        assert_eq!(addr_to_range("192.168.0.0/16"), "192.168.0.0/16");
        assert_eq!(addr_to_range("db.internal"), "db.internal");
    }
}
