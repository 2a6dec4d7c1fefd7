//! pg_ident.conf maintenance

use super::hba::IDENT_MAP;

/// Append the `juju_charm root postgres` mapping unless it is already there
pub fn ensure_ident_mapping(existing: &str) -> String {
    let wanted = [IDENT_MAP, "root", "postgres"];
    let present = existing
        .lines()
        .any(|line| line.split_whitespace().eq(wanted.iter().copied()));
    if present {
        return existing.to_string();
    }

    let mut out = existing.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&wanted.join(" "));
    out.push('\n');
    out
}
