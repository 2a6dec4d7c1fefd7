//! pg_hba.conf rule compiler
//!
//! PostgreSQL evaluates authentication rules top to bottom and stops at the
//! first match, so the order of the generated table is fixed:
//!
//! 1. local superuser access for the controller
//! 2. replication access for every peer
//! 3. operator admin addresses
//! 4. operator free-form rules
//! 5. deny everything else

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use super::render::{append_section, strip_managed_section, DISABLED_PREFIX};
use super::{addr_to_range, quote_identifier};
use crate::replication::REPLICATION_USER;
use crate::state::PeerRecord;

/// pg_ident map letting the root account connect as the database superuser
pub const IDENT_MAP: &str = "juju_charm";

/// One pg_hba.conf line, kept as its whitespace-separated fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HbaRule(Vec<String>);

impl HbaRule {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for HbaRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

fn valid_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(host.*|local.*|#.*)?\s*$").expect("hba line pattern is valid"))
}

fn active_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^([ \t]*[^#\s].*)$").expect("active line pattern is valid"))
}

/// Split `extra_pg_auth` into rules.
///
/// Multi-line text is the normal form. A single comma-joined line is
/// accepted for backwards compatibility, but only when every comma
/// separated piece looks like an hba rule or a comment on its own.
pub fn split_extra_pg_auth(raw: &str) -> Vec<String> {
    let segments: Vec<&str> = raw.split(',').collect();
    let lines: Vec<&str> = if segments.len() > 1 && segments.iter().all(|s| valid_line_re().is_match(s)) {
        segments
    } else {
        raw.lines().collect()
    };

    lines
        .into_iter()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the ordered rule table
pub fn build_rules(
    peers: &[PeerRecord],
    admin_addresses: &str,
    extra_pg_auth: &str,
    tls: bool,
) -> Vec<HbaRule> {
    let host = if tls { "hostssl" } else { "host" };
    let mut rules = Vec::new();

    // The controller runs as root and connects as postgres over the socket.
    rules.push(HbaRule::new([
        "local".to_string(),
        "all".to_string(),
        "postgres".to_string(),
        "peer".to_string(),
        format!("map={}", IDENT_MAP),
    ]));

    // Peers replicate as the replication user; the postgres database lets
    // the primary query replication status.
    for peer in peers {
        for addr in peer.incoming_addresses() {
            let qaddr = quote_identifier(&addr);
            let comment = format!("# {}", peer.node);
            for database in ["replication", "postgres"] {
                rules.push(HbaRule::new([
                    host,
                    database,
                    REPLICATION_USER,
                    qaddr.as_str(),
                    "md5",
                    comment.as_str(),
                ]));
            }
        }
    }

    for addr in admin_addresses.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        rules.push(HbaRule::new([
            host.to_string(),
            "all".to_string(),
            "all".to_string(),
            quote_identifier(&addr_to_range(addr)),
            "md5".to_string(),
            "# admin_addresses config".to_string(),
        ]));
    }

    for line in split_extra_pg_auth(extra_pg_auth) {
        rules.push(HbaRule::new([format!("{} # extra_pg_auth config", line)]));
    }

    rules.push(HbaRule::new(["local", "all", "all", "reject", "# Refuse by default"]));
    rules.push(HbaRule::new(["host", "all", "all", "all", "reject", "# Refuse by default"]));

    rules
}

/// Compile pg_hba.conf.
///
/// Every previously active line outside the managed section is disabled:
/// authentication rules cannot be partially overridden, so anything left
/// active above the managed block would shadow it.
pub fn compile(
    existing: &str,
    peers: &[PeerRecord],
    admin_addresses: &str,
    extra_pg_auth: &str,
    tls: bool,
) -> String {
    let stripped = strip_managed_section(existing);
    let disabled = active_line_re()
        .replace_all(&stripped, format!("{}${{1}}", DISABLED_PREFIX).as_str())
        .into_owned();

    let lines: Vec<String> = build_rules(peers, admin_addresses, extra_pg_auth, tls)
        .iter()
        .map(HbaRule::to_string)
        .collect();

    append_section(disabled, &lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeId;

    fn peer(unit: &str, addr: &str) -> PeerRecord {
        let mut record = PeerRecord::empty(NodeId::new(unit));
        record.ingress_address = Some(addr.to_string());
        record
    }

    fn deny_rules() -> Vec<HbaRule> {
        vec![
            HbaRule::new(["local", "all", "all", "reject", "# Refuse by default"]),
            HbaRule::new(["host", "all", "all", "all", "reject", "# Refuse by default"]),
        ]
    }

    #[test]
    fn test_rule_order() {
        let peers = vec![peer("postgresql/1", "10.0.0.2"), peer("postgresql/2", "")];
        let rules = build_rules(&peers, "192.168.0.0/24, 172.16.0.9", "host all all 10.0.0.0/8 md5", false);
        let lines: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            lines,
            vec![
                "local all postgres peer map=juju_charm",
                "host replication _juju_repl \"10.0.0.2/32\" md5 # postgresql/1",
                "host postgres _juju_repl \"10.0.0.2/32\" md5 # postgresql/1",
                "host all all \"192.168.0.0/24\" md5 # admin_addresses config",
                "host all all \"172.16.0.9/32\" md5 # admin_addresses config",
                "host all all 10.0.0.0/8 md5 # extra_pg_auth config",
                "local all all reject # Refuse by default",
                "host all all all reject # Refuse by default",
            ]
        );
    }

    #[test]
    fn test_tls_uses_hostssl_for_peers_and_admins() {
        let rules = build_rules(&[peer("postgresql/1", "fd00::2")], "10.1.0.0/16", "", true);
        assert_eq!(rules[1].fields()[0], "hostssl");
        assert_eq!(rules[1].fields()[3], "\"fd00::2/128\"");
        assert_eq!(rules[3].fields()[0], "hostssl");
        // The networked deny rule stays plain host so it catches everything.
        assert_eq!(rules.last().unwrap().fields()[0], "host");
    }

    #[test]
    fn test_deny_rules_always_last() {
        for extra in ["", "host all all 0.0.0.0/0 trust", "local all all trust\nhost all all all trust"] {
            let rules = build_rules(&[peer("postgresql/3", "10.0.0.4")], "10.9.0.0/16", extra, false);
            assert_eq!(rules[rules.len() - 2..].to_vec(), deny_rules());
            let deny_count = rules.iter().filter(|r| r.to_string().contains("Refuse by default")).count();
            assert_eq!(deny_count, 2);
        }
    }

    #[test]
    fn test_split_extra_pg_auth_comma_form() {
        assert_eq!(
            split_extra_pg_auth("host all all 10.0.0.0/8 md5,# a comment"),
            vec!["host all all 10.0.0.0/8 md5", "# a comment"]
        );
    }

    #[test]
    fn test_split_extra_pg_auth_line_form() {
        // A comma inside an option value means this is not the comma form.
        let raw = "host all all 10.0.0.0/8 ldap ldapserver=a,b\nlocal all all peer";
        assert_eq!(
            split_extra_pg_auth(raw),
            vec!["host all all 10.0.0.0/8 ldap ldapserver=a,b", "local all all peer"]
        );
        assert!(split_extra_pg_auth("").is_empty());
    }

    #[test]
    fn test_compile_disables_existing_rules() {
        let existing = "# TYPE DATABASE USER ADDRESS METHOD\nlocal all all trust\n\nhost all all 0.0.0.0/0 trust\n";
        let out = compile(existing, &[], "", "", false);
        assert!(out.starts_with(
            "# TYPE DATABASE USER ADDRESS METHOD\n# juju # local all all trust\n\n# juju # host all all 0.0.0.0/0 trust\n### BEGIN JUJU SETTINGS ###\n"
        ));
        assert!(out.ends_with("host all all all reject # Refuse by default\n### END JUJU SETTINGS ###"));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let peers = vec![peer("postgresql/1", "10.0.0.2")];
        let once = compile("local all all trust", &peers, "10.1.0.0/16", "# note", false);
        let twice = compile(&once, &peers, "10.1.0.0/16", "# note", false);
        assert_eq!(once, twice);
    }
}
