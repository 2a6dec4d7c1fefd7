//! Standby recovery settings
//!
//! PostgreSQL 12 moved the recovery parameters into the regular
//! configuration: the standby settings go to `juju_recovery.conf` (pulled in
//! by `include_if_exists` from postgresql.conf) and an empty
//! `standby.signal` in the data directory switches the server into standby
//! mode. Older releases read `recovery.conf` from the data directory.

use minijinja::{context, Environment};
use serde::Serialize;

use super::render::quote_value;
use crate::error::Result;

const RECOVERY_CONF: &str = "\
# Managed by wolfpg. Changes will be overwritten.
standby_mode = on
recovery_target_timeline = 'latest'
primary_conninfo = {{ conninfo | pgquote }}
";

const JUJU_RECOVERY_CONF: &str = "\
# Managed by wolfpg. Changes will be overwritten.
recovery_target_timeline = 'latest'
primary_conninfo = {{ conninfo | pgquote }}
";

/// Which recovery template to render
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTemplate {
    /// `recovery.conf` in the data directory (before 12)
    RecoveryConf,
    /// `juju_recovery.conf` next to postgresql.conf (12 and later)
    StandbyInclude,
}

impl RecoveryTemplate {
    pub fn for_version(major_version: u32) -> Self {
        if major_version >= 12 {
            RecoveryTemplate::StandbyInclude
        } else {
            RecoveryTemplate::RecoveryConf
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecoveryTemplate::RecoveryConf => "recovery.conf",
            RecoveryTemplate::StandbyInclude => "juju_recovery.conf",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            RecoveryTemplate::RecoveryConf => RECOVERY_CONF,
            RecoveryTemplate::StandbyInclude => JUJU_RECOVERY_CONF,
        }
    }

    /// Whether an empty `standby.signal` must accompany the settings
    pub fn needs_standby_signal(&self) -> bool {
        matches!(self, RecoveryTemplate::StandbyInclude)
    }
}

/// Streaming replication parameters
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl RecoveryParams {
    /// libpq connection string
    pub fn conninfo(&self) -> String {
        format!(
            "host={} port={} user={} password={}",
            libpq_quote(&self.host),
            self.port,
            libpq_quote(&self.user),
            libpq_quote(&self.password)
        )
    }
}

/// Quote a conninfo value when it contains anything libpq would split on
fn libpq_quote(value: &str) -> String {
    if !value.is_empty() && !value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Render the recovery settings for the given template
pub fn render_recovery(template: RecoveryTemplate, params: &RecoveryParams) -> Result<String> {
    let mut env = Environment::new();
    env.add_filter("pgquote", |value: String| quote_value(&value));
    env.add_template(template.name(), template.source())?;

    let tmpl = env.get_template(template.name())?;
    let rendered = tmpl.render(context! {
        conninfo => params.conninfo(),
        host => &params.host,
        port => params.port,
        user => &params.user,
    })?;

    Ok(rendered)
}
