//! WolfPG Configuration
//!
//! This module provides configuration structures for the WolfPG
//! replicated PostgreSQL controller. The `[options]` table is the
//! declarative configuration source: it is read once per invocation and
//! treated as an immutable snapshot for the whole reconciliation pass.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main WolfPG configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfPgConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// PostgreSQL workload configuration
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Peer directory configuration
    pub peers: PeersConfig,

    /// Command execution configuration
    #[serde(default)]
    pub exec: ExecConfig,

    /// Operator-supplied options
    #[serde(default)]
    pub options: OptionsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unit identity, e.g. `postgresql/0`
    pub unit: String,

    /// Address at which peers reach this node
    pub ingress_address: String,

    /// Directory for the local state database and generated credentials
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Whether this node is the platform's control-plane leader
    #[serde(default)]
    pub leader: bool,
}

/// PostgreSQL workload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Major version string, e.g. "12"
    #[serde(default = "default_pg_version")]
    pub version: String,

    /// Data directory (defaults to /var/lib/postgresql/<version>/main)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Configuration directory (defaults to /etc/postgresql/<version>/main)
    #[serde(default)]
    pub etc_dir: Option<PathBuf>,

    /// Directory holding the server binaries (`pg_ctl`); defaults to the
    /// Debian layout for the configured version
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Service name known to the supervisor
    #[serde(default = "default_service")]
    pub service: String,

    /// Listening port
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Operating-system account owning the cluster files
    #[serde(default = "default_system_user")]
    pub system_user: String,

    /// Derive shared_buffers / effective_cache_size from detected RAM
    #[serde(default = "default_true")]
    pub auto_tune: bool,

    /// Fail hard on malformed extra_pg_conf lines instead of blocking
    #[serde(default = "default_true")]
    pub strict_parsing: bool,
}

/// Peer directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// Shared directory holding one record file per node
    pub directory: PathBuf,
}

/// How administrative commands reach the workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// Run commands as local processes
    #[default]
    Local,
    /// Run commands through `kubectl exec` using `options.kubeconfig`
    Kubectl,
}

/// Command execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default)]
    pub mode: ExecMode,

    /// Kubernetes namespace of the workload pod
    #[serde(default)]
    pub namespace: Option<String>,

    /// Workload pod name (defaults to the contents of /etc/hostname)
    #[serde(default)]
    pub pod: Option<String>,

    /// kubectl binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// Timeout for a single command in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
}

/// Operator-supplied options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionsConfig {
    /// Free-text postgresql.conf overrides
    #[serde(default = "default_extra_pg_conf")]
    pub extra_pg_conf: String,

    /// Free-text pg_hba.conf rules
    #[serde(default)]
    pub extra_pg_auth: String,

    /// Comma-separated administrative address allow-list
    #[serde(default)]
    pub admin_addresses: String,

    /// Base64-encoded PEM certificate (leaf followed by chain)
    #[serde(default)]
    pub ssl_cert: String,

    /// Base64-encoded PEM private key
    #[serde(default)]
    pub ssl_key: String,

    /// Opaque kubeconfig used by the kubectl runner
    #[serde(default)]
    pub kubeconfig: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfpg")
}

fn default_pg_version() -> String {
    "12".to_string()
}

fn default_service() -> String {
    "postgresql".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_system_user() -> String {
    "postgres".to_string()
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_true() -> bool {
    true
}

fn default_extra_pg_conf() -> String {
    crate::pgconf::settings::DEFAULT_EXTRA_PG_CONF.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            version: default_pg_version(),
            data_dir: None,
            etc_dir: None,
            bin_dir: None,
            service: default_service(),
            port: default_pg_port(),
            system_user: default_system_user(),
            auto_tune: true,
            strict_parsing: true,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            mode: ExecMode::Local,
            namespace: None,
            pod: None,
            kubectl: default_kubectl(),
            timeout_secs: 0,
        }
    }
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            extra_pg_conf: default_extra_pg_conf(),
            extra_pg_auth: String::new(),
            admin_addresses: String::new(),
            ssl_cert: String::new(),
            ssl_key: String::new(),
            kubeconfig: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl OptionsConfig {
    /// TLS is enabled when both certificate and key material are present
    pub fn tls_enabled(&self) -> bool {
        !self.ssl_cert.trim().is_empty() && !self.ssl_key.trim().is_empty()
    }
}

impl WolfPgConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfPgConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfPgConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.unit.is_empty() {
            return Err(crate::Error::Config("node.unit cannot be empty".into()));
        }

        if self.node.ingress_address.is_empty() {
            return Err(crate::Error::Config(
                "node.ingress_address cannot be empty".into(),
            ));
        }

        if self.major_version().is_none() {
            return Err(crate::Error::Config(format!(
                "postgres.version {:?} is not a major version number",
                self.postgres.version
            )));
        }

        if self.exec.mode == ExecMode::Kubectl && self.options.kubeconfig.trim().is_empty() {
            return Err(crate::Error::Config(
                "exec.mode = \"kubectl\" requires options.kubeconfig".into(),
            ));
        }

        if self.options.ssl_cert.trim().is_empty() != self.options.ssl_key.trim().is_empty() {
            tracing::warn!("Only one of ssl_cert / ssl_key is set, SSL stays disabled");
        }

        Ok(())
    }

    /// Major PostgreSQL version as a number ("9.6" -> 9, "12" -> 12)
    pub fn major_version(&self) -> Option<u32> {
        self.postgres
            .version
            .split('.')
            .next()
            .and_then(|v| v.trim().parse().ok())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> PathBuf {
        self.postgres.data_dir.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/var/lib/postgresql/{}/main", self.postgres.version))
        })
    }

    /// Get the configuration directory path
    pub fn etc_dir(&self) -> PathBuf {
        self.postgres.etc_dir.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/etc/postgresql/{}/main", self.postgres.version))
        })
    }

    /// Path of a server binary
    pub fn pg_bin(&self, name: &str) -> PathBuf {
        self.postgres
            .bin_dir
            .clone()
            .unwrap_or_else(|| {
                PathBuf::from(format!("/usr/lib/postgresql/{}/bin", self.postgres.version))
            })
            .join(name)
    }

    pub fn postgresql_conf_path(&self) -> PathBuf {
        self.etc_dir().join("postgresql.conf")
    }

    pub fn pg_hba_conf_path(&self) -> PathBuf {
        self.etc_dir().join("pg_hba.conf")
    }

    pub fn pg_ident_conf_path(&self) -> PathBuf {
        self.etc_dir().join("pg_ident.conf")
    }

    /// Standby settings included from postgresql.conf on 12+
    pub fn hot_standby_conf_path(&self) -> PathBuf {
        self.etc_dir().join("juju_recovery.conf")
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> &PathBuf {
        &self.node.state_dir
    }

    /// Get the command timeout, if any
    pub fn exec_timeout(&self) -> Option<Duration> {
        match self.exec.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[node]
unit = "postgresql/1"
ingress_address = "10.0.0.2"

[peers]
directory = "/srv/wolfpg/peers"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = WolfPgConfig::from_str(MINIMAL).unwrap();
        assert_eq!(config.node.unit, "postgresql/1");
        assert!(!config.node.leader);
        assert_eq!(config.major_version(), Some(12));
        assert_eq!(
            config.postgresql_conf_path(),
            PathBuf::from("/etc/postgresql/12/main/postgresql.conf")
        );
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/postgresql/12/main"));
        assert_eq!(config.pg_bin("pg_ctl"), PathBuf::from("/usr/lib/postgresql/12/bin/pg_ctl"));
        assert_eq!(config.exec.mode, ExecMode::Local);
        assert!(!config.options.tls_enabled());
        assert!(config.options.extra_pg_conf.contains("max_connections"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[node]
unit = "postgresql/0"
ingress_address = "10.0.0.1"
state_dir = "/tmp/wolfpg"
leader = true

[postgres]
version = "9.6"
port = 5433
auto_tune = false

[peers]
directory = "/srv/peers"

[exec]
mode = "kubectl"
namespace = "db"
pod = "postgresql-0"

[options]
extra_pg_conf = "max_connections = 10"
admin_addresses = "192.168.1.0/24"
kubeconfig = "apiVersion: v1"
"#;
        let config = WolfPgConfig::from_str(toml).unwrap();
        assert!(config.node.leader);
        assert_eq!(config.major_version(), Some(9));
        assert_eq!(config.postgres.port, 5433);
        assert_eq!(config.exec.mode, ExecMode::Kubectl);
        assert_eq!(config.exec.pod.as_deref(), Some("postgresql-0"));
    }

    #[test]
    fn test_kubectl_requires_kubeconfig() {
        let toml = format!("{}\n[exec]\nmode = \"kubectl\"\n", MINIMAL);
        assert!(matches!(
            WolfPgConfig::from_str(&toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_empty_unit_rejected() {
        let toml = MINIMAL.replace("postgresql/1", "");
        assert!(WolfPgConfig::from_str(&toml).is_err());
    }
}
