//! Standby bootstrap
//!
//! A standby is a byte copy of the primary's data directory, taken with
//! `pg_basebackup`, that then follows the primary's write-ahead log. The
//! copy is redone whenever the primary changes.
//!
//! ```text
//! Uncloned --> Cloning --> Streaming
//!                 |
//!                 +------> Failed
//! ```

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::REPLICATION_USER;
use crate::config::WolfPgConfig;
use crate::error::{Error, Result};
use crate::executor::{push_if_changed, CommandRunner, ExecRequest, FileSpec, FileStore, Supervisor};
use crate::pgconf::{self, render_recovery, RecoveryParams, RecoveryTemplate};
use crate::state::{Role, StateTracker};

/// Where the local copy stands
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapPhase {
    #[default]
    Uncloned,
    /// A copy was started and has not finished
    Cloning,
    Streaming,
    /// The last copy failed
    Failed(String),
}

impl fmt::Display for BootstrapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapPhase::Uncloned => write!(f, "UNCLONED"),
            BootstrapPhase::Cloning => write!(f, "CLONING"),
            BootstrapPhase::Streaming => write!(f, "STREAMING"),
            BootstrapPhase::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

/// Persisted bootstrap progress of a standby
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Address of the primary the data directory was copied from
    pub cloned_from: Option<String>,
    pub phase: BootstrapPhase,
}

impl ReplicationState {
    /// Whether the data directory has to be (re)copied from `primary_address`
    pub fn needs_clone(&self, primary_address: &str) -> bool {
        match self.phase {
            BootstrapPhase::Cloning | BootstrapPhase::Failed(_) => true,
            BootstrapPhase::Uncloned | BootstrapPhase::Streaming => {
                self.cloned_from.as_deref() != Some(primary_address)
            }
        }
    }
}

/// What [`Bootstrapper::ensure_standby`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Already following the primary; `recovery_changed` tells whether
    /// the recovery settings had to be rewritten
    UpToDate { recovery_changed: bool },
    /// A fresh copy was taken
    Cloned,
}

/// Drives the standby bootstrap for the local node
pub struct Bootstrapper {
    config: Arc<WolfPgConfig>,
    files: Arc<dyn FileStore>,
    runner: Arc<dyn CommandRunner>,
    supervisor: Arc<dyn Supervisor>,
    tracker: Arc<StateTracker>,
}

impl Bootstrapper {
    pub fn new(
        config: Arc<WolfPgConfig>,
        files: Arc<dyn FileStore>,
        runner: Arc<dyn CommandRunner>,
        supervisor: Arc<dyn Supervisor>,
        tracker: Arc<StateTracker>,
    ) -> Self {
        Self {
            config,
            files,
            runner,
            supervisor,
            tracker,
        }
    }

    fn major_version(&self) -> Result<u32> {
        self.config.major_version().ok_or_else(|| {
            Error::Config(format!("invalid postgres.version {:?}", self.config.postgres.version))
        })
    }

    fn owned(&self, mode: u32) -> FileSpec {
        FileSpec::owned_by(&self.config.postgres.system_user, mode)
    }

    fn standby_signal_path(&self) -> PathBuf {
        self.config.data_dir().join("standby.signal")
    }

    fn recovery_conf_path(&self) -> PathBuf {
        self.config.data_dir().join("recovery.conf")
    }

    /// Make sure this standby follows the elected primary, cloning it if
    /// needed.
    ///
    /// Fails with [`Error::ClonePrimary`] when a precondition does not hold
    /// (the state is left as it was) or when the copy fails (the state
    /// becomes `Failed`).
    pub async fn ensure_standby(&self, role: &Role, password: &str) -> Result<BootstrapOutcome> {
        let primary = match role {
            Role::Primary => {
                return Err(Error::ClonePrimary("this node is the elected primary".into()));
            }
            Role::Standby { primary } => primary
                .as_ref()
                .ok_or_else(|| Error::ClonePrimary("no primary has been elected".into()))?,
        };
        let address = primary.address().ok_or_else(|| {
            Error::ClonePrimary(format!("{} has not published an address", primary.node))
        })?;

        let state = self.tracker.replication_state().await?;
        if !state.needs_clone(address) {
            let recovery_changed = self.write_recovery(address, password).await?;
            return Ok(BootstrapOutcome::UpToDate { recovery_changed });
        }

        if self.supervisor.is_running().await? {
            return Err(Error::ClonePrimary(
                "the database service must be stopped before cloning".into(),
            ));
        }

        self.clone_from(address, password).await?;
        Ok(BootstrapOutcome::Cloned)
    }

    async fn clone_from(&self, address: &str, password: &str) -> Result<()> {
        let mut state = ReplicationState {
            cloned_from: None,
            phase: BootstrapPhase::Cloning,
        };
        self.tracker.set_replication_state(&state).await?;
        tracing::info!(primary = address, "Cloning standby from primary");

        let data_dir = self.config.data_dir();
        self.files.remove(&data_dir, true).await?;
        self.files.make_dir(&data_dir, &self.owned(0o700)).await?;
        self.write_baseline_auth().await?;

        let request = self.basebackup_request(address, password)?;
        let output = self.runner.run(&request).await?;
        if !output.success() {
            let detail = format!(
                "pg_basebackup from {} exited with {:?}: {}",
                address,
                output.code,
                output.stderr.trim()
            );
            tracing::error!("{}", detail);
            state.phase = BootstrapPhase::Failed(detail.clone());
            self.tracker.set_replication_state(&state).await?;
            return Err(Error::ClonePrimary(detail));
        }

        self.write_recovery(address, password).await?;

        state = ReplicationState {
            cloned_from: Some(address.to_string()),
            phase: BootstrapPhase::Streaming,
        };
        self.tracker.set_replication_state(&state).await?;
        tracing::info!(primary = address, "Standby cloned, streaming from primary");
        Ok(())
    }

    /// Authentication files the server needs to come up before the real
    /// ones are rendered
    async fn write_baseline_auth(&self) -> Result<()> {
        let hba_path = self.config.pg_hba_conf_path();
        let existing = self.files.pull(&hba_path).await?.unwrap_or_default();
        let hba = pgconf::compile(&existing, &[], "", "", false);
        push_if_changed(self.files.as_ref(), &hba_path, &hba, &self.owned(0o640).make_dirs()).await?;

        let ident_path = self.config.pg_ident_conf_path();
        let existing = self.files.pull(&ident_path).await?.unwrap_or_default();
        let ident = pgconf::ensure_ident_mapping(&existing);
        push_if_changed(self.files.as_ref(), &ident_path, &ident, &self.owned(0o640).make_dirs()).await?;
        Ok(())
    }

    /// `pg_basebackup` invocation copying the primary into the data directory
    pub fn basebackup_request(&self, address: &str, password: &str) -> Result<ExecRequest> {
        let wal_method = if self.major_version()? >= 10 {
            "--wal-method=stream"
        } else {
            "--xlog-method=stream"
        };
        let data_dir = self.config.data_dir().display().to_string();
        let port = self.config.postgres.port.to_string();

        Ok(ExecRequest::new([
            "pg_basebackup",
            "-D",
            data_dir.as_str(),
            "-h",
            address,
            "-p",
            port.as_str(),
            "-U",
            REPLICATION_USER,
            "--no-password",
            wal_method,
        ])
        .env("PGPASSWORD", password)
        .user(&self.config.postgres.system_user))
    }

    /// Render the recovery settings pointing at `address`.
    /// Returns whether any file changed.
    pub async fn write_recovery(&self, address: &str, password: &str) -> Result<bool> {
        let template = RecoveryTemplate::for_version(self.major_version()?);
        let params = RecoveryParams {
            host: address.to_string(),
            port: self.config.postgres.port,
            user: REPLICATION_USER.to_string(),
            password: password.to_string(),
        };
        let rendered = render_recovery(template, &params)?;

        let path = match template {
            RecoveryTemplate::StandbyInclude => self.config.hot_standby_conf_path(),
            RecoveryTemplate::RecoveryConf => self.recovery_conf_path(),
        };
        let spec = self.owned(0o600).make_dirs();
        let mut changed = push_if_changed(self.files.as_ref(), &path, &rendered, &spec).await?;

        if template.needs_standby_signal() {
            let signal = self.standby_signal_path();
            if !self.files.exists(&signal).await? {
                self.files.push(&signal, "", &self.owned(0o600)).await?;
                changed = true;
            }
        }

        Ok(changed)
    }

    /// Primary-side duty: drop every trace of standby configuration and
    /// forget the replication state. Returns whether any file was removed.
    pub async fn clear_standby_files(&self) -> Result<bool> {
        let mut removed = false;
        for path in [
            self.standby_signal_path(),
            self.recovery_conf_path(),
            self.config.hot_standby_conf_path(),
        ] {
            if self.files.exists(&path).await? {
                self.files.remove(&path, false).await?;
                tracing::info!("Removed standby file {}", path.display());
                removed = true;
            }
        }

        self.tracker.clear_replication_state().await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecOutput, MemoryFiles, MemoryRunner, MemorySupervisor};
    use crate::state::{NodeId, PeerRecord};
    use std::path::Path;

    struct Fixture {
        files: Arc<MemoryFiles>,
        runner: Arc<MemoryRunner>,
        supervisor: Arc<MemorySupervisor>,
        tracker: Arc<StateTracker>,
        bootstrap: Bootstrapper,
    }

    fn fixture(version: &str) -> Fixture {
        let config = WolfPgConfig::from_str(&format!(
            r#"
[node]
unit = "postgresql/1"
ingress_address = "10.0.0.3"

[postgres]
version = "{}"
data_dir = "/data"
etc_dir = "/etc/pg"

[peers]
directory = "/shared"
"#,
            version
        ))
        .unwrap();

        let files = Arc::new(MemoryFiles::new());
        let runner = Arc::new(MemoryRunner::new());
        let supervisor = Arc::new(MemorySupervisor::new());
        let tracker = Arc::new(StateTracker::in_memory("postgresql/1".into()).unwrap());
        let bootstrap = Bootstrapper::new(
            Arc::new(config),
            files.clone(),
            runner.clone(),
            supervisor.clone(),
            tracker.clone(),
        );
        Fixture {
            files,
            runner,
            supervisor,
            tracker,
            bootstrap,
        }
    }

    fn standby_of(address: &str) -> Role {
        let mut primary = PeerRecord::empty(NodeId::new("postgresql/0"));
        primary.ingress_address = Some(address.to_string());
        Role::Standby {
            primary: Some(primary),
        }
    }

    #[test]
    fn test_needs_clone() {
        let streaming = ReplicationState {
            cloned_from: Some("10.0.0.1".into()),
            phase: BootstrapPhase::Streaming,
        };
        assert!(!streaming.needs_clone("10.0.0.1"));
        assert!(streaming.needs_clone("10.0.0.2"));
        assert!(ReplicationState::default().needs_clone("10.0.0.1"));

        let interrupted = ReplicationState {
            cloned_from: Some("10.0.0.1".into()),
            phase: BootstrapPhase::Cloning,
        };
        assert!(interrupted.needs_clone("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_new_primary_triggers_reclone() {
        let f = fixture("14");
        f.tracker
            .set_replication_state(&ReplicationState {
                cloned_from: Some("10.0.0.1".into()),
                phase: BootstrapPhase::Streaming,
            })
            .await
            .unwrap();
        f.files.insert("/data/PG_VERSION", "14");

        let outcome = f.bootstrap.ensure_standby(&standby_of("10.0.0.2"), "pw").await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Cloned);

        let backups = f.runner.requests_for("pg_basebackup");
        assert_eq!(backups.len(), 1);
        assert_eq!(
            backups[0].argv,
            vec![
                "pg_basebackup", "-D", "/data", "-h", "10.0.0.2", "-p", "5432", "-U", "_juju_repl",
                "--no-password", "--wal-method=stream",
            ]
        );
        assert_eq!(backups[0].env, vec![("PGPASSWORD".to_string(), "pw".to_string())]);
        assert_eq!(backups[0].user.as_deref(), Some("postgres"));

        // The old copy is gone and the directory recreated private.
        assert!(f.files.contents(Path::new("/data/PG_VERSION")).is_none());
        assert_eq!(f.files.spec(Path::new("/data")).unwrap().mode, 0o700);

        let recovery = f.files.contents(Path::new("/etc/pg/juju_recovery.conf")).unwrap();
        assert!(recovery.contains("host=10.0.0.2"));
        assert!(f.files.exists(Path::new("/data/standby.signal")).await.unwrap());
        assert!(f.files.contents(Path::new("/etc/pg/pg_hba.conf")).unwrap().contains("Refuse by default"));
        assert!(f.files.contents(Path::new("/etc/pg/pg_ident.conf")).is_some());

        let state = f.tracker.replication_state().await.unwrap();
        assert_eq!(state.cloned_from.as_deref(), Some("10.0.0.2"));
        assert_eq!(state.phase, BootstrapPhase::Streaming);
    }

    #[tokio::test]
    async fn test_up_to_date_standby_is_not_recloned() {
        let f = fixture("14");
        f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap();
        let outcome = f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::UpToDate { recovery_changed: false });
        assert_eq!(f.runner.requests_for("pg_basebackup").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_backup_is_recorded_and_retried() {
        let f = fixture("14");
        f.runner
            .respond("pg_basebackup", ExecOutput::failed(1, "could not connect to server"));

        let err = f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap_err();
        assert!(matches!(err, Error::ClonePrimary(ref m) if m.contains("could not connect")));
        assert!(matches!(
            f.tracker.replication_state().await.unwrap().phase,
            BootstrapPhase::Failed(_)
        ));

        let outcome = f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap();
        assert_eq!(outcome, BootstrapOutcome::Cloned);
    }

    #[tokio::test]
    async fn test_preconditions_leave_state_alone() {
        let f = fixture("14");
        f.supervisor.set_running(true);
        let err = f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap_err();
        assert!(matches!(err, Error::ClonePrimary(_)));

        let no_primary = Role::Standby { primary: None };
        assert!(f.bootstrap.ensure_standby(&no_primary, "pw").await.is_err());
        assert!(f.bootstrap.ensure_standby(&Role::Primary, "pw").await.is_err());
        assert!(f.bootstrap.ensure_standby(&standby_of(""), "pw").await.is_err());

        assert_eq!(f.tracker.replication_state().await.unwrap(), ReplicationState::default());
        assert!(f.runner.requests().is_empty());
    }

    #[tokio::test]
    async fn test_old_versions_use_recovery_conf() {
        let f = fixture("9.6");
        f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap();

        let backup = &f.runner.requests_for("pg_basebackup")[0];
        assert!(backup.argv.contains(&"--xlog-method=stream".to_string()));

        let recovery = f.files.contents(Path::new("/data/recovery.conf")).unwrap();
        assert!(recovery.contains("standby_mode = on"));
        assert!(!f.files.exists(Path::new("/data/standby.signal")).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_standby_files() {
        let f = fixture("14");
        f.bootstrap.ensure_standby(&standby_of("10.0.0.1"), "pw").await.unwrap();

        assert!(f.bootstrap.clear_standby_files().await.unwrap());
        assert!(!f.files.exists(Path::new("/data/standby.signal")).await.unwrap());
        assert!(!f.files.exists(Path::new("/etc/pg/juju_recovery.conf")).await.unwrap());
        assert_eq!(f.tracker.replication_state().await.unwrap(), ReplicationState::default());

        assert!(!f.bootstrap.clear_standby_files().await.unwrap());
    }
}
