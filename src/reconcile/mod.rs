//! Reconciliation Driver
//!
//! One pass brings the node in line with the declarative options and the
//! peer directory: elect, distribute credentials, bootstrap standbys,
//! render the configuration files and start or restart the service.
//! Every notification runs the same pass; the pass is level triggered and
//! safe to repeat.

mod credentials;
mod tls;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use credentials::{generate_password, PASSWORD_LENGTH};
pub use tls::{TlsMaterial, TlsPaths};

use crate::config::WolfPgConfig;
use crate::error::{Error, Result};
use crate::executor::{push_if_changed, CommandRunner, ExecRequest, FileSpec, FileStore, Supervisor};
use crate::pgconf::{self, render::quote_value, ParseMode};
use crate::replication::{BootstrapOutcome, Bootstrapper, ReplicationState};
use crate::state::{ElectionCoordinator, NodeId, PeerDirectory, Relation, Role, StateTracker};
use crate::tuning::MemoryTuning;

/// Change notification that triggered a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Event {
    Start,
    ConfigChanged,
    PeerJoined,
    PeerChanged,
    PeerDeparted,
    LeaderElected,
    Upgrade,
    WorkloadReady,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Event::Start => "start",
            Event::ConfigChanged => "config-changed",
            Event::PeerJoined => "peer-joined",
            Event::PeerChanged => "peer-changed",
            Event::PeerDeparted => "peer-departed",
            Event::LeaderElected => "leader-elected",
            Event::Upgrade => "upgrade",
            Event::WorkloadReady => "workload-ready",
        };
        write!(f, "{}", name)
    }
}

/// Whether the pass ran or has to be retried later
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Defer(String),
}

/// Status reported to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    Active(String),
    Blocked(String),
    Waiting(String),
    Maintenance(String),
}

impl UnitStatus {
    pub fn name(&self) -> &'static str {
        match self {
            UnitStatus::Active(_) => "active",
            UnitStatus::Blocked(_) => "blocked",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Maintenance(_) => "maintenance",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Blocked(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Maintenance(m) => m,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message())
    }
}

/// What the pass did to the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Unchanged,
    Started,
    Restarted,
    Stopped,
}

/// Result of one pass
#[derive(Debug, Clone, PartialEq)]
pub struct PassOutcome {
    pub flow: Flow,
    pub status: UnitStatus,
    /// Configuration files rewritten by the pass
    pub changed: Vec<PathBuf>,
    pub service: ServiceAction,
}

impl PassOutcome {
    fn deferred(reason: String) -> Self {
        Self {
            flow: Flow::Defer(reason.clone()),
            status: UnitStatus::Waiting(reason),
            changed: Vec::new(),
            service: ServiceAction::Unchanged,
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            flow: Flow::Proceed,
            status: UnitStatus::Blocked(reason),
            changed: Vec::new(),
            service: ServiceAction::Unchanged,
        }
    }
}

/// Read-only summary for `wolfpg status`
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub node: NodeId,
    pub is_primary: bool,
    pub primary: Option<NodeId>,
    pub peers: Vec<NodeId>,
    pub replication: ReplicationState,
    pub last_status: Option<UnitStatus>,
    pub passes: u64,
}

/// The reconciliation driver
pub struct Reconciler {
    config: Arc<WolfPgConfig>,
    relation: Relation,
    election: ElectionCoordinator,
    supervisor: Arc<dyn Supervisor>,
    files: Arc<dyn FileStore>,
    runner: Arc<dyn CommandRunner>,
    tracker: Arc<StateTracker>,
    bootstrap: Bootstrapper,
    tuning: Option<MemoryTuning>,
}

impl Reconciler {
    pub fn new(
        config: Arc<WolfPgConfig>,
        directory: Arc<dyn PeerDirectory>,
        supervisor: Arc<dyn Supervisor>,
        files: Arc<dyn FileStore>,
        runner: Arc<dyn CommandRunner>,
        tracker: Arc<StateTracker>,
    ) -> Self {
        let tuning = config.postgres.auto_tune.then(MemoryTuning::detect);
        let bootstrap = Bootstrapper::new(
            config.clone(),
            files.clone(),
            runner.clone(),
            supervisor.clone(),
            tracker.clone(),
        );

        Self {
            config,
            relation: Relation::peer(directory.clone()),
            election: ElectionCoordinator::new(directory),
            supervisor,
            files,
            runner,
            tracker,
            bootstrap,
            tuning,
        }
    }

    /// Override the detected memory tuning
    pub fn with_tuning(mut self, tuning: Option<MemoryTuning>) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn election(&self) -> &ElectionCoordinator {
        &self.election
    }

    /// Run one pass for `event`. `is_leader` tells whether this node is the
    /// platform's control-plane leader, the only node allowed to claim
    /// primary.
    pub async fn reconcile(&self, event: Event, is_leader: bool) -> Result<PassOutcome> {
        tracing::info!(
            event = %event,
            leader = is_leader,
            node = %self.relation.local(),
            "Reconciliation pass started"
        );

        let outcome = match self.pass(is_leader).await {
            Ok(outcome) => outcome,
            Err(e) if e.should_defer() => {
                tracing::warn!("Deferring pass: {}", e);
                PassOutcome::deferred(e.to_string())
            }
            Err(e @ Error::MalformedConfigLine { .. }) if self.config.postgres.strict_parsing => {
                return Err(e);
            }
            Err(e) if e.is_blocking() => {
                tracing::error!("Pass blocked: {}", e);
                PassOutcome::blocked(e.to_string())
            }
            Err(e) => return Err(e),
        };

        self.tracker.set_last_status(&outcome.status).await?;
        let passes = self.tracker.record_pass().await?;
        tracing::info!(
            status = %outcome.status,
            changed = outcome.changed.len(),
            service = ?outcome.service,
            passes = passes,
            "Reconciliation pass finished"
        );
        Ok(outcome)
    }

    fn major_version(&self) -> Result<u32> {
        self.config.major_version().ok_or_else(|| {
            Error::Config(format!("invalid postgres.version {:?}", self.config.postgres.version))
        })
    }

    fn owned(&self, mode: u32) -> FileSpec {
        FileSpec::owned_by(&self.config.postgres.system_user, mode).make_dirs()
    }

    async fn pass(&self, is_leader: bool) -> Result<PassOutcome> {
        let options = &self.config.options;

        if !self.supervisor.can_connect().await {
            return Ok(PassOutcome::deferred("waiting for the database runtime".into()));
        }

        // Operator inputs are checked before anything is written.
        let major = self.major_version()?;
        let mut settings = pgconf::assemble(
            &options.extra_pg_conf,
            major,
            self.tuning.as_ref(),
            ParseMode::from_strict(self.config.postgres.strict_parsing),
        )?;
        let tls = if options.tls_enabled() {
            Some(TlsMaterial::decode(&options.ssl_cert, &options.ssl_key)?)
        } else {
            None
        };

        self.relation.publish_address(&self.config.node.ingress_address).await?;
        let mut role = self.election.evaluate_and_converge().await?;
        if is_leader && role == (Role::Standby { primary: None }) {
            self.election.set_as_primary().await?;
            role = self.election.evaluate_and_converge().await?;
        }

        let mut service = ServiceAction::Unchanged;
        let mut restart_needed = false;
        let password = credentials::replication_password(&self.relation, &role).await?;
        if let Some(password) = &password {
            credentials::write_pgpass(self.files.as_ref(), &self.config.postgres.system_user, password)
                .await?;
        }

        let (status, may_start) = match (&role, &password) {
            (Role::Primary, _) => {
                restart_needed |= self.bootstrap.clear_standby_files().await?;
                (UnitStatus::Active("Live primary".into()), true)
            }
            (Role::Standby { primary: None }, _) => (
                UnitStatus::Waiting("Waiting for a primary to be elected".into()),
                false,
            ),
            (Role::Standby { primary: Some(primary) }, None) => (
                UnitStatus::Waiting(format!(
                    "Waiting for replication credentials from {}",
                    primary.node
                )),
                false,
            ),
            (Role::Standby { primary: Some(primary) }, Some(password)) => {
                // Never run against a data directory about to be replaced.
                // Without an address there is nothing to clone from yet,
                // so a running standby is left alone.
                if let Some(address) = primary.address() {
                    if self.tracker.replication_state().await?.needs_clone(address)
                        && self.supervisor.is_running().await?
                    {
                        self.stop_database().await?;
                        service = ServiceAction::Stopped;
                    }
                }

                match self.bootstrap.ensure_standby(&role, password).await {
                    Ok(BootstrapOutcome::Cloned) => (
                        UnitStatus::Active(format!("Live standby of {}", primary.node)),
                        true,
                    ),
                    Ok(BootstrapOutcome::UpToDate { recovery_changed }) => {
                        restart_needed |= recovery_changed;
                        (UnitStatus::Active(format!("Live standby of {}", primary.node)), true)
                    }
                    Err(Error::ClonePrimary(reason)) => {
                        tracing::error!("Standby bootstrap blocked: {}", reason);
                        (UnitStatus::Blocked(reason), false)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        if let Some(material) = &tls {
            let paths = TlsPaths::in_dir(&self.config.etc_dir());
            restart_needed |= material
                .write(self.files.as_ref(), &paths, &self.config.postgres.system_user)
                .await?;
            material.apply(&mut settings, &paths);
        }

        let changed = self.render_files(&settings, major, tls.is_some()).await?;
        let settings_changed = self.tracker.settings_snapshot().await?.as_ref() != Some(&settings);
        restart_needed |= !changed.is_empty() || settings_changed;

        if may_start {
            if !self.supervisor.is_running().await? {
                self.supervisor.start().await?;
                service = ServiceAction::Started;
            } else if restart_needed {
                self.stop_database().await?;
                self.supervisor.start().await?;
                service = ServiceAction::Restarted;
            }

            if let (Role::Primary, Some(password)) = (&role, &password) {
                credentials::ensure_replication_role(self.runner.as_ref(), password).await;
            }

            // Saved only once the service runs with these settings, so an
            // interrupted pass restarts next time.
            self.tracker.set_settings_snapshot(&settings).await?;
        }

        Ok(PassOutcome {
            flow: Flow::Proceed,
            status,
            changed,
            service,
        })
    }

    /// Regenerate postgresql.conf, pg_hba.conf and pg_ident.conf, pushing
    /// only the ones that changed
    async fn render_files(
        &self,
        settings: &pgconf::Settings,
        major: u32,
        tls: bool,
    ) -> Result<Vec<PathBuf>> {
        let options = &self.config.options;
        let files = self.files.as_ref();
        let mut changed = Vec::new();

        let conf_path = self.config.postgresql_conf_path();
        let existing = files.pull(&conf_path).await?.unwrap_or_default();
        let conf = pgconf::render(&existing, settings, &managed_extra_lines(&self.config, major, tls))?;

        let hba_path = self.config.pg_hba_conf_path();
        let existing = files.pull(&hba_path).await?.unwrap_or_default();
        let peers = self.relation.remote_records().await?;
        let hba = pgconf::compile(
            &existing,
            &peers,
            &options.admin_addresses,
            &options.extra_pg_auth,
            tls,
        );

        let ident_path = self.config.pg_ident_conf_path();
        let existing = files.pull(&ident_path).await?.unwrap_or_default();
        let ident = pgconf::ensure_ident_mapping(&existing);

        for (path, contents, mode) in [
            (conf_path, conf, 0o644),
            (hba_path, hba, 0o640),
            (ident_path, ident, 0o640),
        ] {
            if push_if_changed(files, &path, &contents, &self.owned(mode)).await? {
                changed.push(path);
            }
        }

        Ok(changed)
    }

    /// Fast shutdown through pg_ctl, then the supervisor.
    ///
    /// The supervisor's own stop signal makes the server wait for clients
    /// to disconnect, so the server is told to stop first.
    async fn stop_database(&self) -> Result<()> {
        let pg_ctl = self.config.pg_bin("pg_ctl").display().to_string();
        let data_dir = self.config.data_dir().display().to_string();
        let request = ExecRequest::new([pg_ctl.as_str(), "stop", "-D", data_dir.as_str(), "-m", "fast"])
            .user(&self.config.postgres.system_user);

        let output = self.runner.run(&request).await?;
        if !output.success() {
            tracing::warn!(
                "`{}` exited with {:?}: {}",
                request,
                output.code,
                output.stderr.trim()
            );
        }
        self.supervisor.stop().await
    }

    /// Withdraw this node from the peer directory so the others stop
    /// counting its claim and stop admitting its address
    pub async fn depart(&self) -> Result<()> {
        self.relation.directory().depart().await?;
        tracing::info!(node = %self.relation.local(), "Removed node record from the peer directory");
        Ok(())
    }

    /// Summary of the node's view, without changing anything
    pub async fn report(&self) -> Result<StatusReport> {
        let view = self.election.view().await?;
        Ok(StatusReport {
            node: view.local.node.clone(),
            is_primary: view.is_primary(),
            primary: view.winner.clone(),
            peers: view.peers.iter().map(|p| p.node.clone()).collect(),
            replication: self.tracker.replication_state().await?,
            last_status: self.tracker.last_status().await?,
            passes: self.tracker.pass_count().await?,
        })
    }
}

/// Lines appended after the managed settings in postgresql.conf
pub fn managed_extra_lines(config: &WolfPgConfig, major: u32, tls: bool) -> Vec<String> {
    let mut lines = Vec::new();
    if major >= 12 {
        lines.push(format!(
            "include_if_exists {}",
            quote_value(&config.hot_standby_conf_path().display().to_string())
        ));
    }
    lines.push(format!("ssl = {}", tls));
    lines
}
