//! WolfPG - Replicated PostgreSQL Controller
//!
//! Command line entry point. Each invocation runs against a single node:
//! one reconciliation pass, a watch loop, or one of the inspection helpers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpg::config::{ExecMode, WolfPgConfig};
use wolfpg::error::Result;
use wolfpg::executor::{CommandRunner, KubectlRunner, LocalFiles, LocalRunner, SystemdSupervisor};
use wolfpg::pgconf::{self, ParseMode};
use wolfpg::reconcile::{Event, Flow, Reconciler};
use wolfpg::state::{FileDirectory, NodeId, StateTracker};
use wolfpg::tuning::{tuning_summary, MemoryTuning};

/// Exit code asking the caller to retry later (EX_TEMPFAIL)
const EXIT_DEFERRED: i32 = 75;

/// WolfPG - Replicated PostgreSQL Controller
#[derive(Parser)]
#[command(name = "wolfpg")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpg.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum RenderKind {
    Conf,
    Hba,
    Ident,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation pass
    Reconcile {
        /// Notification that triggered the pass
        #[arg(short, long, value_enum, default_value = "config-changed")]
        event: Event,

        /// This node is the control-plane leader and may claim primary
        #[arg(long)]
        leader: bool,
    },

    /// Reconcile periodically until interrupted
    Watch {
        /// Seconds between passes
        #[arg(short, long, default_value = "30")]
        interval_secs: u64,

        /// This node is the control-plane leader and may claim primary
        #[arg(long)]
        leader: bool,
    },

    /// Publish a fresh primary claim for this node
    SetPrimary,

    /// Show this node's view of the group
    Status,

    /// Print a regenerated configuration file without touching the node
    Render {
        /// Which file to render
        #[arg(short, long, value_enum)]
        kind: RenderKind,

        /// Existing file contents to start from
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpg.toml")]
        output: PathBuf,

        /// Node identity, e.g. postgresql/0
        #[arg(long, default_value = "postgresql/0")]
        unit: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Remove this node's record from the peer directory
    Depart,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = WolfPgConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging.format);

    match cli.command {
        Commands::Reconcile { event, leader } => run_reconcile(cli.config, event, leader).await,
        Commands::Watch { interval_secs, leader } => {
            run_watch(cli.config, Duration::from_secs(interval_secs.max(1)), leader).await
        }
        Commands::SetPrimary => run_set_primary(cli.config).await,
        Commands::Status => run_status(cli.config).await,
        Commands::Render { kind, input } => run_render(cli.config, kind, input),
        Commands::Init { output, unit } => run_init(output, unit),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Depart => run_depart(cli.config).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let compact = format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with((!compact).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn load_config(config_path: &Path) -> Result<Arc<WolfPgConfig>> {
    match WolfPgConfig::from_file(config_path) {
        Ok(config) => {
            tracing::debug!("Loaded configuration for node: {}", config.node.unit);
            Ok(Arc::new(config))
        }
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            Err(e)
        }
    }
}

/// Wire the production collaborators for this node
fn build_reconciler(config: Arc<WolfPgConfig>) -> Result<Reconciler> {
    if let Err(e) = std::fs::create_dir_all(config.state_dir()) {
        tracing::error!("Failed to create state directory {:?}: {}", config.state_dir(), e);
        return Err(e.into());
    }

    let runner: Arc<dyn CommandRunner> = match config.exec.mode {
        ExecMode::Local => Arc::new(LocalRunner::new(config.exec_timeout())),
        ExecMode::Kubectl => Arc::new(KubectlRunner::new(&config)?),
    };
    let supervisor = Arc::new(SystemdSupervisor::new(runner.clone(), config.postgres.service.clone()));
    let node = NodeId::new(config.node.unit.clone());
    let directory = Arc::new(FileDirectory::new(config.peers.directory.clone(), node)?);
    let tracker = Arc::new(StateTracker::new(config.state_dir().clone(), config.node.unit.clone())?);

    Ok(Reconciler::new(
        config,
        directory,
        supervisor,
        Arc::new(LocalFiles::new()),
        runner,
        tracker,
    ))
}

/// Run one pass and exit
async fn run_reconcile(config_path: PathBuf, event: Event, leader: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    let leader = leader || config.node.leader;
    let reconciler = build_reconciler(config)?;

    let outcome = reconciler.reconcile(event, leader).await?;
    println!("{}", outcome.status);
    for path in &outcome.changed {
        println!("  updated {}", path.display());
    }

    if let Flow::Defer(reason) = outcome.flow {
        tracing::warn!("Pass deferred: {}", reason);
        std::process::exit(EXIT_DEFERRED);
    }
    Ok(())
}

/// Reconcile on a timer until ctrl-c
async fn run_watch(config_path: PathBuf, interval: Duration, leader: bool) -> Result<()> {
    let config = load_config(&config_path)?;
    let leader = leader || config.node.leader;
    let reconciler = build_reconciler(config)?;
    tracing::info!("Watching every {:?}", interval);

    let mut ticker = tokio::time::interval(interval);
    let mut event = Event::Start;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reconciler.reconcile(event, leader).await {
                    Ok(outcome) => {
                        if let Flow::Defer(reason) = &outcome.flow {
                            tracing::info!("Pass deferred: {}", reason);
                        }
                    }
                    Err(e) => tracing::error!("Reconciliation failed: {}", e),
                }
                event = Event::PeerChanged;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn run_set_primary(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let reconciler = build_reconciler(config)?;

    let claim = reconciler.election().set_as_primary().await?;
    println!("Published primary claim {} for {}", claim, reconciler.election().local());
    println!("Run `wolfpg reconcile` on every node to converge.");
    Ok(())
}

async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let reconciler = build_reconciler(config)?;
    let report = reconciler.report().await?;

    println!("WolfPG Node Status");
    println!("==================");
    println!();
    println!("Node:             {}", report.node);
    println!("Role:             {}", if report.is_primary { "primary" } else { "standby" });
    match &report.primary {
        Some(primary) => println!("Primary:          {}", primary),
        None => println!("Primary:          (none elected)"),
    }
    println!("Peers:            {}", report.peers.len());
    for peer in &report.peers {
        println!("  - {}", peer);
    }
    println!();
    println!("Replication:      {}", report.replication.phase);
    if let Some(source) = &report.replication.cloned_from {
        println!("Cloned From:      {}", source);
    }
    match &report.last_status {
        Some(status) => println!("Last Status:      {}", status),
        None => println!("Last Status:      (never reconciled)"),
    }
    println!("Passes:           {}", report.passes);
    Ok(())
}

/// Offline preview: peers are not consulted, so pg_hba.conf only holds the
/// operator supplied rules.
fn run_render(config_path: PathBuf, kind: RenderKind, input: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path)?;
    let options = &config.options;
    let existing = match input {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };

    let text = match kind {
        RenderKind::Conf => {
            let major = config.major_version().unwrap_or_default();
            let tuning = config.postgres.auto_tune.then(MemoryTuning::detect);
            let settings = pgconf::assemble(
                &options.extra_pg_conf,
                major,
                tuning.as_ref(),
                ParseMode::from_strict(config.postgres.strict_parsing),
            )?;
            let extra_lines = wolfpg::reconcile::managed_extra_lines(&config, major, options.tls_enabled());
            pgconf::render(&existing, &settings, &extra_lines)?
        }
        RenderKind::Hba => pgconf::compile(
            &existing,
            &[],
            &options.admin_addresses,
            &options.extra_pg_auth,
            options.tls_enabled(),
        ),
        RenderKind::Ident => pgconf::ensure_ident_mapping(&existing),
    };

    println!("{}", text);
    Ok(())
}

async fn run_depart(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let reconciler = build_reconciler(config)?;

    reconciler.depart().await?;
    println!("Removed {} from the peer directory", reconciler.election().local());
    println!("Stop the service on this node before reusing its address.");
    Ok(())
}

fn run_init(output: PathBuf, unit: String) -> Result<()> {
    let config_content = format!(r#"# WolfPG Configuration
# Generated configuration file

[node]
unit = "{unit}"
ingress_address = "10.0.0.1"
state_dir = "/var/lib/wolfpg"
# leader = true

[postgres]
version = "12"
service = "postgresql"
port = 5432
system_user = "postgres"
auto_tune = true
strict_parsing = true
# data_dir = "/var/lib/postgresql/12/main"
# etc_dir = "/etc/postgresql/12/main"

[peers]
directory = "/srv/wolfpg/peers"

[exec]
mode = "local"
# timeout_secs = 600

[options]
extra_pg_conf = """
listen_addresses = '*'
max_connections = 100
"""
extra_pg_auth = ""
admin_addresses = ""
ssl_cert = ""
ssl_key = ""

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the node address and peer directory.");
    println!("Then reconcile with: wolfpg reconcile --config {}", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfPgConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node:           {}", config.node.unit);
            println!("  Address:        {}", config.node.ingress_address);
            println!("  PostgreSQL:     {}", config.postgres.version);
            println!("  Peer Directory: {}", config.peers.directory.display());
            println!("  TLS:            {}", config.options.tls_enabled());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;

    println!("WolfPG Node Information");
    println!("=======================");
    println!();
    println!("Node:             {}", config.node.unit);
    println!("Address:          {}", config.node.ingress_address);
    println!("State Directory:  {}", config.state_dir().display());
    println!();
    println!("PostgreSQL:");
    println!("  Version:        {}", config.postgres.version);
    println!("  Service:        {}", config.postgres.service);
    println!("  Data Directory: {}", config.data_dir().display());
    println!("  Config Dir:     {}", config.etc_dir().display());
    println!("  pg_ctl:         {}", config.pg_bin("pg_ctl").display());
    println!();
    println!("Execution:        {:?}", config.exec.mode);
    println!("Peer Directory:   {}", config.peers.directory.display());
    println!();
    println!("Memory Tuning:");
    for line in tuning_summary(&MemoryTuning::detect()).lines() {
        println!("  {}", line);
    }

    Ok(())
}
