//! Replication Module
//!
//! Bootstraps standbys from the elected primary and keeps the primary free
//! of standby configuration.

mod bootstrap;

pub use bootstrap::{BootstrapOutcome, BootstrapPhase, Bootstrapper, ReplicationState};

/// Role standbys authenticate as when streaming from the primary
pub const REPLICATION_USER: &str = "_juju_repl";
