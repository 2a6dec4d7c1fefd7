//! WolfPG - Replicated PostgreSQL Controller
//!
//! Keeps a group of PostgreSQL nodes arranged as one primary and a set of
//! streaming standbys. Each node runs the same reconciliation pass on
//! every notification and converges on its own.
//!
//! # Architecture
//!
//! Nodes coordinate only through a shared peer directory where every node
//! publishes a small key/value record: its address, a primary claim and,
//! on the primary, the replication password. The greatest claim wins the
//! election; losers withdraw theirs.
//!
//! # Features
//!
//! - Deterministic primary election over published claims
//! - Comment-preserving, idempotent regeneration of `postgresql.conf`,
//!   `pg_hba.conf` and `pg_ident.conf`
//! - Standby bootstrap with `pg_basebackup` and per-version recovery files
//! - Replication credential distribution and `.pgpass` management
//! - TLS material decoding and memory based tuning

pub mod config;
pub mod error;
pub mod executor;
pub mod pgconf;
pub mod reconcile;
pub mod replication;
pub mod state;
pub mod tuning;

pub use config::WolfPgConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::WolfPgConfig;
    pub use crate::error::{Error, Result};
    pub use crate::reconcile::{Event, Flow, PassOutcome, Reconciler, UnitStatus};
    pub use crate::state::{ElectionCoordinator, NodeId, PeerDirectory, Role, StateTracker};
}
