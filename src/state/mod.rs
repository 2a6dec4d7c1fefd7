//! State Management Module
//!
//! Handles the shared peer directory, primary election and the node's
//! own persistent state.

pub mod directory;
pub mod election;
mod peer;
pub mod relation;
mod tracker;

pub use directory::{FileDirectory, MemoryDirectory, PeerDirectory};
pub use election::{elect, ElectionCoordinator, ElectionView, Role};
pub use peer::{
    ClaimTimestamp, NodeId, PeerRecord, KEY_EGRESS_SUBNETS, KEY_INGRESS_ADDRESS,
    KEY_PRIMARY, KEY_PRIVATE_ADDRESS, KEY_REPLICATION_PASSWORD,
};
pub use relation::{Relation, RelationKind};
pub use tracker::StateTracker;
