//! Peer records
//!
//! What each node publishes about itself in the peer directory.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pgconf::addr_to_range;

/// Directory key: address other nodes reach us on
pub const KEY_INGRESS_ADDRESS: &str = "ingress-address";
/// Directory key: comma separated subnets our traffic leaves from
pub const KEY_EGRESS_SUBNETS: &str = "egress-subnets";
/// Directory key: fallback address
pub const KEY_PRIVATE_ADDRESS: &str = "private-address";
/// Directory key: primary claim timestamp
pub const KEY_PRIMARY: &str = "primary";
/// Directory key: replication password, only on the primary's record
pub const KEY_REPLICATION_PASSWORD: &str = "replication-password";

/// Node identity, e.g. `postgresql/3`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing integer of the identity (`postgresql/12` -> 12)
    pub fn ordinal(&self) -> Option<u64> {
        let digits = self.0.len() - self.0.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            return None;
        }
        self.0[self.0.len() - digits..].parse().ok()
    }

    /// Name safe to use as a file name
    pub fn file_stem(&self) -> String {
        self.0.replace(['/', '\\'], "_")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primary claim: wall-clock seconds when the node became primary.
///
/// Only positive, finite values are claims. Zero, negative and
/// unparsable values mean "no claim".
#[derive(Debug, Clone, Copy)]
pub struct ClaimTimestamp(f64);

impl ClaimTimestamp {
    pub fn new(seconds: f64) -> Option<Self> {
        if seconds.is_finite() && seconds > 0.0 {
            Some(Self(seconds))
        } else {
            None
        }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        // Clock before the epoch still has to produce a valid claim.
        Self((micros as f64 / 1_000_000.0).max(f64::MIN_POSITIVE))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<f64>().ok().and_then(Self::new)
    }

    /// Fixed-width decimal form, the only form ever written
    pub fn encode(&self) -> String {
        format!("{:020.6}", self.0)
    }

    pub fn seconds(&self) -> f64 {
        self.0
    }
}

impl PartialEq for ClaimTimestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ClaimTimestamp {}

impl PartialOrd for ClaimTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClaimTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for ClaimTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// Everything one node has published
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub node: NodeId,
    pub ingress_address: Option<String>,
    pub egress_subnets: Option<String>,
    pub private_address: Option<String>,
    pub primary_claim: Option<ClaimTimestamp>,
    pub replication_password: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

impl PeerRecord {
    /// Record of a node that has published nothing yet
    pub fn empty(node: NodeId) -> Self {
        Self {
            node,
            ingress_address: None,
            egress_subnets: None,
            private_address: None,
            primary_claim: None,
            replication_password: None,
        }
    }

    /// Build from the raw key/value mapping stored in the directory
    pub fn from_map(node: NodeId, map: &BTreeMap<String, String>) -> Self {
        Self {
            node,
            ingress_address: non_empty(map.get(KEY_INGRESS_ADDRESS)),
            egress_subnets: non_empty(map.get(KEY_EGRESS_SUBNETS)),
            private_address: non_empty(map.get(KEY_PRIVATE_ADDRESS)),
            primary_claim: map.get(KEY_PRIMARY).and_then(|v| ClaimTimestamp::parse(v)),
            replication_password: non_empty(map.get(KEY_REPLICATION_PASSWORD)),
        }
    }

    /// Address to connect to this node on
    pub fn address(&self) -> Option<&str> {
        self.ingress_address
            .as_deref()
            .or(self.private_address.as_deref())
            .filter(|a| !a.trim().is_empty())
    }

    /// Address ranges connections from this node arrive from.
    ///
    /// Egress subnets win over the ingress address, which wins over the
    /// private address. Bare addresses become single-host ranges.
    pub fn incoming_addresses(&self) -> Vec<String> {
        let candidates = [&self.egress_subnets, &self.ingress_address, &self.private_address];
        for candidate in candidates.into_iter().flatten() {
            let ranges: Vec<String> = candidate
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(addr_to_range)
                .collect();
            if !ranges.is_empty() {
                return ranges;
            }
        }
        Vec::new()
    }

    pub fn claims_primary(&self) -> bool {
        self.primary_claim.is_some()
    }
}
