//! Relations
//!
//! A relation is a view of the peer directory from the local node: read
//! any record, write our own, and discover where connections come from.

use std::fmt;
use std::sync::Arc;

use super::directory::PeerDirectory;
use super::peer::{NodeId, PeerRecord, KEY_INGRESS_ADDRESS};
use crate::error::Result;

/// Which side of the cluster the relation connects us to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Other database nodes of this cluster
    Peer,
    /// Consumers connecting to the database
    Client,
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationKind::Peer => write!(f, "peer"),
            RelationKind::Client => write!(f, "client"),
        }
    }
}

/// Capability handle over one directory
#[derive(Clone)]
pub struct Relation {
    kind: RelationKind,
    directory: Arc<dyn PeerDirectory>,
}

impl Relation {
    pub fn new(kind: RelationKind, directory: Arc<dyn PeerDirectory>) -> Self {
        Self { kind, directory }
    }

    pub fn peer(directory: Arc<dyn PeerDirectory>) -> Self {
        Self::new(RelationKind::Peer, directory)
    }

    pub fn client(directory: Arc<dyn PeerDirectory>) -> Self {
        Self::new(RelationKind::Client, directory)
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    pub fn local(&self) -> &NodeId {
        self.directory.local()
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// Publish a key in our own record, skipping the write when unchanged
    pub async fn publish(&self, key: &str, value: &str) -> Result<bool> {
        let local = self.directory.local().clone();
        if self.directory.get(&local, key).await?.as_deref() == Some(value) {
            return Ok(false);
        }
        self.directory.set_own(key, value).await?;
        tracing::debug!(relation = %self.kind, key = key, "Published {}", key);
        Ok(true)
    }

    /// Publish the address other nodes should use to reach us
    pub async fn publish_address(&self, address: &str) -> Result<bool> {
        self.publish(KEY_INGRESS_ADDRESS, address).await
    }

    pub async fn own_record(&self) -> Result<PeerRecord> {
        let local = self.directory.local().clone();
        self.directory.record(&local).await
    }

    /// Records of every remote node, ordered by identity
    pub async fn remote_records(&self) -> Result<Vec<PeerRecord>> {
        let mut records = Vec::new();
        for node in self.directory.all_peers().await? {
            records.push(self.directory.record(&node).await?);
        }
        records.sort_by(|a, b| a.node.cmp(&b.node));
        Ok(records)
    }

    /// Address ranges connections from `node` arrive from
    pub async fn incoming_addresses(&self, node: &NodeId) -> Result<Vec<String>> {
        Ok(self.directory.record(node).await?.incoming_addresses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::directory::MemoryDirectory;
    use crate::state::peer::KEY_EGRESS_SUBNETS;

    #[tokio::test]
    async fn test_publish_is_skipped_when_unchanged() {
        let dir = MemoryDirectory::new(NodeId::new("postgresql/0"));
        let relation = Relation::peer(Arc::new(dir));
        assert!(relation.publish_address("10.0.0.1").await.unwrap());
        assert!(!relation.publish_address("10.0.0.1").await.unwrap());
        assert!(relation.publish_address("10.0.0.9").await.unwrap());
        assert_eq!(
            relation.own_record().await.unwrap().ingress_address.as_deref(),
            Some("10.0.0.9")
        );
    }

    #[tokio::test]
    async fn test_client_relation_discovers_consumer_ranges() {
        let db = MemoryDirectory::new(NodeId::new("postgresql/0"));
        let app = db.join(NodeId::new("webapp/3")).await;
        app.set_own(KEY_EGRESS_SUBNETS, "10.20.0.0/24").await.unwrap();
        app.set_own(KEY_INGRESS_ADDRESS, "10.20.0.7").await.unwrap();

        let relation = Relation::client(Arc::new(db));
        assert_eq!(relation.kind(), RelationKind::Client);
        assert_eq!(
            relation.incoming_addresses(&NodeId::new("webapp/3")).await.unwrap(),
            vec!["10.20.0.0/24"]
        );
        let remotes = relation.remote_records().await.unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].node, NodeId::new("webapp/3"));
    }
}
