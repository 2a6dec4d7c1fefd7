//! Primary Election
//!
//! Leaderless election over the peer directory. A node claims primary by
//! publishing the time it became primary; the newest claim wins. Only the
//! platform's control-plane leader ever makes a claim, and only when
//! nobody else holds one, so conflicting claims are short-lived and
//! resolve the same way on every node.

use std::cmp::Ordering;
use std::sync::Arc;

use super::directory::PeerDirectory;
use super::peer::{ClaimTimestamp, NodeId, PeerRecord, KEY_PRIMARY};
use crate::error::Result;

/// Role of the local node after an election pass
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// This node is the elected primary
    Primary,
    /// Another node is primary, or nobody is yet
    Standby {
        /// Winning record, `None` while nobody claims primary
        primary: Option<PeerRecord>,
    },
}

impl Role {
    pub fn is_primary(&self) -> bool {
        matches!(self, Role::Primary)
    }

    /// Winning record when it is another node
    pub fn primary(&self) -> Option<&PeerRecord> {
        match self {
            Role::Standby { primary } => primary.as_ref(),
            Role::Primary => None,
        }
    }
}

fn rank(a: &PeerRecord, b: &PeerRecord) -> Ordering {
    a.primary_claim
        .cmp(&b.primary_claim)
        .then_with(|| a.node.ordinal().cmp(&b.node.ordinal()))
        .then_with(|| a.node.cmp(&b.node))
}

/// Pick the primary among `records`.
///
/// The greatest claim wins. Identical claims go to the highest unit
/// ordinal, then to the lexically greatest identity. Records without a
/// claim never win; no claims at all gives `None`.
pub fn elect(records: &[PeerRecord]) -> Option<NodeId> {
    records
        .iter()
        .filter(|r| r.claims_primary())
        .max_by(|a, b| rank(a, b))
        .map(|r| r.node.clone())
}

/// Snapshot of every record taken for one evaluation
#[derive(Debug, Clone)]
pub struct ElectionView {
    pub local: PeerRecord,
    pub peers: Vec<PeerRecord>,
    pub winner: Option<NodeId>,
}

impl ElectionView {
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        std::iter::once(&self.local).chain(self.peers.iter())
    }

    pub fn winner_record(&self) -> Option<&PeerRecord> {
        let winner = self.winner.as_ref()?;
        self.records().find(|r| &r.node == winner)
    }

    pub fn is_primary(&self) -> bool {
        self.winner.as_ref() == Some(&self.local.node)
    }

    /// Nobody claims primary
    pub fn is_ambiguous(&self) -> bool {
        self.winner.is_none()
    }

    pub fn role(&self) -> Role {
        if self.is_primary() {
            Role::Primary
        } else {
            Role::Standby {
                primary: self.winner_record().cloned(),
            }
        }
    }
}

/// Election coordinator for the local node
pub struct ElectionCoordinator {
    directory: Arc<dyn PeerDirectory>,
}

impl ElectionCoordinator {
    pub fn new(directory: Arc<dyn PeerDirectory>) -> Self {
        Self { directory }
    }

    pub fn local(&self) -> &NodeId {
        self.directory.local()
    }

    /// Read every record and compute the winner. Read-only.
    pub async fn view(&self) -> Result<ElectionView> {
        let local = self.directory.record(self.directory.local()).await?;
        let mut peers = Vec::new();
        for node in self.directory.all_peers().await? {
            peers.push(self.directory.record(&node).await?);
        }

        let mut all = Vec::with_capacity(peers.len() + 1);
        all.push(local.clone());
        all.extend(peers.iter().cloned());
        let winner = elect(&all);

        Ok(ElectionView { local, peers, winner })
    }

    /// Evaluate the election and converge the local record.
    ///
    /// Not a pure query: when the local node holds a claim but lost, the
    /// claim is deleted from the directory before returning.
    pub async fn evaluate_and_converge(&self) -> Result<Role> {
        let view = self.view().await?;

        if view.local.claims_primary() && !view.is_primary() {
            tracing::info!(
                winner = ?view.winner.as_ref().map(|w| w.to_string()),
                "{} lost the primary election, withdrawing claim",
                view.local.node
            );
            self.directory.delete_own(KEY_PRIMARY).await?;
        }

        Ok(view.role())
    }

    /// Claim primary now
    pub async fn set_as_primary(&self) -> Result<ClaimTimestamp> {
        let claim = ClaimTimestamp::now();
        self.set_as_primary_at(claim).await?;
        Ok(claim)
    }

    /// Claim primary with an explicit timestamp
    pub async fn set_as_primary_at(&self, claim: ClaimTimestamp) -> Result<()> {
        self.directory.set_own(KEY_PRIMARY, &claim.encode()).await?;
        tracing::info!("{} claimed primary at {}", self.directory.local(), claim);
        Ok(())
    }

    /// Address of the current primary, if any node claims it
    pub async fn primary_address(&self) -> Result<Option<String>> {
        let view = self.view().await?;
        Ok(view.winner_record().and_then(|r| r.address()).map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::directory::MemoryDirectory;

    fn claim(node: &str, at: Option<f64>) -> PeerRecord {
        let mut record = PeerRecord::empty(NodeId::new(node));
        record.primary_claim = at.and_then(ClaimTimestamp::new);
        record
    }

    #[test]
    fn test_equal_claims_go_to_higher_ordinal() {
        let records = vec![claim("postgresql/1", Some(100.0)), claim("postgresql/2", Some(100.0))];
        assert_eq!(elect(&records), Some(NodeId::new("postgresql/2")));
    }

    #[test]
    fn test_ordinal_compared_numerically() {
        let records = vec![claim("postgresql/9", Some(100.0)), claim("postgresql/10", Some(100.0))];
        assert_eq!(elect(&records), Some(NodeId::new("postgresql/10")));
    }

    #[test]
    fn test_newest_claim_wins() {
        let records = vec![
            claim("postgresql/5", Some(100.0)),
            claim("postgresql/0", Some(250.5)),
            claim("postgresql/7", None),
        ];
        assert_eq!(elect(&records), Some(NodeId::new("postgresql/0")));
    }

    #[test]
    fn test_election_is_order_independent() {
        let mut records = vec![
            claim("postgresql/3", Some(100.0)),
            claim("postgresql/1", Some(300.0)),
            claim("postgresql/4", Some(300.0)),
            claim("postgresql/2", None),
        ];
        let expected = elect(&records);
        assert_eq!(expected, Some(NodeId::new("postgresql/4")));
        for _ in 0..records.len() {
            records.rotate_left(1);
            assert_eq!(elect(&records), expected);
            records.reverse();
            assert_eq!(elect(&records), expected);
        }
    }

    #[test]
    fn test_no_claims_no_winner() {
        let records = vec![claim("postgresql/0", None), claim("postgresql/1", Some(-1.0))];
        assert_eq!(elect(&records), None);
        assert_eq!(elect(&[]), None);
    }

    #[tokio::test]
    async fn test_loser_withdraws_its_claim() {
        let a = Arc::new(MemoryDirectory::new(NodeId::new("postgresql/0")));
        let b = Arc::new(a.join(NodeId::new("postgresql/1")).await);
        let coord_a = ElectionCoordinator::new(a.clone());
        let coord_b = ElectionCoordinator::new(b.clone());

        coord_a.set_as_primary_at(ClaimTimestamp::new(100.0).unwrap()).await.unwrap();
        coord_b.set_as_primary_at(ClaimTimestamp::new(200.0).unwrap()).await.unwrap();

        let role_a = coord_a.evaluate_and_converge().await.unwrap();
        assert_eq!(role_a.primary().map(|r| r.node.clone()), Some(NodeId::new("postgresql/1")));
        assert!(a.get(a.local(), KEY_PRIMARY).await.unwrap().is_none());

        assert_eq!(coord_b.evaluate_and_converge().await.unwrap(), Role::Primary);
        assert!(b.get(b.local(), KEY_PRIMARY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_claim_converges_to_single_primary() {
        let a = Arc::new(MemoryDirectory::new(NodeId::new("postgresql/0")));
        let b = Arc::new(a.join(NodeId::new("postgresql/1")).await);
        let c = Arc::new(a.join(NodeId::new("postgresql/2")).await);
        let coords: Vec<ElectionCoordinator> = [a.clone(), b.clone(), c.clone()]
            .into_iter()
            .map(|d| ElectionCoordinator::new(d as Arc<dyn PeerDirectory>))
            .collect();

        for coord in &coords {
            assert!(coord.view().await.unwrap().is_ambiguous());
        }

        // Only the control-plane leader claims.
        coords[1].set_as_primary().await.unwrap();

        let mut primaries = 0;
        for coord in &coords {
            if coord.evaluate_and_converge().await.unwrap().is_primary() {
                primaries += 1;
            }
        }
        assert_eq!(primaries, 1);
        assert!(coords[0].evaluate_and_converge().await.unwrap().primary().is_some());
    }

    #[tokio::test]
    async fn test_primary_address_follows_winner() {
        let a = Arc::new(MemoryDirectory::new(NodeId::new("postgresql/0")));
        let b = Arc::new(a.join(NodeId::new("postgresql/1")).await);
        b.set_own(crate::state::peer::KEY_INGRESS_ADDRESS, "10.0.0.2").await.unwrap();

        let coord = ElectionCoordinator::new(a.clone());
        assert_eq!(coord.primary_address().await.unwrap(), None);

        ElectionCoordinator::new(b).set_as_primary().await.unwrap();
        assert_eq!(coord.primary_address().await.unwrap(), Some("10.0.0.2".to_string()));
    }
}
