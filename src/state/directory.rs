//! Peer Directory
//!
//! A shared key/value substrate with one sub-mapping per node. Every node
//! can read every mapping but writes only its own; the API has no way to
//! touch another node's record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::peer::{NodeId, PeerRecord};
use crate::error::Result;

/// Raw key/value mapping published by one node
pub type Entries = BTreeMap<String, String>;

/// Handle onto the peer directory, bound to the local node
#[async_trait::async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Identity of the node owning this handle
    fn local(&self) -> &NodeId;

    /// Everything `node` has published (empty if nothing)
    async fn entries(&self, node: &NodeId) -> Result<Entries>;

    /// Write a key in the local node's record
    async fn set_own(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key from the local node's record
    async fn delete_own(&self, key: &str) -> Result<()>;

    /// Remote peers currently present, excluding the local node
    async fn all_peers(&self) -> Result<Vec<NodeId>>;

    /// Remove the local node's record entirely, for a node leaving the group
    async fn depart(&self) -> Result<()>;

    async fn get(&self, node: &NodeId, key: &str) -> Result<Option<String>> {
        Ok(self.entries(node).await?.remove(key))
    }

    async fn record(&self, node: &NodeId) -> Result<PeerRecord> {
        let entries = self.entries(node).await?;
        Ok(PeerRecord::from_map(node.clone(), &entries))
    }
}

type Substrate = Arc<RwLock<BTreeMap<NodeId, Entries>>>;

/// In-process directory. Handles created with [`MemoryDirectory::join`]
/// share the same substrate, one handle per node.
#[derive(Clone)]
pub struct MemoryDirectory {
    local: NodeId,
    substrate: Substrate,
}

impl MemoryDirectory {
    /// Start a new substrate with `local` as its first member
    pub fn new(local: NodeId) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(local.clone(), Entries::new());
        Self {
            local,
            substrate: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Handle for another node on the same substrate
    pub async fn join(&self, node: NodeId) -> Self {
        self.substrate.write().await.entry(node.clone()).or_default();
        Self {
            local: node,
            substrate: self.substrate.clone(),
        }
    }
}

#[async_trait::async_trait]
impl PeerDirectory for MemoryDirectory {
    fn local(&self) -> &NodeId {
        &self.local
    }

    async fn entries(&self, node: &NodeId) -> Result<Entries> {
        Ok(self.substrate.read().await.get(node).cloned().unwrap_or_default())
    }

    async fn set_own(&self, key: &str, value: &str) -> Result<()> {
        self.substrate
            .write()
            .await
            .entry(self.local.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_own(&self, key: &str) -> Result<()> {
        if let Some(entries) = self.substrate.write().await.get_mut(&self.local) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn all_peers(&self) -> Result<Vec<NodeId>> {
        Ok(self
            .substrate
            .read()
            .await
            .keys()
            .filter(|n| **n != self.local)
            .cloned()
            .collect())
    }

    async fn depart(&self) -> Result<()> {
        self.substrate.write().await.remove(&self.local);
        Ok(())
    }
}

/// On-disk document for one node
#[derive(Debug, Serialize, Deserialize)]
struct NodeDocument {
    node: NodeId,
    #[serde(default)]
    entries: Entries,
    updated_at: chrono::DateTime<chrono::Utc>,
}

/// Directory kept in a shared filesystem path, one JSON document per node.
///
/// A node only ever writes its own document, through a temporary file and
/// a rename, so readers never see a half written record.
pub struct FileDirectory {
    local: NodeId,
    root: PathBuf,
    /// Serialises read-modify-write of the local document
    write_lock: tokio::sync::Mutex<()>,
}

impl FileDirectory {
    pub fn new(root: impl Into<PathBuf>, local: NodeId) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            local,
            root,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, node: &NodeId) -> PathBuf {
        self.root.join(format!("{}.json", node.file_stem()))
    }

    async fn read_document(path: &Path) -> Result<Option<NodeDocument>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn modify_own<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Entries),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&self.local);

        let mut entries = Self::read_document(&path)
            .await?
            .map(|doc| doc.entries)
            .unwrap_or_default();
        change(&mut entries);

        let doc = NodeDocument {
            node: self.local.clone(),
            entries,
            updated_at: chrono::Utc::now(),
        };
        let tmp = self.root.join(format!(".{}.json.tmp", self.local.file_stem()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerDirectory for FileDirectory {
    fn local(&self) -> &NodeId {
        &self.local
    }

    async fn entries(&self, node: &NodeId) -> Result<Entries> {
        Ok(Self::read_document(&self.path_for(node))
            .await?
            .map(|doc| doc.entries)
            .unwrap_or_default())
    }

    async fn set_own(&self, key: &str, value: &str) -> Result<()> {
        self.modify_own(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
        .await
    }

    async fn delete_own(&self, key: &str) -> Result<()> {
        self.modify_own(|entries| {
            entries.remove(key);
        })
        .await
    }

    async fn all_peers(&self) -> Result<Vec<NodeId>> {
        let mut peers = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_document = path.extension().map_or(false, |ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_document {
                continue;
            }
            match Self::read_document(&path).await {
                Ok(Some(doc)) if doc.node != self.local => peers.push(doc.node),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Skipping unreadable peer document {}: {}", path.display(), e);
                }
            }
        }

        peers.sort();
        Ok(peers)
    }

    async fn depart(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.path_for(&self.local)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::peer::{KEY_INGRESS_ADDRESS, KEY_PRIMARY};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_memory_directory_ownership() {
        let a = MemoryDirectory::new(NodeId::new("postgresql/0"));
        let b = a.join(NodeId::new("postgresql/1")).await;

        a.set_own(KEY_INGRESS_ADDRESS, "10.0.0.1").await.unwrap();
        b.set_own(KEY_INGRESS_ADDRESS, "10.0.0.2").await.unwrap();

        assert_eq!(
            b.get(&NodeId::new("postgresql/0"), KEY_INGRESS_ADDRESS).await.unwrap(),
            Some("10.0.0.1".to_string())
        );
        assert_eq!(a.all_peers().await.unwrap(), vec![NodeId::new("postgresql/1")]);
        assert_eq!(b.all_peers().await.unwrap(), vec![NodeId::new("postgresql/0")]);

        b.depart().await.unwrap();
        assert!(a.all_peers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_delete_own_only_touches_own_record() {
        let a = MemoryDirectory::new(NodeId::new("postgresql/0"));
        let b = a.join(NodeId::new("postgresql/1")).await;
        a.set_own(KEY_PRIMARY, "100.0").await.unwrap();
        b.set_own(KEY_PRIMARY, "200.0").await.unwrap();

        a.delete_own(KEY_PRIMARY).await.unwrap();

        assert!(a.get(a.local(), KEY_PRIMARY).await.unwrap().is_none());
        assert_eq!(
            a.get(b.local(), KEY_PRIMARY).await.unwrap(),
            Some("200.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_file_directory_shared_between_nodes() {
        let dir = tempdir().unwrap();
        let a = FileDirectory::new(dir.path(), NodeId::new("postgresql/0")).unwrap();
        let b = FileDirectory::new(dir.path(), NodeId::new("postgresql/1")).unwrap();

        a.set_own(KEY_INGRESS_ADDRESS, "10.0.0.1").await.unwrap();
        a.set_own(KEY_PRIMARY, "0000000000100.000000").await.unwrap();
        b.set_own(KEY_INGRESS_ADDRESS, "10.0.0.2").await.unwrap();

        let record = b.record(&NodeId::new("postgresql/0")).await.unwrap();
        assert_eq!(record.ingress_address.as_deref(), Some("10.0.0.1"));
        assert!(record.claims_primary());

        assert_eq!(b.all_peers().await.unwrap(), vec![NodeId::new("postgresql/0")]);
        assert_eq!(a.all_peers().await.unwrap(), vec![NodeId::new("postgresql/1")]);

        a.delete_own(KEY_PRIMARY).await.unwrap();
        assert!(!b.record(a.local()).await.unwrap().claims_primary());
    }

    #[tokio::test]
    async fn test_file_directory_depart_removes_document() {
        let dir = tempdir().unwrap();
        let a = FileDirectory::new(dir.path(), NodeId::new("postgresql/0")).unwrap();
        let b = FileDirectory::new(dir.path(), NodeId::new("postgresql/1")).unwrap();
        a.set_own(KEY_INGRESS_ADDRESS, "10.0.0.1").await.unwrap();
        a.set_own(KEY_PRIMARY, "0000000000100.000000").await.unwrap();
        b.set_own(KEY_INGRESS_ADDRESS, "10.0.0.2").await.unwrap();

        a.depart().await.unwrap();
        assert!(b.all_peers().await.unwrap().is_empty());
        assert!(!b.record(a.local()).await.unwrap().claims_primary());
        assert!(!dir.path().join("postgresql_0.json").exists());

        // Departing twice is harmless
        a.depart().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_directory_ignores_temporary_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".postgresql_9.json.tmp"), b"{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let a = FileDirectory::new(dir.path(), NodeId::new("postgresql/0")).unwrap();
        assert!(a.all_peers().await.unwrap().is_empty());
        assert!(a.entries(&NodeId::new("postgresql/9")).await.unwrap().is_empty());
    }
}
