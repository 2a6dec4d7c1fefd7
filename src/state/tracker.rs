//! State Tracker
//!
//! Persistent local state for one node: replication bootstrap progress,
//! the settings applied on the last pass and the last reported status.

use std::path::PathBuf;

use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::pgconf::Settings;
use crate::reconcile::UnitStatus;
use crate::replication::ReplicationState;

const KEY_REPLICATION: &str = "replication_state";
const KEY_SETTINGS: &str = "settings_snapshot";
const KEY_STATUS: &str = "last_status";
const KEY_PASSES: &str = "pass_count";

/// Persistent state tracker backed by SQLite
pub struct StateTracker {
    /// Database connection
    conn: RwLock<Connection>,
    /// Node ID
    node_id: String,
}

impl StateTracker {
    /// Create or open the state tracker database
    pub fn new(state_dir: PathBuf, node_id: String) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;

        let db_path = state_dir.join("state.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: RwLock::new(conn),
            node_id,
        })
    }

    /// In-memory tracker, for dry runs
    pub fn in_memory(node_id: String) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE node_state (key TEXT PRIMARY KEY, value_int INTEGER, value_text TEXT, updated_at TEXT DEFAULT CURRENT_TIMESTAMP);",
        )?;
        Ok(Self {
            conn: RwLock::new(conn),
            node_id,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn.read().await;
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value_text FROM node_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match result {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("Failed to get {}: {}", key, e))),
        }
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let conn = self.conn.write().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_text) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_text = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, text],
        )?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.write().await;
        conn.execute("DELETE FROM node_state WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Replication bootstrap progress; defaults to never cloned
    pub async fn replication_state(&self) -> Result<ReplicationState> {
        Ok(self.get_json(KEY_REPLICATION).await?.unwrap_or_default())
    }

    pub async fn set_replication_state(&self, state: &ReplicationState) -> Result<()> {
        self.put_json(KEY_REPLICATION, state).await
    }

    /// Forget replication progress (the node became primary)
    pub async fn clear_replication_state(&self) -> Result<()> {
        self.delete(KEY_REPLICATION).await
    }

    /// Settings assembled on the last successful pass
    pub async fn settings_snapshot(&self) -> Result<Option<Settings>> {
        self.get_json(KEY_SETTINGS).await
    }

    pub async fn set_settings_snapshot(&self, settings: &Settings) -> Result<()> {
        self.put_json(KEY_SETTINGS, settings).await
    }

    pub async fn last_status(&self) -> Result<Option<UnitStatus>> {
        self.get_json(KEY_STATUS).await
    }

    pub async fn set_last_status(&self, status: &UnitStatus) -> Result<()> {
        self.put_json(KEY_STATUS, status).await
    }

    /// Count a finished pass, returning the new total
    pub async fn record_pass(&self) -> Result<u64> {
        let conn = self.conn.write().await;
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES (?1, 1)
            ON CONFLICT(key) DO UPDATE SET value_int = value_int + 1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![KEY_PASSES],
        )?;
        let count: i64 = conn.query_row(
            "SELECT value_int FROM node_state WHERE key = ?1",
            params![KEY_PASSES],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Number of passes recorded so far
    pub async fn pass_count(&self) -> Result<u64> {
        let conn = self.conn.read().await;
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM node_state WHERE key = ?1",
            params![KEY_PASSES],
            |row| row.get(0),
        );

        match result {
            Ok(count) => Ok(count as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(Error::State(format!("Failed to get pass count: {}", e))),
        }
    }

    /// Get node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::BootstrapPhase;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_replication_state_round_trip() {
        let dir = tempdir().unwrap();
        let tracker = StateTracker::new(dir.path().to_path_buf(), "postgresql/1".to_string()).unwrap();

        assert_eq!(tracker.replication_state().await.unwrap(), ReplicationState::default());

        let state = ReplicationState {
            cloned_from: Some("10.0.0.1".to_string()),
            phase: BootstrapPhase::Failed("exit status 1".to_string()),
        };
        tracker.set_replication_state(&state).await.unwrap();
        assert_eq!(tracker.replication_state().await.unwrap(), state);

        tracker.clear_replication_state().await.unwrap();
        assert_eq!(tracker.replication_state().await.unwrap().phase, BootstrapPhase::Uncloned);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let settings: Settings = [("max_connections", "100")].into_iter().collect();
        {
            let tracker = StateTracker::new(dir.path().to_path_buf(), "postgresql/0".to_string()).unwrap();
            tracker.set_settings_snapshot(&settings).await.unwrap();
            tracker.set_last_status(&UnitStatus::Active("Live primary".into())).await.unwrap();
            assert_eq!(tracker.record_pass().await.unwrap(), 1);
            assert_eq!(tracker.record_pass().await.unwrap(), 2);
        }

        let tracker = StateTracker::new(dir.path().to_path_buf(), "postgresql/0".to_string()).unwrap();
        assert_eq!(tracker.settings_snapshot().await.unwrap(), Some(settings));
        assert_eq!(
            tracker.last_status().await.unwrap(),
            Some(UnitStatus::Active("Live primary".into()))
        );
        assert_eq!(tracker.pass_count().await.unwrap(), 2);
        assert_eq!(tracker.node_id(), "postgresql/0");
    }

    #[tokio::test]
    async fn test_in_memory_tracker() {
        let tracker = StateTracker::in_memory("postgresql/2".to_string()).unwrap();
        assert!(tracker.settings_snapshot().await.unwrap().is_none());
        assert_eq!(tracker.pass_count().await.unwrap(), 0);
    }
}
