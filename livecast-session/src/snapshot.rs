//! Durable recovery snapshots
//!
//! Written once when reconnection is exhausted, read back after a restart so
//! the operator can resume the broadcast for the viewers that were present.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::ReconnectConfig;
use crate::error::{Error, Result};
use crate::lifecycle::StreamState;
use crate::types::{RoomId, ViewerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySnapshot {
    pub room_id: RoomId,
    pub broadcaster_id: String,
    pub viewers: Vec<ViewerId>,
    pub lifecycle_state: StreamState,
    pub reconnect_attempts: u32,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn persist(&self, snapshot: &RecoverySnapshot) -> Result<()>;

    async fn load(&self) -> Result<Option<RecoverySnapshot>>;

    async fn clear(&self) -> Result<()>;
}

/// JSON file, replaced atomically through a temp file and rename
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the configured `snapshot_path`
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(&config.snapshot_path)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn persist(&self, snapshot: &RecoverySnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Snapshot(format!("{}: {e}", parent.display())))?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, body)
            .await
            .map_err(|e| Error::Snapshot(format!("{}: {e}", temp.display())))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| Error::Snapshot(format!("{}: {e}", self.path.display())))?;

        info!(
            path = %self.path.display(),
            room_id = %snapshot.room_id,
            viewers = snapshot.viewers.len(),
            "Recovery snapshot persisted"
        );
        Ok(())
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(body) => Ok(Some(serde_json::from_str(&body)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Snapshot(format!("{}: {e}", self.path.display()))),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Recovery snapshot cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<RecoverySnapshot>>,
}

impl MemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<RecoverySnapshot> {
        self.snapshot.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn persist(&self, snapshot: &RecoverySnapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<RecoverySnapshot>> {
        Ok(self.current())
    }

    async fn clear(&self) -> Result<()> {
        self.snapshot.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecoverySnapshot {
        RecoverySnapshot {
            room_id: RoomId::from("room1"),
            broadcaster_id: "host".to_string(),
            viewers: vec![ViewerId::from("v1"), ViewerId::from("v2")],
            lifecycle_state: StreamState::Live,
            reconnect_attempts: 5,
            reason: "signaling unavailable".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().await.unwrap().is_none());

        store.persist(&sample()).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().viewers.len(), 2);

        store.clear().await.unwrap();
        assert!(store.current().is_none());
    }

    #[test]
    fn test_snapshot_field_names() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(value["roomId"], "room1");
        assert_eq!(value["lifecycleState"], "live");
        assert!(value.get("createdAt").is_some());
    }

    #[tokio::test]
    async fn test_configured_path_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReconnectConfig {
            snapshot_path: dir.path().join("state/recovery.json").display().to_string(),
            ..ReconnectConfig::default()
        };
        let store = FileSnapshotStore::from_config(&config);
        assert!(store.load().await.unwrap().is_none());

        store.persist(&sample()).await.unwrap();
        assert!(dir.path().join("state/recovery.json").exists());
        assert!(!store.temp_path().exists());
        assert_eq!(store.load().await.unwrap().unwrap().reconnect_attempts, 5);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }

    #[test]
    fn test_temp_path_is_sibling() {
        let store = FileSnapshotStore::new("/var/lib/livecast/recovery.json");
        assert_eq!(
            store.temp_path(),
            PathBuf::from("/var/lib/livecast/recovery.json.tmp")
        );
    }
}
