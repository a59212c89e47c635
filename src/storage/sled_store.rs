//! Sled-based storage implementation for channel snapshots.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::{ChannelMetadata, StorageConfig};
use crate::sync::Snapshot;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corruption detected in channel: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_SNAPSHOTS: &str = "snapshots";
const TREE_METADATA: &str = "metadata";

/// Sled-based store for channel snapshots
#[derive(Clone)]
pub struct ChannelStore {
    db: Arc<Db>,
    snapshots: Tree,
    metadata: Tree,
}

impl ChannelStore {
    /// Open or create a store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        Self::from_db(db)
    }

    /// Open a throwaway in-memory store
    pub fn temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let snapshots = db.open_tree(TREE_SNAPSHOTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            snapshots,
            metadata,
        })
    }

    /// Store the latest snapshot of a channel and refresh its metadata
    pub fn save_snapshot(&self, channel_id: &str, snapshot: &Snapshot) -> StorageResult<()> {
        let bytes = bincode::serialize(snapshot)?;
        self.snapshots.insert(channel_id.as_bytes(), bytes)?;

        let mut meta = self
            .get_metadata(channel_id)?
            .unwrap_or_else(|| ChannelMetadata::new(channel_id));
        meta.updated_at = chrono::Utc::now().timestamp();
        meta.revision = snapshot.revision;
        meta.document_chars = snapshot.document.chars().count() as u64;
        self.save_metadata(&meta)
    }

    /// Load the latest snapshot of a channel
    pub fn load_snapshot(&self, channel_id: &str) -> StorageResult<Option<Snapshot>> {
        match self.snapshots.get(channel_id.as_bytes())? {
            Some(bytes) => {
                let snapshot: Snapshot = bincode::deserialize(&bytes)
                    .map_err(|e| StorageError::Corruption(format!("{}: {}", channel_id, e)))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Check if a snapshot exists
    pub fn snapshot_exists(&self, channel_id: &str) -> StorageResult<bool> {
        Ok(self.snapshots.contains_key(channel_id.as_bytes())?)
    }

    /// Delete a channel's snapshot and metadata
    pub fn delete_channel(&self, channel_id: &str) -> StorageResult<()> {
        let key = channel_id.as_bytes();
        self.snapshots.remove(key)?;
        self.metadata.remove(key)?;
        Ok(())
    }

    /// Save channel metadata
    pub fn save_metadata(&self, meta: &ChannelMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.channel_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load channel metadata
    pub fn get_metadata(&self, channel_id: &str) -> StorageResult<Option<ChannelMetadata>> {
        match self.metadata.get(channel_id.as_bytes())? {
            Some(bytes) => {
                let meta: ChannelMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List metadata for every persisted channel
    pub fn list_channels(&self) -> StorageResult<Vec<ChannelMetadata>> {
        let mut channels = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: ChannelMetadata = bincode::deserialize(&value)?;
            channels.push(meta);
        }
        Ok(channels)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            snapshot_count: self.snapshots.len(),
            metadata_count: self.metadata.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub snapshot_count: usize,
    pub metadata_count: usize,
    pub total_size_bytes: u64,
}

impl Drop for ChannelStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot(document: &str, revision: u64) -> Snapshot {
        Snapshot {
            document: document.to_string(),
            revision,
        }
    }

    #[test]
    fn test_snapshot_save_load() {
        let store = ChannelStore::temporary().unwrap();
        store.save_snapshot("channel-1", &snapshot("héllo", 3)).unwrap();

        let loaded = store.load_snapshot("channel-1").unwrap();
        assert_eq!(loaded, Some(snapshot("héllo", 3)));

        let meta = store.get_metadata("channel-1").unwrap().unwrap();
        assert_eq!(meta.revision, 3);
        assert_eq!(meta.document_chars, 5);
    }

    #[test]
    fn test_snapshot_not_found() {
        let store = ChannelStore::temporary().unwrap();
        assert!(store.load_snapshot("nonexistent").unwrap().is_none());
        assert!(!store.snapshot_exists("nonexistent").unwrap());
    }

    #[test]
    fn test_save_keeps_creation_time() {
        let store = ChannelStore::temporary().unwrap();
        let mut meta = ChannelMetadata::new("c");
        meta.created_at = 1_000;
        store.save_metadata(&meta).unwrap();

        store.save_snapshot("c", &snapshot("x", 1)).unwrap();
        let meta = store.get_metadata("c").unwrap().unwrap();
        assert_eq!(meta.created_at, 1_000);
        assert_eq!(meta.revision, 1);
    }

    #[test]
    fn test_list_and_delete() {
        let store = ChannelStore::temporary().unwrap();
        store.save_snapshot("a", &snapshot("1", 1)).unwrap();
        store.save_snapshot("b", &snapshot("2", 2)).unwrap();
        assert_eq!(store.list_channels().unwrap().len(), 2);

        store.delete_channel("a").unwrap();
        assert!(!store.snapshot_exists("a").unwrap());
        assert!(store.get_metadata("a").unwrap().is_none());
        assert_eq!(store.stats().snapshot_count, 1);
    }

    #[test]
    fn test_reopen_on_disk() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());

        {
            let store = ChannelStore::open(config.clone()).unwrap();
            store.save_snapshot("persisted", &snapshot("kept", 9)).unwrap();
        }

        let store = ChannelStore::open(config).unwrap();
        assert_eq!(store.load_snapshot("persisted").unwrap(), Some(snapshot("kept", 9)));
    }
}
