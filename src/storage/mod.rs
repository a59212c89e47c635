//! Storage module for persistent channel snapshots using Sled.
//!
//! Only the latest `{document, revision}` pair of each channel is stored.
//! Operation history lives in memory and is never persisted: after a restart
//! a channel resumes at its saved revision with empty history, and clients
//! holding older revisions are resynchronized.

mod sled_store;

pub use sled_store::{ChannelStore, StorageError, StorageResult, StorageStats};

use serde::{Deserialize, Serialize};

/// Metadata stored alongside channel snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    /// Unique channel identifier
    pub channel_id: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last snapshot
    pub updated_at: i64,
    /// Revision of the last snapshot
    pub revision: u64,
    /// Document length in chars at the last snapshot
    pub document_chars: u64,
}

impl ChannelMetadata {
    pub fn new(channel_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            channel_id: channel_id.into(),
            created_at: now,
            updated_at: now,
            revision: 0,
            document_chars: 0,
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/ot-collab.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}
