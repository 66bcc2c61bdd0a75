//! Queue state persistence
//!
//! Provides pluggable persistence for in-flight queue messages so they
//! survive process restarts. A `DurableQueue` saves a snapshot after every
//! change and loads it on creation when a `QueueStore` is configured.
//!
//! Each snapshot holds, per message: id, original event, enqueue timestamp,
//! visibility-expiry timestamp and receive count.

use crate::error::{FabricError, Result};
use crate::queue::StoredMessage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Trait for persisting queue messages
pub trait QueueStore: Send + Sync {
    /// Replace the saved snapshot for `queue`
    fn save(&self, queue: &str, messages: &[StoredMessage]) -> Result<()>;

    /// Load the saved snapshot for `queue` (empty if none)
    fn load(&self, queue: &str) -> Result<Vec<StoredMessage>>;
}

/// JSON file-based queue store
///
/// One `<queue>.json` file per queue under a directory.
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileQueueStore {
    dir: PathBuf,
}

impl FileQueueStore {
    /// Create a new file store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot file for a queue
    pub fn path_for(&self, queue: &str) -> PathBuf {
        self.dir.join(format!("{}.json", queue))
    }
}

impl QueueStore for FileQueueStore {
    fn save(&self, queue: &str, messages: &[StoredMessage]) -> Result<()> {
        let json = serde_json::to_string_pretty(messages)?;
        let path = self.path_for(queue);
        let tmp_path = path.with_extension("tmp");

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            FabricError::Store(format!(
                "Failed to create state directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        std::fs::write(&tmp_path, json).map_err(|e| {
            FabricError::Store(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            FabricError::Store(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %path.display(), messages = messages.len(), "Queue state saved");
        Ok(())
    }

    fn load(&self, queue: &str) -> Result<Vec<StoredMessage>> {
        let path = self.path_for(queue);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let json = std::fs::read_to_string(&path).map_err(|e| {
            FabricError::Store(format!("Failed to read state file {}: {}", path.display(), e))
        })?;

        let messages: Vec<StoredMessage> = serde_json::from_str(&json).map_err(|e| {
            FabricError::Store(format!("Failed to parse state file {}: {}", path.display(), e))
        })?;

        tracing::debug!(
            path = %path.display(),
            count = messages.len(),
            "Queue state loaded"
        );
        Ok(messages)
    }
}

/// In-memory queue store for testing
///
/// Snapshots live as long as the store, so a queue can be rebuilt from it.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: std::sync::RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl QueueStore for MemoryQueueStore {
    fn save(&self, queue: &str, messages: &[StoredMessage]) -> Result<()> {
        let mut state = self.state.write().map_err(|e| {
            FabricError::Store(format!("Failed to acquire state lock: {}", e))
        })?;
        state.insert(queue.to_string(), messages.to_vec());
        Ok(())
    }

    fn load(&self, queue: &str) -> Result<Vec<StoredMessage>> {
        let state = self.state.read().map_err(|e| {
            FabricError::Store(format!("Failed to acquire state lock: {}", e))
        })?;
        Ok(state.get(queue).cloned().unwrap_or_default())
    }
}
