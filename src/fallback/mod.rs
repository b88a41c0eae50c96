//! Durable holding area for records that could not be delivered.

pub mod file;
pub mod memory;
pub mod replayer;

use crate::bus::PublishError;
use crate::config::{FallbackBackend, FallbackConfig};
use crate::types::Record;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use file::FileFallbackStore;
pub use memory::MemoryFallbackStore;
pub use replayer::{FallbackReplayer, ReplayReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fallback-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub id: EntryId,
    pub record: Record,
    pub attempt_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_error: Option<PublishError>,
    pub stored_at: DateTime<Utc>,
}

#[async_trait]
pub trait FallbackStore: Send + Sync {
    async fn put(
        &self,
        record: Record,
        attempt_count: u32,
        first_failure_at: DateTime<Utc>,
        last_error: Option<PublishError>,
    ) -> Result<EntryId>;

    /// Oldest entries first, at most `limit` of them.
    ///
    /// Entries stay in the store until `remove` is called, so a batch that
    /// could not be resubmitted is returned again by the next call.
    async fn drain_batch(&self, limit: usize) -> Result<Vec<FallbackEntry>>;

    /// Deletes an entry after successful replay or an operator purge.
    /// Returns whether the entry existed.
    async fn remove(&self, id: EntryId) -> Result<bool>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Opens the backend selected by `config`.
pub async fn open_store(config: &FallbackConfig) -> Result<Arc<dyn FallbackStore>> {
    match &config.backend {
        FallbackBackend::Memory => Ok(Arc::new(MemoryFallbackStore::new())),
        FallbackBackend::File { path } => {
            let store = FileFallbackStore::open(path, config.fsync_on_write, config.compaction_threshold).await?;
            Ok(Arc::new(store))
        }
    }
}
