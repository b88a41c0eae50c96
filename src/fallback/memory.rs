use super::{EntryId, FallbackEntry, FallbackStore};
use crate::bus::PublishError;
use crate::types::Record;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Non-durable fallback store. Entries are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryFallbackStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<EntryId, FallbackEntry>,
    next_id: u64,
}

impl MemoryFallbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FallbackStore for MemoryFallbackStore {
    async fn put(
        &self,
        record: Record,
        attempt_count: u32,
        first_failure_at: DateTime<Utc>,
        last_error: Option<PublishError>,
    ) -> Result<EntryId> {
        let mut state = self.inner.lock();
        let id = EntryId(state.next_id);
        state.next_id += 1;
        state.entries.insert(
            id,
            FallbackEntry {
                id,
                record,
                attempt_count,
                first_failure_at,
                last_error,
                stored_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn drain_batch(&self, limit: usize) -> Result<Vec<FallbackEntry>> {
        let state = self.inner.lock();
        Ok(state.entries.values().take(limit).cloned().collect())
    }

    async fn remove(&self, id: EntryId) -> Result<bool> {
        Ok(self.inner.lock().entries.remove(&id).is_some())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.inner.lock().entries.len())
    }
}
