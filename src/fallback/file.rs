//! Append-only, CRC-checked log backing the fallback store.
//!
//! Each frame is `[len: u32 LE][crc32: u32 LE][bincode(LogOp)]`. The live
//! entry set is rebuilt from the log on open; a torn or corrupt tail is cut
//! off. Once removed entries outnumber live ones (and pass the configured
//! threshold) the log is rewritten with only the live entries.
//!
//! A failed append is cut back to the last committed frame before the call
//! returns, so a half-written frame never hides entries written after it. If
//! the cut itself fails the store refuses all further writes.

use super::{EntryId, FallbackEntry, FallbackStore};
use crate::bus::PublishError;
use crate::types::Record;
use crate::{PipelineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const LOG_FILE: &str = "fallback.log";
const COMPACT_FILE: &str = "fallback.log.compact";
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
enum LogOp {
    Put(FallbackEntry),
    Remove(EntryId),
}

pub struct FileFallbackStore {
    dir: PathBuf,
    fsync_on_write: bool,
    compaction_threshold: usize,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    entries: BTreeMap<EntryId, FallbackEntry>,
    next_id: u64,
    tombstones: usize,
    // Length of the log up to the end of the last fully written frame
    committed_len: u64,
    broken: bool,
    #[cfg(test)]
    torn_writes: usize,
}

#[derive(Debug, Default)]
struct Recovered {
    entries: BTreeMap<EntryId, FallbackEntry>,
    next_id: u64,
    tombstones: usize,
    valid_len: usize,
}

impl FileFallbackStore {
    pub async fn open(dir: impl AsRef<Path>, fsync_on_write: bool, compaction_threshold: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        // A leftover compaction file means the rewrite never reached the rename
        match tokio::fs::remove_file(dir.join(COMPACT_FILE)).await {
            Ok(()) => warn!("Discarded incomplete fallback log compaction in {}", dir.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let log_path = dir.join(LOG_FILE);
        let data = match tokio::fs::read(&log_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let recovered = recover(&data);
        let file = open_append(&log_path).await?;

        if recovered.valid_len < data.len() {
            warn!(
                "Truncating {} trailing bytes of damaged fallback log {}",
                data.len() - recovered.valid_len,
                log_path.display()
            );
            file.set_len(recovered.valid_len as u64).await?;
            file.sync_all().await?;
        }

        info!(
            "Opened fallback store at {} with {} pending entries",
            dir.display(),
            recovered.entries.len()
        );

        Ok(Self {
            dir,
            fsync_on_write,
            compaction_threshold,
            state: Mutex::new(FileState {
                file,
                entries: recovered.entries,
                next_id: recovered.next_id,
                tombstones: recovered.tombstones,
                committed_len: recovered.valid_len as u64,
                broken: false,
                #[cfg(test)]
                torn_writes: 0,
            }),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    async fn append(&self, state: &mut FileState, op: &LogOp) -> Result<()> {
        if state.broken {
            return Err(PipelineError::FallbackStore(format!(
                "fallback log {} refuses writes after an unrecoverable write failure",
                self.path().display()
            )));
        }

        let frame = encode_frame(&bincode::serialize(op)?);
        match self.write_frame(state, &frame).await {
            Ok(()) => {
                state.committed_len += frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                match state.file.set_len(state.committed_len).await {
                    Ok(()) => warn!(
                        "Fallback log write failed, truncated back to {} bytes: {}",
                        state.committed_len, e
                    ),
                    Err(truncate_err) => {
                        state.broken = true;
                        error!(
                            "Fallback log {} holds a partial frame that could not be truncated ({}), refusing further writes: {}",
                            self.path().display(),
                            truncate_err,
                            e
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_frame(&self, state: &mut FileState, frame: &[u8]) -> Result<()> {
        if tear_next_write(state) {
            state.file.write_all(&frame[..frame.len() / 2]).await?;
            state.file.flush().await?;
            return Err(std::io::Error::new(ErrorKind::Other, "torn write").into());
        }

        state.file.write_all(frame).await?;
        state.file.flush().await?;
        if self.fsync_on_write {
            state.file.sync_data().await?;
        }
        Ok(())
    }

    async fn maybe_compact(&self, state: &mut FileState) -> Result<()> {
        if state.tombstones < self.compaction_threshold || state.tombstones <= state.entries.len() {
            return Ok(());
        }

        let compact_path = self.dir.join(COMPACT_FILE);
        let log_path = self.dir.join(LOG_FILE);

        let mut buffer = Vec::new();
        for entry in state.entries.values() {
            let payload = bincode::serialize(&LogOp::Put(entry.clone()))?;
            buffer.extend_from_slice(&encode_frame(&payload));
        }

        let written = async {
            let mut compact = File::create(&compact_path).await?;
            compact.write_all(&buffer).await?;
            compact.flush().await?;
            compact.sync_all().await?;
            drop(compact);
            tokio::fs::rename(&compact_path, &log_path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&compact_path).await;
            return Err(e.into());
        }

        // The old handle now points at the replaced file
        match open_append(&log_path).await {
            Ok(file) => {
                state.file = file;
                state.committed_len = buffer.len() as u64;
            }
            Err(e) => {
                state.broken = true;
                error!(
                    "Failed to reopen compacted fallback log {}, refusing further writes: {}",
                    log_path.display(),
                    e
                );
                return Err(e);
            }
        }

        debug!(
            "Compacted fallback log: dropped {} removed entries, kept {}",
            state.tombstones,
            state.entries.len()
        );
        state.tombstones = 0;
        Ok(())
    }
}

#[async_trait]
impl FallbackStore for FileFallbackStore {
    async fn put(
        &self,
        record: Record,
        attempt_count: u32,
        first_failure_at: DateTime<Utc>,
        last_error: Option<PublishError>,
    ) -> Result<EntryId> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let id = EntryId(state.next_id);
        let entry = FallbackEntry {
            id,
            record,
            attempt_count,
            first_failure_at,
            last_error,
            stored_at: Utc::now(),
        };

        let op = LogOp::Put(entry);
        self.append(state, &op).await?;

        if let LogOp::Put(entry) = op {
            state.entries.insert(id, entry);
        }
        state.next_id += 1;
        Ok(id)
    }

    async fn drain_batch(&self, limit: usize) -> Result<Vec<FallbackEntry>> {
        let state = self.state.lock().await;
        Ok(state.entries.values().take(limit).cloned().collect())
    }

    async fn remove(&self, id: EntryId) -> Result<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.entries.contains_key(&id) {
            return Ok(false);
        }

        self.append(state, &LogOp::Remove(id)).await?;
        state.entries.remove(&id);
        state.tombstones += 1;

        // The removal is already durable; a failed rewrite is retried on the next remove
        if let Err(e) = self.maybe_compact(state).await {
            warn!("Fallback log compaction failed, keeping the uncompacted log: {}", e);
        }
        Ok(true)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().await.entries.len())
    }
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

#[cfg(test)]
fn tear_next_write(state: &mut FileState) -> bool {
    if state.torn_writes == 0 {
        return false;
    }
    state.torn_writes -= 1;
    true
}

#[cfg(not(test))]
fn tear_next_write(_state: &mut FileState) -> bool {
    false
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

fn recover(data: &[u8]) -> Recovered {
    let mut recovered = Recovered::default();
    let mut pos = 0;

    while data.len() - pos >= FRAME_HEADER_LEN {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + FRAME_HEADER_LEN;

        if data.len() - start < len {
            break; // Torn write
        }
        let payload = &data[start..start + len];
        if crc32fast::hash(payload) != crc {
            break;
        }

        match bincode::deserialize::<LogOp>(payload) {
            Ok(LogOp::Put(entry)) => {
                recovered.next_id = recovered.next_id.max(entry.id.0 + 1);
                recovered.entries.insert(entry.id, entry);
            }
            Ok(LogOp::Remove(id)) => {
                recovered.next_id = recovered.next_id.max(id.0 + 1);
                if recovered.entries.remove(&id).is_some() {
                    recovered.tombstones += 1;
                }
            }
            Err(_) => break,
        }

        pos = start + len;
    }

    recovered.valid_len = pos;
    recovered
}
