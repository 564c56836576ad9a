// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable offline queue.
//!
//! The whole item set, including items currently leased to a delivery
//! attempt, is rewritten on every mutation through a temp file that is
//! fsynced and renamed over the queue file. A reader therefore only ever
//! sees a complete snapshot, and an item leased when the process dies is
//! simply pending again after the next load.

use crate::errors::QueueError;
use crate::records::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Assigned by the store, unique within one queue file.
    pub id: u64,
    #[serde(flatten)]
    pub envelope: Envelope,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedItem>,
    leased: BTreeMap<u64, QueuedItem>,
    next_id: u64,
}

impl QueueState {
    fn snapshot(&self) -> Vec<&QueuedItem> {
        self.leased.values().chain(self.pending.iter()).collect()
    }

    fn len(&self) -> usize {
        self.pending.len() + self.leased.len()
    }
}

/// Thread-safe handle over the queue file. Every mutating call holds one
/// lock across the in-memory change and the flush.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl QueueStore {
    /// Loads the queue file. A missing file is an empty queue; an unreadable
    /// or corrupt one is logged and treated as empty.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let items = read_snapshot(&path);
        let next_id = items.iter().map(|item| item.id + 1).max().unwrap_or(0);
        if !items.is_empty() {
            info!(
                "QUEUE | Loaded {} items from {}",
                items.len(),
                path.display()
            );
        }
        QueueStore {
            path,
            state: Mutex::new(QueueState {
                pending: items.into(),
                leased: BTreeMap::new(),
                next_id,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an item and flushes. On a flush error the item is still
    /// queued in memory.
    pub fn enqueue(&self, envelope: Envelope) -> Result<u64, QueueError> {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let kind = envelope.kind;
        state.pending.push_back(QueuedItem {
            id,
            envelope,
            enqueued_at: Utc::now(),
        });
        info!(
            "QUEUE | Queued {kind} for retry (queue size: {})",
            state.len()
        );
        self.flush(&state).map(|()| id)
    }

    /// Leases the oldest pending item. The item stays in the durable
    /// snapshot until [`complete`](Self::complete) or
    /// [`requeue`](Self::requeue) is called with it.
    pub fn drain_one(&self) -> Option<QueuedItem> {
        let mut state = self.lock();
        let item = state.pending.pop_front()?;
        state.leased.insert(item.id, item.clone());
        debug!("QUEUE | Leased item {} ({})", item.id, item.envelope.kind);
        Some(item)
    }

    /// Returns an item to the tail of the queue and flushes.
    pub fn requeue(&self, item: QueuedItem) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.leased.remove(&item.id);
        debug!("QUEUE | Requeued item {} ({})", item.id, item.envelope.kind);
        state.pending.push_back(item);
        self.flush(&state)
    }

    /// Drops a delivered item and flushes the shrunk queue.
    pub fn complete(&self, id: u64) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.leased.remove(&id).is_none() {
            return Err(QueueError::UnknownLease(id));
        }
        debug!("QUEUE | Completed item {id} (queue size: {})", state.len());
        self.flush(&state)
    }

    /// [`enqueue`](Self::enqueue) on the blocking pool, for async callers.
    pub async fn enqueue_off_runtime(
        self: &Arc<Self>,
        envelope: Envelope,
    ) -> Result<u64, QueueError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.enqueue(envelope)).await?
    }

    /// [`requeue`](Self::requeue) on the blocking pool, for async callers.
    pub async fn requeue_off_runtime(
        self: &Arc<Self>,
        item: QueuedItem,
    ) -> Result<(), QueueError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.requeue(item)).await?
    }

    /// [`complete`](Self::complete) on the blocking pool, for async callers.
    pub async fn complete_off_runtime(
        self: &Arc<Self>,
        id: u64,
    ) -> Result<(), QueueError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.complete(id)).await?
    }

    /// Items not yet delivered, leased ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Current content in snapshot order.
    #[must_use]
    pub fn items(&self) -> Vec<QueuedItem> {
        self.lock().snapshot().into_iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic elsewhere cannot leave the state half-mutated: every
        // mutation is a single push/pop/insert/remove.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, state: &QueueState) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec(&state.snapshot())?;
        write_atomically(&self.path, &bytes).map_err(|source| {
            error!(
                "QUEUE | Failed to save {}: {source}; {} items held in memory only",
                self.path.display(),
                state.len()
            );
            QueueError::Io {
                path: self.path.clone(),
                source,
            }
        })
    }
}

fn read_snapshot(path: &Path) -> Vec<QueuedItem> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            error!("QUEUE | Failed to read {}: {e}", path.display());
            return Vec::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(items) => items,
        Err(e) => {
            error!("QUEUE | Discarding unreadable queue file {}: {e}", path.display());
            Vec::new()
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.as_file_mut().write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::records::RecordKind;
    use serde_json::json;
    use tracing_test::traced_test;

    fn envelope(kind: RecordKind, radio_id: u32) -> Envelope {
        let serde_json::Value::Object(payload) = json!({ "radio_id": radio_id }) else {
            unreachable!()
        };
        Envelope {
            kind,
            payload,
            artifact_path: None,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::load(dir.path().join("queue.json"));
        assert!(store.is_empty());
        assert!(store.drain_one().is_none());
    }

    #[test]
    #[traced_test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = QueueStore::load(&path);
        assert!(store.is_empty());
        assert!(logs_contain("QUEUE | Discarding unreadable queue file"));
    }

    #[test]
    fn test_reload_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.json");
        let store = QueueStore::load(&path);
        store.enqueue(envelope(RecordKind::Sms, 1)).unwrap();
        let mut with_artifact = envelope(RecordKind::Transmission, 2);
        with_artifact.artifact_path = Some(PathBuf::from("/tmp/a.wav"));
        store.enqueue(with_artifact).unwrap();

        let reloaded = QueueStore::load(&path);
        assert_eq!(reloaded.items(), store.items());
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_fifo_order_and_requeue_to_tail() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::load(dir.path().join("queue.json"));
        let first = store.enqueue(envelope(RecordKind::Gps, 1)).unwrap();
        let second = store.enqueue(envelope(RecordKind::Gps, 2)).unwrap();

        let item = store.drain_one().unwrap();
        assert_eq!(item.id, first);
        store.requeue(item).unwrap();

        assert_eq!(store.drain_one().unwrap().id, second);
        assert_eq!(store.drain_one().unwrap().id, first);
        assert!(store.drain_one().is_none());
    }

    #[test]
    fn test_leased_item_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = QueueStore::load(&path);
        store.enqueue(envelope(RecordKind::Emergency, 0)).unwrap();

        let leased = store.drain_one().unwrap();
        assert_eq!(store.pending_len(), 0);
        assert_eq!(store.len(), 1);

        let reloaded = QueueStore::load(&path);
        assert_eq!(reloaded.pending_len(), 1);
        assert_eq!(reloaded.drain_one().unwrap(), leased);
    }

    #[test]
    fn test_complete_shrinks_durable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = QueueStore::load(&path);
        store.enqueue(envelope(RecordKind::Sms, 1)).unwrap();
        store.enqueue(envelope(RecordKind::Sms, 2)).unwrap();

        let item = store.drain_one().unwrap();
        store.complete(item.id).unwrap();

        let reloaded = QueueStore::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.items()[0].envelope.payload["radio_id"], 2);
        assert!(matches!(
            store.complete(item.id),
            Err(QueueError::UnknownLease(_))
        ));
    }

    #[tokio::test]
    async fn test_async_callers_flush_off_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = Arc::new(QueueStore::load(&path));
        store
            .enqueue_off_runtime(envelope(RecordKind::Sms, 1))
            .await
            .unwrap();
        store
            .enqueue_off_runtime(envelope(RecordKind::Gps, 2))
            .await
            .unwrap();

        let first = store.drain_one().unwrap();
        store.requeue_off_runtime(first).await.unwrap();
        let second = store.drain_one().unwrap();
        assert_eq!(second.envelope.kind, RecordKind::Gps);
        store.complete_off_runtime(second.id).await.unwrap();

        let reloaded = QueueStore::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.items()[0].envelope.kind, RecordKind::Sms);
    }

    #[test]
    fn test_ids_continue_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = QueueStore::load(&path);
        store.enqueue(envelope(RecordKind::Sms, 1)).unwrap();
        let last = store.enqueue(envelope(RecordKind::Sms, 2)).unwrap();

        let reloaded = QueueStore::load(&path);
        assert!(reloaded.enqueue(envelope(RecordKind::Sms, 3)).unwrap() > last);
    }

    #[test]
    fn test_flush_failure_keeps_item_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let store = QueueStore::load(blocker.join("queue.json"));

        let result = store.enqueue(envelope(RecordKind::Gps, 9));
        assert!(matches!(result, Err(QueueError::Io { .. })));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_enqueue_is_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let store = std::sync::Arc::new(QueueStore::load(&path));

        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        store.enqueue(envelope(RecordKind::Sms, n * 100 + i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(QueueStore::load(&path).len(), 80);
    }
}
