//! Durable queues for pending remote work.
//!
//! Both queues are ordered JSON arrays stored under a fixed key
//! (`<namespace>:sync_queue`, `<namespace>:upload_queue`). Every mutation is a
//! read-modify-write done while holding the database lock, so concurrent
//! callers can never lose each other's updates.
//!
//! A single undecodable entry is skipped with a warning rather than making the
//! whole queue unreadable. It is never dropped: every write puts it back
//! unchanged at its original position.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::{lock_database, Database};
use crate::error::{MousyError, MousyResult};
use crate::models::{SyncQueueItem, UploadQueueItem};

pub const DEFAULT_NAMESPACE: &str = "@mousy";

/// Storage key of the sync queue for `namespace`
pub fn sync_queue_key(namespace: &str) -> String {
    format!("{}:sync_queue", namespace)
}

/// Storage key of the upload queue for `namespace`
pub fn upload_queue_key(namespace: &str) -> String {
    format!("{}:upload_queue", namespace)
}

/// One stored queue entry, decoded or kept as the raw JSON it was read as.
#[derive(Serialize)]
#[serde(untagged)]
enum Entry<T> {
    Item(T),
    Undecodable(Value),
}

/// A queue as read from storage, written back in the same order.
struct StoredList<T> {
    entries: Vec<Entry<T>>,
}

impl<T: Serialize + DeserializeOwned> StoredList<T> {
    fn load(db: &Database, key: &str) -> MousyResult<Self> {
        let Some(raw) = db.get_value(key)? else {
            return Ok(Self { entries: Vec::new() });
        };

        let values: Vec<Value> =
            serde_json::from_str(&raw).map_err(|e| MousyError::decode(key, e.to_string()))?;

        let entries = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| match <T as Deserialize>::deserialize(&value) {
                Ok(item) => Entry::Item(item),
                Err(e) => {
                    tracing::warn!(key = %key, index = index, error = %e, "Keeping undecodable queue entry as is");
                    Entry::Undecodable(value)
                }
            })
            .collect();
        Ok(Self { entries })
    }

    fn save(&self, db: &Database, key: &str) -> MousyResult<()> {
        db.set_json(key, &self.entries)
    }

    fn into_items(self) -> Vec<T> {
        self.entries
            .into_iter()
            .filter_map(|entry| match entry {
                Entry::Item(item) => Some(item),
                Entry::Undecodable(_) => None,
            })
            .collect()
    }

    /// Keep decoded items matching `keep`. Returns how many were removed.
    fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| match entry {
            Entry::Item(item) => keep(item),
            Entry::Undecodable(_) => true,
        });
        before - self.entries.len()
    }

    fn find_mut(&mut self, mut matches: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.entries.iter_mut().find_map(|entry| match entry {
            Entry::Item(item) if matches(&*item) => Some(item),
            _ => None,
        })
    }

    fn push(&mut self, item: T) {
        self.entries.push(Entry::Item(item));
    }
}

/// Pending remote record writes, at most one per record id.
#[derive(Clone)]
pub struct SyncQueue {
    db: Arc<Mutex<Database>>,
    key: String,
}

impl SyncQueue {
    pub fn new(db: Arc<Mutex<Database>>, namespace: &str) -> Self {
        Self {
            db,
            key: sync_queue_key(namespace),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Insert `item`, replacing any entry with the same id.
    ///
    /// The replacement goes to the back of the queue.
    pub fn enqueue(&self, item: SyncQueueItem) -> MousyResult<()> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<SyncQueueItem> = StoredList::load(&db, &self.key)?;
        let replaced = list.retain(|existing| existing.id != item.id) > 0;

        tracing::debug!(
            record_id = %item.id,
            retry_count = item.retry_count,
            replaced = replaced,
            "Enqueued record for sync"
        );
        list.push(item);
        list.save(&db, &self.key)
    }

    /// Remove the entry for `id`. Returns whether one existed.
    pub fn dequeue(&self, id: &str) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<SyncQueueItem> = StoredList::load(&db, &self.key)?;

        if list.retain(|existing| existing.id != id) == 0 {
            return Ok(false);
        }
        list.save(&db, &self.key)?;
        Ok(true)
    }

    /// Remove `attempted` only if it is still the stored snapshot for its id.
    ///
    /// Returns false when a newer snapshot replaced it in the meantime.
    pub fn complete(&self, attempted: &SyncQueueItem) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<SyncQueueItem> = StoredList::load(&db, &self.key)?;

        if list.retain(|existing| !is_same_snapshot(existing, attempted)) == 0 {
            return Ok(false);
        }
        list.save(&db, &self.key)?;
        Ok(true)
    }

    /// Replace `attempted` with `retried` at the back of the queue, only if
    /// `attempted` is still the stored snapshot for its id.
    pub fn requeue(&self, attempted: &SyncQueueItem, retried: SyncQueueItem) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<SyncQueueItem> = StoredList::load(&db, &self.key)?;

        if list.retain(|existing| !is_same_snapshot(existing, attempted)) == 0 {
            return Ok(false);
        }
        list.push(retried);
        list.save(&db, &self.key)?;
        Ok(true)
    }

    /// Snapshot of the queue in drain order
    pub fn items(&self) -> MousyResult<Vec<SyncQueueItem>> {
        let db = lock_database(&self.db)?;
        Ok(StoredList::load(&db, &self.key)?.into_items())
    }

    pub fn get(&self, id: &str) -> MousyResult<Option<SyncQueueItem>> {
        Ok(self.items()?.into_iter().find(|item| item.id == id))
    }

    pub fn len(&self) -> MousyResult<usize> {
        Ok(self.items()?.len())
    }

    pub fn is_empty(&self) -> MousyResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn is_same_snapshot(a: &SyncQueueItem, b: &SyncQueueItem) -> bool {
    a.id == b.id && a.enqueued_at == b.enqueued_at
}

static LAST_UPLOAD_ID: AtomicI64 = AtomicI64::new(0);

/// Next upload id: current Unix millis, bumped past the last id handed out
/// so ids stay strictly increasing within the process.
pub fn next_upload_id() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_UPLOAD_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_UPLOAD_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => last = actual,
        }
    }
}

/// Pending binary uploads. No content dedup.
#[derive(Clone)]
pub struct UploadQueue {
    db: Arc<Mutex<Database>>,
    key: String,
}

impl UploadQueue {
    pub fn new(db: Arc<Mutex<Database>>, namespace: &str) -> Self {
        Self {
            db,
            key: upload_queue_key(namespace),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append `item` to the back of the queue
    pub fn enqueue(&self, item: UploadQueueItem) -> MousyResult<()> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<UploadQueueItem> = StoredList::load(&db, &self.key)?;

        tracing::debug!(
            upload_id = %item.id,
            experiment_id = %item.experiment_id,
            kind = item.kind.as_str(),
            "Enqueued upload"
        );
        list.push(item);
        list.save(&db, &self.key)
    }

    /// Remove the entry with `id`. Returns whether one existed.
    pub fn dequeue(&self, id: &str) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<UploadQueueItem> = StoredList::load(&db, &self.key)?;

        if list.retain(|existing| existing.id != id) == 0 {
            return Ok(false);
        }
        list.save(&db, &self.key)?;
        Ok(true)
    }

    /// Count one more failed attempt for `id`, in place.
    pub fn record_attempt(&self, id: &str, attempted_at: DateTime<Utc>) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        let mut list: StoredList<UploadQueueItem> = StoredList::load(&db, &self.key)?;

        let Some(item) = list.find_mut(|item| item.id == id) else {
            return Ok(false);
        };
        item.attempts += 1;
        item.last_attempt_at = Some(attempted_at);

        list.save(&db, &self.key)?;
        Ok(true)
    }

    /// Snapshot of the queue in drain order
    pub fn items(&self) -> MousyResult<Vec<UploadQueueItem>> {
        let db = lock_database(&self.db)?;
        Ok(StoredList::load(&db, &self.key)?.into_items())
    }

    pub fn len(&self) -> MousyResult<usize> {
        Ok(self.items()?.len())
    }

    pub fn is_empty(&self) -> MousyResult<bool> {
        Ok(self.len()? == 0)
    }
}
