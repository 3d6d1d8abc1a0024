//! In-memory remote service for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::models::ExperimentRecord;
use crate::remote::{RemoteError, RemoteService};

/// A stored binary object
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub size: usize,
    pub content_type: String,
}

/// Remote double with switchable connectivity and failure modes.
///
/// While offline every call fails with a network error, like a real
/// unreachable backend.
pub struct FakeRemote {
    online: AtomicBool,
    fail_upserts: AtomicBool,
    fail_uploads: AtomicBool,
    probe_delay: Mutex<Option<Duration>>,
    probe_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    records: Mutex<HashMap<String, ExperimentRecord>>,
    objects: Mutex<Vec<StoredObject>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            fail_upserts: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            probe_delay: Mutex::new(None),
            probe_calls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            records: Mutex::new(HashMap::new()),
            objects: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn stored_record(&self, id: &str) -> Option<ExperimentRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }

    pub fn insert_record(&self, record: ExperimentRecord) {
        self.records.lock().unwrap().insert(record.id.clone(), record);
    }

    pub fn objects(&self) -> Vec<StoredObject> {
        self.objects.lock().unwrap().clone()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("backend unreachable".to_string()))
        }
    }
}

impl RemoteService for FakeRemote {
    async fn upsert_record(&self, _table: &str, record: &ExperimentRecord) -> Result<(), RemoteError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 500,
                body: "upsert rejected".to_string(),
            });
        }
        self.insert_record(record.clone());
        Ok(())
    }

    async fn fetch_record(&self, _table: &str, id: &str) -> Result<Option<ExperimentRecord>, RemoteError> {
        self.check_online()?;
        Ok(self.stored_record(id))
    }

    async fn delete_record(&self, _table: &str, id: &str) -> Result<(), RemoteError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.records.lock().unwrap().remove(id);
        Ok(())
    }

    async fn upload_binary(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Status {
                status: 503,
                body: "storage unavailable".to_string(),
            });
        }
        self.objects.lock().unwrap().push(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
            size: bytes.len(),
            content_type: content_type.to_string(),
        });
        Ok(format!("https://storage.test/{}/{}", bucket, path))
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_online()
    }
}
