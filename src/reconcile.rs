//! Queue reconciliation.
//!
//! The [`Reconciler`] walks the sync queue and the upload queue in FIFO order
//! and retries each pending item against the remote service. Item failures
//! never propagate: they only show up in the returned [`DrainCounts`] and in
//! the per-record synced flag.
//!
//! Drains are serialized by an async gate, so a manual drain started while the
//! background loop is mid-drain waits for it instead of racing it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::attachments::{AttachmentUploader, Buckets};
use crate::config::SyncOptions;
use crate::database::Database;
use crate::error::MousyResult;
use crate::local_store::LocalStore;
use crate::models::{DrainCounts, SyncQueueItem, UploadKind, UploadQueueItem};
use crate::probe::ConnectivityProbe;
use crate::queue::{SyncQueue, UploadQueue};
use crate::remote::RemoteService;

/// Delay between attempts of the same queue item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Retry on every drain
    #[default]
    None,
    /// Wait `base * 2^(attempts - 1)`, capped at `max`, after a failed attempt
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay required after `attempts` failed attempts
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { base, max } => {
                if attempts == 0 {
                    return Duration::ZERO;
                }
                let factor = 2u32.saturating_pow(attempts - 1);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Retry bookkeeping shared by both queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which an item is dropped (None = never dropped)
    pub max_retries: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Sync queue default: three attempts, no backoff
    pub const fn records() -> Self {
        Self {
            max_retries: Some(3),
            backoff: Backoff::None,
        }
    }

    /// Upload queue default: retried until it succeeds
    pub const fn uploads() -> Self {
        Self {
            max_retries: None,
            backoff: Backoff::None,
        }
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempts >= max)
    }

    pub fn is_due(&self, attempts: u32, last_attempt_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let delay = self.backoff.delay_for(attempts);
        if delay.is_zero() {
            return true;
        }
        let Some(last_attempt_at) = last_attempt_at else {
            return true;
        };
        // A last attempt in the future (clock moved back) counts as due
        now.signed_duration_since(last_attempt_at)
            .to_std()
            .map(|elapsed| elapsed >= delay)
            .unwrap_or(true)
    }
}

/// An upload pushed during a drain, with the reference it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUpload {
    pub queue_id: String,
    pub experiment_id: String,
    pub kind: UploadKind,
    pub local_path: String,
    pub url: String,
}

/// Result of draining both queues
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub online: bool,
    pub records: DrainCounts,
    pub uploads: DrainCounts,
    pub resolved: Vec<ResolvedUpload>,
}

pub struct Reconciler<R: RemoteService> {
    remote: Arc<R>,
    probe: Arc<ConnectivityProbe<R>>,
    store: LocalStore,
    sync_queue: SyncQueue,
    uploader: Arc<AttachmentUploader<R>>,
    records_table: String,
    record_retry: RetryPolicy,
    upload_retry: RetryPolicy,
    splice_resolved_uploads: bool,
    gate: tokio::sync::Mutex<()>,
}

impl<R: RemoteService> Reconciler<R> {
    /// Wire up the local store, both queues, the probe and the uploader over
    /// one shared database.
    pub fn new(remote: Arc<R>, db: Arc<Mutex<Database>>, options: &SyncOptions) -> Self {
        let probe = Arc::new(ConnectivityProbe::new(remote.clone(), options.probe_timeout));
        let uploader = Arc::new(AttachmentUploader::new(
            remote.clone(),
            probe.clone(),
            UploadQueue::new(db.clone(), &options.namespace),
            Buckets {
                images: options.image_bucket.clone(),
                files: options.file_bucket.clone(),
            },
            options.owner_id.clone(),
        ));

        Self {
            remote,
            probe,
            store: LocalStore::new(db.clone(), options.decode_mode),
            sync_queue: SyncQueue::new(db, &options.namespace),
            uploader,
            records_table: options.records_table.clone(),
            record_retry: options.record_retry,
            upload_retry: options.upload_retry,
            splice_resolved_uploads: options.splice_resolved_uploads,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn probe(&self) -> &ConnectivityProbe<R> {
        &self.probe
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn sync_queue(&self) -> &SyncQueue {
        &self.sync_queue
    }

    pub fn upload_queue(&self) -> &UploadQueue {
        self.uploader.queue()
    }

    pub fn uploader(&self) -> &AttachmentUploader<R> {
        &self.uploader
    }

    pub fn records_table(&self) -> &str {
        &self.records_table
    }

    /// Retry every pending record write. Offline or empty queue is a no-op.
    pub async fn drain_sync(&self) -> MousyResult<DrainCounts> {
        let _gate = self.gate.lock().await;

        if self.sync_queue.is_empty()? || !self.probe.is_online().await {
            return Ok(DrainCounts::default());
        }
        self.drain_sync_queue().await
    }

    /// Retry every pending upload. Offline or empty queue is a no-op.
    pub async fn drain_uploads(&self) -> MousyResult<DrainCounts> {
        let _gate = self.gate.lock().await;

        if self.upload_queue().is_empty()? || !self.probe.is_online().await {
            return Ok(DrainCounts::default());
        }
        let (counts, _) = self.drain_upload_queue().await?;
        Ok(counts)
    }

    /// Probe once, then drain the sync queue followed by the upload queue.
    pub async fn drain_all(&self) -> MousyResult<ReconcileSummary> {
        let _gate = self.gate.lock().await;

        if !self.probe.is_online().await {
            tracing::debug!("Offline, skipping reconciliation");
            return Ok(ReconcileSummary::default());
        }

        let records = self.drain_sync_queue().await?;
        let (uploads, resolved) = self.drain_upload_queue().await?;

        Ok(ReconcileSummary {
            online: true,
            records,
            uploads,
            resolved,
        })
    }

    /// One background tick. Errors are logged, never returned.
    pub async fn tick(&self) {
        match self.drain_all().await {
            Ok(summary) => {
                if !summary.records.is_empty() || !summary.uploads.is_empty() {
                    tracing::info!(
                        records_synced = summary.records.success,
                        records_failed = summary.records.failed,
                        uploads_done = summary.uploads.success,
                        uploads_failed = summary.uploads.failed,
                        "Background sync finished"
                    );
                }
            }
            Err(e) if e.is_local_storage() => {
                tracing::error!(error = %e, "Background sync could not read or write local storage");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Background sync failed");
            }
        }
    }

    async fn drain_sync_queue(&self) -> MousyResult<DrainCounts> {
        let mut counts = DrainCounts::default();

        for item in self.sync_queue.items()? {
            let now = Utc::now();

            if self.record_retry.is_exhausted(item.retry_count) {
                tracing::warn!(
                    record_id = %item.id,
                    retry_count = item.retry_count,
                    "Dropping record after too many failed sync attempts"
                );
                self.sync_queue.complete(&item)?;
                counts.failed += 1;
                continue;
            }

            if !self.record_retry.is_due(item.retry_count, item.last_attempt_at, now) {
                counts.deferred += 1;
                continue;
            }

            match self.remote.upsert_record(&self.records_table, &item.record).await {
                Ok(()) => {
                    self.store.mark_synced_as_of(&item.id, item.enqueued_at)?;
                    self.sync_queue.complete(&item)?;
                    counts.success += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        record_id = %item.id,
                        retry_count = item.retry_count,
                        error = %e,
                        "Record sync failed"
                    );
                    self.sync_queue.requeue(&item, item.retried(now))?;
                    counts.failed += 1;
                }
            }
        }

        Ok(counts)
    }

    async fn drain_upload_queue(&self) -> MousyResult<(DrainCounts, Vec<ResolvedUpload>)> {
        let mut counts = DrainCounts::default();
        let mut resolved = Vec::new();
        let queue = self.upload_queue();

        for item in queue.items()? {
            let now = Utc::now();

            if self.upload_retry.is_exhausted(item.attempts) {
                tracing::warn!(
                    upload_id = %item.id,
                    attempts = item.attempts,
                    "Dropping upload after too many failed attempts"
                );
                queue.dequeue(&item.id)?;
                counts.failed += 1;
                continue;
            }

            if !self.upload_retry.is_due(item.attempts, item.last_attempt_at, now) {
                counts.deferred += 1;
                continue;
            }

            match self.uploader.push_queued(&item).await {
                Ok(url) => {
                    queue.dequeue(&item.id)?;
                    counts.success += 1;

                    let upload = resolved_upload(&item, url);
                    if self.splice_resolved_uploads {
                        self.splice(&upload);
                    }
                    resolved.push(upload);
                }
                Err(e) => {
                    tracing::warn!(
                        upload_id = %item.id,
                        experiment_id = %item.experiment_id,
                        error = %e,
                        "Queued upload failed"
                    );
                    queue.record_attempt(&item.id, now)?;
                    counts.failed += 1;
                }
            }
        }

        Ok((counts, resolved))
    }

    /// Point the owning record at the uploaded object and queue the change.
    fn splice(&self, upload: &ResolvedUpload) {
        if let Err(e) = self.try_splice(upload) {
            tracing::warn!(
                upload_id = %upload.queue_id,
                experiment_id = %upload.experiment_id,
                error = %e,
                "Could not update record with uploaded attachment"
            );
        }
    }

    fn try_splice(&self, upload: &ResolvedUpload) -> MousyResult<bool> {
        let Some(stored) = self.store.load_locally(&upload.experiment_id)? else {
            return Ok(false);
        };

        let mut record = stored.record;
        if !record.resolve_attachment(&upload.queue_id, &upload.local_path, &upload.url) {
            return Ok(false);
        }
        record.updated_at = Utc::now();

        self.store.save_locally(&record)?;
        self.sync_queue.enqueue(SyncQueueItem::new(record))?;

        tracing::debug!(
            experiment_id = %upload.experiment_id,
            upload_id = %upload.queue_id,
            "Replaced local attachment reference"
        );
        Ok(true)
    }
}

fn resolved_upload(item: &UploadQueueItem, url: String) -> ResolvedUpload {
    ResolvedUpload {
        queue_id: item.id.clone(),
        experiment_id: item.experiment_id.clone(),
        kind: item.kind,
        local_path: item.local_path.clone(),
        url,
    }
}
