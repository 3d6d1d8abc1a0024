//! Save orchestrator.
//!
//! [`SyncService`] is the entry point the app talks to. A save always lands
//! in the local store first; only then is the remote attempted. Anything that
//! cannot be written remotely right now goes to the sync queue and is picked
//! up by the reconciler later.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SyncOptions;
use crate::database::Database;
use crate::error::MousyResult;
use crate::models::{AttachedFile, ExperimentRecord, StoredRecord, SyncQueueItem, UploadQueueItem};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::remote::RemoteService;
use crate::scheduler::AutoSync;
use crate::validation::{validate_record, validate_record_id};

/// Result of a save.
///
/// `synced` is true only when the remote write succeeded during this call.
/// `error` carries the remote failure message when the write was attempted
/// and failed; it is None when the device was offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SyncService<R: RemoteService> {
    reconciler: Arc<Reconciler<R>>,
    auto_sync: AutoSync<R>,
}

impl<R: RemoteService> SyncService<R> {
    /// Build the full pipeline over `db` with a scheduler using the
    /// configured interval.
    pub fn new(remote: Arc<R>, db: Arc<Mutex<Database>>, options: &SyncOptions) -> Self {
        let reconciler = Arc::new(Reconciler::new(remote, db, options));
        let auto_sync = AutoSync::new(reconciler.clone(), options.auto_sync_interval);
        Self::with_auto_sync(reconciler, auto_sync)
    }

    /// Assemble from an existing reconciler and scheduler
    pub fn with_auto_sync(reconciler: Arc<Reconciler<R>>, auto_sync: AutoSync<R>) -> Self {
        Self {
            reconciler,
            auto_sync,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<R>> {
        &self.reconciler
    }

    /// Save a record locally, then try to write it remotely.
    ///
    /// Returns `Err` only when validation or local persistence fails. A
    /// remote failure is queued and reported through [`SaveOutcome::error`].
    pub async fn save(&self, record: &ExperimentRecord) -> MousyResult<SaveOutcome> {
        validate_record(record)?;

        let store = self.reconciler.store();
        let sync_queue = self.reconciler.sync_queue();
        let saved_at = store.save_locally(record)?;

        if !self.reconciler.probe().is_online().await {
            sync_queue.enqueue(SyncQueueItem::new(record.clone()))?;
            tracing::info!(record_id = %record.id, "Offline, queued record for sync");
            return Ok(SaveOutcome {
                synced: false,
                error: None,
            });
        }

        let result = self
            .reconciler
            .remote()
            .upsert_record(self.reconciler.records_table(), record)
            .await;

        match result {
            Ok(()) => {
                store.mark_synced_as_of(&record.id, saved_at)?;

                // An older queued snapshot must not overwrite this write later
                if let Some(stale) = sync_queue.get(&record.id)? {
                    if stale.enqueued_at <= saved_at {
                        sync_queue.complete(&stale)?;
                    }
                }

                tracing::info!(record_id = %record.id, "Record saved and synced");
                Ok(SaveOutcome {
                    synced: true,
                    error: None,
                })
            }
            Err(e) => {
                tracing::warn!(record_id = %record.id, error = %e, "Remote save failed, queued for sync");
                sync_queue.enqueue(SyncQueueItem::new(record.clone()))?;
                Ok(SaveOutcome {
                    synced: false,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    pub fn load_locally(&self, id: &str) -> MousyResult<Option<StoredRecord>> {
        self.reconciler.store().load_locally(id)
    }

    pub fn is_synced(&self, id: &str) -> MousyResult<bool> {
        self.reconciler.store().is_synced(id)
    }

    /// Whether a record should show a pending badge: not yet written
    /// remotely, or still holding local-only attachments.
    pub fn needs_sync(&self, id: &str) -> MousyResult<bool> {
        self.reconciler.store().needs_sync(id)
    }

    /// Ids of local records still waiting for a remote write
    pub fn unsynced_record_ids(&self) -> MousyResult<Vec<String>> {
        self.reconciler.store().unsynced_ids()
    }

    /// Delete a record remotely, then drop its local shadow and any pending
    /// sync entry. Nothing local changes if the remote delete fails.
    pub async fn delete(&self, id: &str) -> MousyResult<()> {
        validate_record_id(id, "id")?;

        self.reconciler
            .remote()
            .delete_record(self.reconciler.records_table(), id)
            .await?;

        self.reconciler.store().remove_locally(id)?;
        self.reconciler.sync_queue().dequeue(id)?;

        tracing::info!(record_id = %id, "Deleted record");
        Ok(())
    }

    /// Read the remote copy of a record
    pub async fn fetch_remote(&self, id: &str) -> MousyResult<Option<ExperimentRecord>> {
        validate_record_id(id, "id")?;
        let record = self
            .reconciler
            .remote()
            .fetch_record(self.reconciler.records_table(), id)
            .await?;
        Ok(record)
    }

    pub async fn upload_image(&self, experiment_id: &str, local_path: &str) -> MousyResult<AttachedFile> {
        self.reconciler
            .uploader()
            .upload_image(experiment_id, local_path)
            .await
    }

    pub async fn upload_file(
        &self,
        experiment_id: &str,
        local_path: &str,
        file_name: &str,
        mime_type: Option<&str>,
    ) -> MousyResult<AttachedFile> {
        self.reconciler
            .uploader()
            .upload_file(experiment_id, local_path, file_name, mime_type)
            .await
    }

    /// Set or clear the signed-in user used for upload paths
    pub fn set_owner_id(&self, owner_id: Option<String>) {
        self.reconciler.uploader().set_owner_id(owner_id);
    }

    /// Drain both queues now, regardless of the scheduler state.
    pub async fn manual_sync(&self) -> MousyResult<ReconcileSummary> {
        let summary = self.reconciler.drain_all().await?;
        tracing::info!(
            online = summary.online,
            records_synced = summary.records.success,
            records_failed = summary.records.failed,
            uploads_done = summary.uploads.success,
            uploads_failed = summary.uploads.failed,
            "Manual sync finished"
        );
        Ok(summary)
    }

    pub fn start_auto_sync(&self) -> MousyResult<bool> {
        self.auto_sync.start()
    }

    pub fn stop_auto_sync(&self) -> bool {
        self.auto_sync.stop()
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.auto_sync.is_running()
    }

    pub fn auto_sync_interval(&self) -> Duration {
        self.auto_sync.interval()
    }

    /// Stop the scheduler and wait for a running drain to finish
    pub async fn shutdown(&self) {
        self.auto_sync.shutdown().await;
    }

    pub fn pending_sync_items(&self) -> MousyResult<Vec<SyncQueueItem>> {
        self.reconciler.sync_queue().items()
    }

    pub fn pending_uploads(&self) -> MousyResult<Vec<UploadQueueItem>> {
        self.reconciler.upload_queue().items()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MousyError;
    use crate::models::{DrainCounts, ExperimentStage, UploadKind};
    use crate::testing::FakeRemote;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn service() -> (Arc<FakeRemote>, SyncService<FakeRemote>) {
        let remote = Arc::new(FakeRemote::new());
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let options = SyncOptions {
            owner_id: Some("user-1".to_string()),
            ..SyncOptions::default()
        };
        (remote.clone(), SyncService::new(remote, db, &options))
    }

    fn run_a() -> ExperimentRecord {
        ExperimentRecord::new("p1", "Run A", ExperimentStage::InVivo).with_id("e1")
    }

    #[tokio::test]
    async fn test_online_save_syncs_immediately() {
        let (remote, service) = service();

        let outcome = service.save(&run_a()).await.unwrap();

        assert_eq!(outcome, SaveOutcome { synced: true, error: None });
        assert!(service.load_locally("e1").unwrap().unwrap().synced);
        assert!(service.pending_sync_items().unwrap().is_empty());
        assert_eq!(remote.stored_record("e1").unwrap().title, "Run A");
    }

    #[tokio::test]
    async fn test_offline_save_queues_without_remote_write() {
        let (remote, service) = service();
        remote.set_online(false);

        let outcome = service.save(&run_a()).await.unwrap();

        assert_eq!(outcome, SaveOutcome { synced: false, error: None });
        assert_eq!(remote.upsert_calls(), 0);
        assert!(!service.load_locally("e1").unwrap().unwrap().synced);

        let pending = service.pending_sync_items().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "e1");
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_drain_after_offline_save() {
        let (remote, service) = service();
        remote.set_online(false);
        service.save(&run_a()).await.unwrap();

        remote.set_online(true);
        let summary = service.manual_sync().await.unwrap();

        assert_eq!(summary.records, DrainCounts { success: 1, failed: 0, deferred: 0 });
        assert!(service.pending_sync_items().unwrap().is_empty());
        assert!(service.is_synced("e1").unwrap());
    }

    #[tokio::test]
    async fn test_remote_failure_is_reported_and_queued() {
        let (remote, service) = service();
        remote.set_fail_upserts(true);

        let outcome = service.save(&run_a()).await.unwrap();

        assert!(!outcome.synced);
        assert!(outcome.error.unwrap().contains("500"));
        assert_eq!(service.pending_sync_items().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_later_snapshot_wins_in_queue() {
        let (remote, service) = service();
        remote.set_online(false);

        service.save(&run_a()).await.unwrap();
        let mut edited = run_a();
        edited.title = "Run A (edited)".to_string();
        service.save(&edited).await.unwrap();

        let pending = service.pending_sync_items().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.title, "Run A (edited)");

        remote.set_online(true);
        service.manual_sync().await.unwrap();
        assert_eq!(remote.stored_record("e1").unwrap().title, "Run A (edited)");
    }

    #[tokio::test]
    async fn test_online_save_clears_older_queued_snapshot() {
        let (remote, service) = service();
        remote.set_online(false);
        service.save(&run_a()).await.unwrap();

        remote.set_online(true);
        let mut edited = run_a();
        edited.title = "Run A (edited)".to_string();
        service.save(&edited).await.unwrap();

        assert!(service.pending_sync_items().unwrap().is_empty());
        assert!(service.is_synced("e1").unwrap());
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_id() {
        let (remote, service) = service();
        let record = run_a().with_id("bad/id");

        let result = service.save(&record).await;
        assert!(matches!(result, Err(MousyError::Validation { .. })));
        assert!(service.load_locally("bad/id").unwrap().is_none());
        assert_eq!(remote.probe_calls(), 0);
    }

    #[tokio::test]
    async fn test_long_title_is_saved_locally() {
        let (remote, service) = service();
        remote.set_online(false);
        let mut record = run_a();
        record.title = "t".repeat(501);

        let outcome = service.save(&record).await.unwrap();

        assert!(!outcome.synced);
        let stored = service.load_locally("e1").unwrap().unwrap();
        assert_eq!(stored.record.title.len(), 501);
    }

    #[tokio::test]
    async fn test_needs_sync_tracks_record_and_attachments() {
        let (remote, service) = service();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let path = path.to_string_lossy().to_string();

        assert!(!service.needs_sync("e1").unwrap());

        remote.set_online(false);
        let attached = service.upload_image("e1", &path).await.unwrap();
        let mut record = run_a();
        record.images.push(attached.url.clone());
        service.save(&record).await.unwrap();

        assert!(service.needs_sync("e1").unwrap());
        assert_eq!(service.unsynced_record_ids().unwrap(), vec!["e1".to_string()]);

        // the record reaches the backend but its photo is still local
        remote.set_online(true);
        service.reconciler().drain_sync().await.unwrap();
        assert!(service.is_synced("e1").unwrap());
        assert!(service.unsynced_record_ids().unwrap().is_empty());
        assert!(service.needs_sync("e1").unwrap());

        service.manual_sync().await.unwrap();
        service.manual_sync().await.unwrap();
        assert!(!service.needs_sync("e1").unwrap());
    }

    #[tokio::test]
    async fn test_is_synced_for_unknown_record() {
        let (_remote, service) = service();
        assert!(service.is_synced("never-saved").unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let (remote, service) = service();
        remote.set_online(false);
        service.save(&run_a()).await.unwrap();

        // remote delete fails while offline, local state is untouched
        assert!(service.delete("e1").await.is_err());
        assert!(service.load_locally("e1").unwrap().is_some());

        remote.set_online(true);
        service.delete("e1").await.unwrap();
        assert!(service.load_locally("e1").unwrap().is_none());
        assert!(service.pending_sync_items().unwrap().is_empty());
        assert_eq!(remote.delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_remote() {
        let (_remote, service) = service();
        service.save(&run_a()).await.unwrap();

        let fetched = service.fetch_remote("e1").await.unwrap().unwrap();
        assert_eq!(fetched.title, "Run A");
        assert!(service.fetch_remote("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_upload_then_manual_sync() {
        let (remote, service) = service();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg").unwrap();
        let path = path.to_string_lossy().to_string();

        remote.set_online(false);
        let attached = service.upload_image("e1", &path).await.unwrap();
        assert!(attached.is_local);
        assert_eq!(attached.url, path);

        let uploads = service.pending_uploads().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].kind, UploadKind::Image);

        remote.set_online(true);
        let summary = service.manual_sync().await.unwrap();
        assert_eq!(summary.uploads.success, 1);
        assert!(service.pending_uploads().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_drains_queue() {
        let (remote, service) = service();
        remote.set_online(false);
        service.save(&run_a()).await.unwrap();
        remote.set_online(true);

        assert!(service.start_auto_sync().unwrap());
        assert!(!service.start_auto_sync().unwrap());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(service.is_synced("e1").unwrap());
        assert!(service.pending_sync_items().unwrap().is_empty());

        assert!(service.stop_auto_sync());
        assert!(!service.is_auto_sync_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sync_waits_for_running_tick() {
        let (remote, service) = service();
        remote.set_online(false);
        service.save(&run_a()).await.unwrap();
        remote.set_online(true);
        remote.set_probe_delay(Some(Duration::from_secs(2)));

        service.start_auto_sync().unwrap();
        let interval = service.auto_sync_interval();
        tokio::time::sleep(interval + Duration::from_millis(1)).await;

        // the tick holds the drain gate while its probe is in flight
        assert_eq!(remote.probe_calls(), 1);
        assert_eq!(remote.upsert_calls(), 0);

        let summary = service.manual_sync().await.unwrap();

        assert!(summary.online);
        assert_eq!(summary.records, DrainCounts::default());
        assert_eq!(remote.upsert_calls(), 1);
        assert_eq!(remote.probe_calls(), 2);
        assert!(service.pending_sync_items().unwrap().is_empty());
        assert!(service.is_synced("e1").unwrap());

        service.shutdown().await;
    }
}
