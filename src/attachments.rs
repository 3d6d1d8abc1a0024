//! Binary attachment uploads with local fallback.
//!
//! A fresh upload is pushed straight to object storage when the backend is
//! reachable. When it is not, or the push fails, the upload is queued and the
//! caller gets an attachment that still points at the local path
//! (`is_local == true`). Queued uploads are retried by the reconciler through
//! [`AttachmentUploader::push_queued`], which runs the same push procedure.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{MousyError, MousyResult};
use crate::models::{AttachedFile, UploadKind, UploadQueueItem};
use crate::probe::ConnectivityProbe;
use crate::queue::{next_upload_id, UploadQueue};
use crate::remote::{storage_path, RemoteService};
use crate::validation::{sanitize_file_name, validate_mime_type, validate_record_id};

pub const IMAGE_MIME_TYPE: &str = "image/jpeg";
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Object-storage buckets used for each attachment kind
#[derive(Debug, Clone)]
pub struct Buckets {
    pub images: String,
    pub files: String,
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            images: "experiment-images".to_string(),
            files: "experiment-files".to_string(),
        }
    }
}

impl Buckets {
    pub fn for_kind(&self, kind: UploadKind) -> &str {
        match kind {
            UploadKind::Image => &self.images,
            UploadKind::File => &self.files,
        }
    }
}

pub struct AttachmentUploader<R: RemoteService> {
    remote: Arc<R>,
    probe: Arc<ConnectivityProbe<R>>,
    queue: UploadQueue,
    buckets: Buckets,
    owner_id: RwLock<Option<String>>,
}

impl<R: RemoteService> AttachmentUploader<R> {
    pub fn new(
        remote: Arc<R>,
        probe: Arc<ConnectivityProbe<R>>,
        queue: UploadQueue,
        buckets: Buckets,
        owner_id: Option<String>,
    ) -> Self {
        Self {
            remote,
            probe,
            queue,
            buckets,
            owner_id: RwLock::new(owner_id),
        }
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    /// Set or clear the signed-in user. Uploads need an owner to build the
    /// storage path.
    pub fn set_owner_id(&self, owner_id: Option<String>) {
        if let Ok(mut guard) = self.owner_id.write() {
            *guard = owner_id;
        }
    }

    fn owner_id(&self) -> MousyResult<String> {
        let guard = self
            .owner_id
            .read()
            .map_err(|_| MousyError::Other("owner lock poisoned".to_string()))?;
        guard
            .clone()
            .ok_or_else(|| MousyError::Auth("no signed-in user for attachment upload".to_string()))
    }

    /// Upload a photo taken for `experiment_id`.
    ///
    /// Stored as `<experiment_id>_<upload id>.jpg` in the image bucket. Upload
    /// ids never repeat, so two photos never share an object path.
    pub async fn upload_image(&self, experiment_id: &str, local_path: &str) -> MousyResult<AttachedFile> {
        validate_record_id(experiment_id, "experiment_id")?;
        let id = next_upload_id();
        let display_name = format!("{}_{}.jpg", experiment_id, id);

        self.upload(
            id,
            UploadKind::Image,
            experiment_id,
            local_path,
            display_name,
            IMAGE_MIME_TYPE.to_string(),
        )
        .await
    }

    /// Upload a document attached to `experiment_id`.
    ///
    /// The storage name is `file_name` with unsafe characters replaced, and
    /// the returned attachment carries that sanitized name.
    pub async fn upload_file(
        &self,
        experiment_id: &str,
        local_path: &str,
        file_name: &str,
        mime_type: Option<&str>,
    ) -> MousyResult<AttachedFile> {
        validate_record_id(experiment_id, "experiment_id")?;
        let mime_type = match mime_type {
            Some(mime) => {
                validate_mime_type(mime)?;
                mime.trim().to_string()
            }
            None => DEFAULT_MIME_TYPE.to_string(),
        };

        self.upload(
            next_upload_id(),
            UploadKind::File,
            experiment_id,
            local_path,
            sanitize_file_name(file_name),
            mime_type,
        )
        .await
    }

    async fn upload(
        &self,
        id: String,
        kind: UploadKind,
        experiment_id: &str,
        local_path: &str,
        display_name: String,
        mime_type: String,
    ) -> MousyResult<AttachedFile> {
        let size = match tokio::fs::metadata(local_path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MousyError::NotFound(format!("File does not exist: {}", local_path)));
            }
            Err(e) => return Err(e.into()),
        };

        let item = UploadQueueItem {
            id,
            experiment_id: experiment_id.to_string(),
            kind,
            local_path: local_path.to_string(),
            display_name,
            mime_type,
            size: Some(size),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_attempt_at: None,
        };

        if self.probe.is_online().await {
            match self.push_queued(&item).await {
                Ok(url) => {
                    tracing::info!(
                        experiment_id = %experiment_id,
                        kind = kind.as_str(),
                        "Uploaded attachment"
                    );
                    return Ok(AttachedFile {
                        id: Uuid::now_v7().to_string(),
                        name: item.display_name.clone(),
                        url,
                        size: Some(size),
                        mime_type: Some(item.mime_type.clone()),
                        uploaded_at: Utc::now(),
                        is_local: false,
                    });
                }
                Err(MousyError::Remote(e)) => {
                    tracing::warn!(
                        experiment_id = %experiment_id,
                        error = %e,
                        "Attachment upload failed, queueing for retry"
                    );
                    self.queue_pending(item)
                }
                Err(e) => Err(e),
            }
        } else {
            tracing::info!(experiment_id = %experiment_id, "Offline, queueing attachment upload");
            self.queue_pending(item)
        }
    }

    fn queue_pending(&self, item: UploadQueueItem) -> MousyResult<AttachedFile> {
        let attached = item.to_local_attachment();
        self.queue.enqueue(item)?;
        Ok(attached)
    }

    /// Push one upload to object storage and return its remote reference.
    ///
    /// The storage path is derived from the item's stable display name, so
    /// retrying the same item overwrites the same object.
    pub async fn push_queued(&self, item: &UploadQueueItem) -> MousyResult<String> {
        let owner_id = self.owner_id()?;
        let path = storage_path(&owner_id, &item.experiment_id, &item.display_name);

        let bytes = match tokio::fs::read(Path::new(&item.local_path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(MousyError::NotFound(format!(
                    "File does not exist: {}",
                    item.local_path
                )));
            }
            Err(e) => return Err(e.into()),
        };

        let bucket = self.buckets.for_kind(item.kind);
        let url = self
            .remote
            .upload_binary(bucket, &path, bytes, &item.mime_type)
            .await?;

        tracing::debug!(upload_id = %item.id, bucket = %bucket, path = %path, "Pushed attachment");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::probe::DEFAULT_PROBE_TIMEOUT;
    use crate::queue::DEFAULT_NAMESPACE;
    use crate::testing::FakeRemote;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        remote: Arc<FakeRemote>,
        uploader: AttachmentUploader<FakeRemote>,
        dir: TempDir,
    }

    fn fixture(owner_id: Option<&str>) -> Fixture {
        let remote = Arc::new(FakeRemote::new());
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let probe = Arc::new(ConnectivityProbe::new(remote.clone(), DEFAULT_PROBE_TIMEOUT));
        let uploader = AttachmentUploader::new(
            remote.clone(),
            probe,
            UploadQueue::new(db, DEFAULT_NAMESPACE),
            Buckets::default(),
            owner_id.map(String::from),
        );
        Fixture {
            remote,
            uploader,
            dir: TempDir::new().unwrap(),
        }
    }

    fn write_file(dir: &TempDir, name: &str, contents: &[u8]) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn test_online_image_upload() {
        let fx = fixture(Some("user-1"));
        let path = write_file(&fx.dir, "photo.jpg", b"jpegbytes");

        let attached = fx.uploader.upload_image("e1", &path).await.unwrap();

        assert!(!attached.is_local);
        assert!(attached.url.starts_with("https://storage.test/experiment-images/user-1/e1/e1_"));
        assert_eq!(attached.size, Some(9));
        assert_eq!(attached.mime_type.as_deref(), Some("image/jpeg"));

        let objects = fx.remote.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].bucket, "experiment-images");
        assert!(objects[0].path.ends_with(".jpg"));
        assert!(fx.uploader.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_offline_image_upload_is_queued() {
        let fx = fixture(Some("user-1"));
        fx.remote.set_online(false);
        let path = write_file(&fx.dir, "photo.jpg", b"jpegbytes");

        let attached = fx.uploader.upload_image("e1", &path).await.unwrap();

        assert!(attached.is_local);
        assert_eq!(attached.url, path);
        assert_eq!(fx.remote.upload_calls(), 0);

        let items = fx.uploader.queue().items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].kind, UploadKind::Image);
        assert_eq!(items[0].experiment_id, "e1");
        assert_eq!(items[0].id, attached.id);
    }

    #[tokio::test]
    async fn test_failed_upload_is_queued() {
        let fx = fixture(Some("user-1"));
        fx.remote.set_fail_uploads(true);
        let path = write_file(&fx.dir, "plate reader.csv", b"a,b\n1,2\n");

        let attached = fx
            .uploader
            .upload_file("e1", &path, "plate reader.csv", Some("text/csv"))
            .await
            .unwrap();

        assert!(attached.is_local);
        assert_eq!(attached.name, "plate_reader.csv");
        assert_eq!(fx.remote.upload_calls(), 1);

        let items = fx.uploader.queue().items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].display_name, "plate_reader.csv");
        assert_eq!(items[0].mime_type, "text/csv");
    }

    #[tokio::test]
    async fn test_file_upload_defaults() {
        let fx = fixture(Some("user-1"));
        let path = write_file(&fx.dir, "data.bin", b"\x00\x01");

        let attached = fx
            .uploader
            .upload_file("e1", &path, "data.bin", None)
            .await
            .unwrap();

        assert!(!attached.is_local);
        assert_eq!(attached.name, "data.bin");
        assert_eq!(attached.mime_type.as_deref(), Some(DEFAULT_MIME_TYPE));
        assert_eq!(fx.remote.objects()[0].path, "user-1/e1/data.bin");
        assert_eq!(fx.remote.objects()[0].bucket, "experiment-files");
    }

    #[tokio::test]
    async fn test_missing_file_fails_before_probe() {
        let fx = fixture(Some("user-1"));
        let missing = fx.dir.path().join("gone.jpg");

        let result = fx
            .uploader
            .upload_image("e1", &missing.to_string_lossy())
            .await;

        assert!(matches!(result, Err(MousyError::NotFound(_))));
        assert_eq!(fx.remote.probe_calls(), 0);
        assert!(fx.uploader.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_missing_owner_is_auth_error() {
        let fx = fixture(None);
        let path = write_file(&fx.dir, "photo.jpg", b"x");

        let result = fx.uploader.upload_image("e1", &path).await;
        assert!(matches!(result, Err(MousyError::Auth(_))));
        assert!(fx.uploader.queue().is_empty().unwrap());

        fx.uploader.set_owner_id(Some("user-2".to_string()));
        let attached = fx.uploader.upload_image("e1", &path).await.unwrap();
        assert!(attached.url.contains("/user-2/e1/"));
    }

    #[tokio::test]
    async fn test_online_file_upload_returns_sanitized_name() {
        let fx = fixture(Some("user-1"));
        let path = write_file(&fx.dir, "raw.csv", b"a,b\n");

        let attached = fx
            .uploader
            .upload_file("e1", &path, "weights (week 3).csv", Some("text/csv"))
            .await
            .unwrap();

        assert!(!attached.is_local);
        assert_eq!(attached.name, "weights__week_3_.csv");
        assert_eq!(fx.remote.objects()[0].path, "user-1/e1/weights__week_3_.csv");
    }

    #[tokio::test]
    async fn test_back_to_back_images_get_distinct_objects() {
        let fx = fixture(Some("user-1"));
        let first = write_file(&fx.dir, "a.jpg", b"first");
        let second = write_file(&fx.dir, "b.jpg", b"second");
        fx.remote.set_online(false);

        for _ in 0..50 {
            fx.uploader.upload_image("e1", &first).await.unwrap();
            fx.uploader.upload_image("e1", &second).await.unwrap();
        }

        let items = fx.uploader.queue().items().unwrap();
        assert_eq!(items.len(), 100);
        for item in &items {
            assert_eq!(item.display_name, format!("e1_{}.jpg", item.id));
        }

        fx.remote.set_online(true);
        for item in &items {
            fx.uploader.push_queued(item).await.unwrap();
        }

        let mut paths: Vec<String> = fx.remote.objects().into_iter().map(|o| o.path).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 100);
    }

    #[tokio::test]
    async fn test_invalid_mime_type_rejected() {
        let fx = fixture(Some("user-1"));
        let path = write_file(&fx.dir, "x.txt", b"x");

        let result = fx.uploader.upload_file("e1", &path, "x.txt", Some("text")).await;
        assert!(matches!(result, Err(MousyError::Validation { .. })));
    }
}
