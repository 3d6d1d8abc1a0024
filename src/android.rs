//! Mobile bindings for Mousy.
//!
//! This module provides a simplified API for the Android and iOS apps,
//! exposed via UniFFI bindings. Records cross the boundary as JSON strings
//! in the same camelCase shape the app already stores.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::{Config, SyncOptions};
use crate::database::Database;
use crate::error::MousyError;
use crate::local_store::LocalStore;
use crate::models::{AttachedFile, ExperimentRecord};
use crate::queue::{SyncQueue, UploadQueue};
use crate::remote::RemoteError;
use crate::rest_remote::{RestRemote, RestRemoteConfig};
use crate::sync_service::SyncService;

/// Error type exposed to Kotlin/Swift via UniFFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum MousyCoreError {
    #[error("Database error: {msg}")]
    Database { msg: String },
    #[error("Configuration error: {msg}")]
    Config { msg: String },
    #[error("Remote error: {msg}")]
    Remote { msg: String },
    #[error("Validation error: {msg}")]
    Validation { msg: String },
    #[error("Authentication required: {msg}")]
    Auth { msg: String },
    #[error("Not found: {msg}")]
    NotFound { msg: String },
    #[error("IO error: {msg}")]
    Io { msg: String },
}

impl From<MousyError> for MousyCoreError {
    fn from(err: MousyError) -> Self {
        match err {
            MousyError::Validation { field, message } => MousyCoreError::Validation {
                msg: format!("{}: {}", field, message),
            },
            MousyError::Database(e) => MousyCoreError::Database { msg: e.to_string() },
            MousyError::DatabaseOperation(msg) => MousyCoreError::Database { msg },
            e @ MousyError::Decode { .. } => MousyCoreError::Database { msg: e.to_string() },
            MousyError::Remote(e) => e.into(),
            MousyError::Auth(msg) => MousyCoreError::Auth { msg },
            MousyError::Config(msg) => MousyCoreError::Config { msg },
            MousyError::Io(e) => MousyCoreError::Io { msg: e.to_string() },
            MousyError::Json(e) => MousyCoreError::Validation { msg: e.to_string() },
            MousyError::NotFound(msg) => MousyCoreError::NotFound { msg },
            MousyError::Other(msg) => MousyCoreError::Database { msg },
        }
    }
}

impl From<RemoteError> for MousyCoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Config(msg) => MousyCoreError::Config { msg },
            RemoteError::Auth(msg) => MousyCoreError::Auth { msg },
            RemoteError::NotFound(msg) => MousyCoreError::NotFound { msg },
            other => MousyCoreError::Remote {
                msg: other.to_string(),
            },
        }
    }
}

/// Result of saving an experiment
#[derive(Debug, Clone, uniffi::Record)]
pub struct SaveResultData {
    pub synced: bool,
    pub error_message: Option<String>,
}

/// An attachment as returned to the app
#[derive(Debug, Clone, uniffi::Record)]
pub struct AttachedFileData {
    pub id: String,
    pub name: String,
    pub url: String,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
    pub uploaded_at: String,
    pub is_local: bool,
}

impl From<AttachedFile> for AttachedFileData {
    fn from(file: AttachedFile) -> Self {
        Self {
            id: file.id,
            name: file.name,
            url: file.url,
            size: file.size,
            mime_type: file.mime_type,
            uploaded_at: file.uploaded_at.to_rfc3339(),
            is_local: file.is_local,
        }
    }
}

/// Sync operation result
#[derive(Debug, Clone, uniffi::Record)]
pub struct SyncResultData {
    pub online: bool,
    pub records_synced: u32,
    pub records_failed: u32,
    pub uploads_done: u32,
    pub uploads_failed: u32,
}

/// Number of items waiting in each queue
#[derive(Debug, Clone, uniffi::Record)]
pub struct PendingCounts {
    pub sync_items: u32,
    pub uploads: u32,
    pub unsynced_records: u32,
}

/// Backend connection settings
#[derive(Debug, Clone, uniffi::Record)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

/// Main client for Mousy operations on mobile
#[derive(uniffi::Object)]
pub struct LabClient {
    runtime: tokio::runtime::Runtime,
    config: Mutex<Config>,
    db: Arc<Mutex<Database>>,
    service: RwLock<Option<Arc<SyncService<RestRemote>>>>,
}

impl LabClient {
    fn config(&self) -> Result<MutexGuard<'_, Config>, MousyCoreError> {
        self.config.lock().map_err(|_| MousyCoreError::Config {
            msg: "config lock poisoned".to_string(),
        })
    }

    fn options(&self) -> Result<SyncOptions, MousyCoreError> {
        let cfg = self.config()?;
        Ok(SyncOptions::from_config(&cfg)?)
    }

    fn service(&self) -> Result<Arc<SyncService<RestRemote>>, MousyCoreError> {
        let service = self.service.read().map_err(|_| MousyCoreError::Config {
            msg: "service lock poisoned".to_string(),
        })?;
        service.clone().ok_or_else(|| MousyCoreError::Config {
            msg: "Remote backend is not configured".to_string(),
        })
    }

    fn local_store(&self) -> Result<LocalStore, MousyCoreError> {
        Ok(LocalStore::new(self.db.clone(), self.options()?.decode_mode))
    }

    /// Build the sync pipeline from the current config and start the
    /// background loop when enabled.
    fn rebuild_service(&self) -> Result<(), MousyCoreError> {
        let (remote_config, options, auto_sync) = {
            let cfg = self.config()?;
            if !cfg.is_remote_configured() {
                return Ok(());
            }
            (
                RestRemoteConfig::from_config(&cfg),
                SyncOptions::from_config(&cfg)?,
                cfg.sync_config().auto_sync_enabled,
            )
        };

        let remote = Arc::new(RestRemote::new(remote_config)?);
        let service = Arc::new(SyncService::new(remote, self.db.clone(), &options));

        if auto_sync {
            let _guard = self.runtime.enter();
            service.start_auto_sync()?;
        }

        let mut slot = self.service.write().map_err(|_| MousyCoreError::Config {
            msg: "service lock poisoned".to_string(),
        })?;
        if let Some(previous) = slot.replace(service) {
            previous.stop_auto_sync();
        }
        Ok(())
    }
}

#[uniffi::export]
impl LabClient {
    /// Create a new LabClient with the given data directory
    #[uniffi::constructor]
    pub fn new(data_dir: String) -> Result<Arc<Self>, MousyCoreError> {
        let data_path = PathBuf::from(&data_dir);

        // Create directory if it doesn't exist
        std::fs::create_dir_all(&data_path).map_err(|e| MousyCoreError::Io {
            msg: format!("Failed to create data directory: {}", e),
        })?;

        let config = Config::new(Some(data_path))?;
        let db = Database::new(config.database_file())?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mousy-sync")
            .enable_all()
            .build()
            .map_err(|e| MousyCoreError::Io {
                msg: format!("Failed to create runtime: {}", e),
            })?;

        let client = Self {
            runtime,
            config: Mutex::new(config),
            db: Arc::new(Mutex::new(db)),
            service: RwLock::new(None),
        };
        client.rebuild_service()?;

        Ok(Arc::new(client))
    }

    /// Point the client at a backend and sign in
    pub fn configure_remote(&self, settings: RemoteSettings) -> Result<(), MousyCoreError> {
        {
            let mut cfg = self.config()?;
            cfg.set_remote_endpoint(
                &settings.base_url,
                &settings.api_key,
                settings.access_token.as_deref(),
            )?;
            cfg.set_user_id(settings.user_id.as_deref())?;
        }
        self.rebuild_service()
    }

    /// Check if a backend is configured
    pub fn is_remote_configured(&self) -> bool {
        self.config()
            .map(|cfg| cfg.is_remote_configured())
            .unwrap_or(false)
    }

    /// Save an experiment given as JSON
    pub fn save_experiment(&self, experiment_json: String) -> Result<SaveResultData, MousyCoreError> {
        let record: ExperimentRecord =
            serde_json::from_str(&experiment_json).map_err(|e| MousyCoreError::Validation {
                msg: format!("Invalid experiment JSON: {}", e),
            })?;

        let service = self.service()?;
        let outcome = self.runtime.block_on(service.save(&record))?;

        Ok(SaveResultData {
            synced: outcome.synced,
            error_message: outcome.error,
        })
    }

    /// Load the local copy of an experiment as JSON
    pub fn load_experiment(&self, id: String) -> Result<Option<String>, MousyCoreError> {
        let stored = self.local_store()?.load_locally(&id)?;
        match stored {
            Some(stored) => Ok(Some(serde_json::to_string(&stored).map_err(MousyError::from)?)),
            None => Ok(None),
        }
    }

    /// Whether the local copy has reached the backend
    pub fn is_synced(&self, id: String) -> Result<bool, MousyCoreError> {
        Ok(self.local_store()?.is_synced(&id)?)
    }

    /// Whether the experiment should show a pending badge
    pub fn needs_sync(&self, id: String) -> Result<bool, MousyCoreError> {
        Ok(self.local_store()?.needs_sync(&id)?)
    }

    /// Drain both queues now
    pub fn sync_now(&self) -> Result<SyncResultData, MousyCoreError> {
        let service = self.service()?;
        let summary = self.runtime.block_on(service.manual_sync())?;

        Ok(SyncResultData {
            online: summary.online,
            records_synced: summary.records.success as u32,
            records_failed: summary.records.failed as u32,
            uploads_done: summary.uploads.success as u32,
            uploads_failed: summary.uploads.failed as u32,
        })
    }

    pub fn start_auto_sync(&self) -> Result<bool, MousyCoreError> {
        let service = self.service()?;
        let _guard = self.runtime.enter();
        Ok(service.start_auto_sync()?)
    }

    pub fn stop_auto_sync(&self) -> bool {
        self.service()
            .map(|service| service.stop_auto_sync())
            .unwrap_or(false)
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.service()
            .map(|service| service.is_auto_sync_running())
            .unwrap_or(false)
    }

    /// Upload a photo, falling back to the local path when offline
    pub fn upload_image(
        &self,
        experiment_id: String,
        local_path: String,
    ) -> Result<AttachedFileData, MousyCoreError> {
        let service = self.service()?;
        let attached = self
            .runtime
            .block_on(service.upload_image(&experiment_id, &local_path))?;
        Ok(attached.into())
    }

    /// Upload a document, falling back to the local path when offline
    pub fn upload_file(
        &self,
        experiment_id: String,
        local_path: String,
        file_name: String,
        mime_type: Option<String>,
    ) -> Result<AttachedFileData, MousyCoreError> {
        let service = self.service()?;
        let attached = self.runtime.block_on(service.upload_file(
            &experiment_id,
            &local_path,
            &file_name,
            mime_type.as_deref(),
        ))?;
        Ok(attached.into())
    }

    /// Delete an experiment remotely and locally
    pub fn delete_experiment(&self, id: String) -> Result<(), MousyCoreError> {
        let service = self.service()?;
        self.runtime.block_on(service.delete(&id))?;
        Ok(())
    }

    /// Count queued work. Works without a configured backend.
    pub fn pending_counts(&self) -> Result<PendingCounts, MousyCoreError> {
        let options = self.options()?;
        let sync_items = SyncQueue::new(self.db.clone(), &options.namespace).len()?;
        let uploads = UploadQueue::new(self.db.clone(), &options.namespace).len()?;
        let unsynced = LocalStore::new(self.db.clone(), options.decode_mode).unsynced_ids()?;

        Ok(PendingCounts {
            sync_items: sync_items as u32,
            uploads: uploads as u32,
            unsynced_records: unsynced.len() as u32,
        })
    }
}

impl Drop for LabClient {
    fn drop(&mut self) {
        if let Ok(slot) = self.service.read() {
            if let Some(service) = slot.as_ref() {
                service.stop_auto_sync();
            }
        }
    }
}
