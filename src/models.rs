//! Data models for Mousy.
//!
//! This module defines the experiment record handled by the save pipeline,
//! its attachments, and the items stored in the two persisted queues.
//! JSON field names are camelCase so stored values stay readable by the
//! mobile client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Experiment stage inside a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentStage {
    Characterization,
    InVitro,
    InVivo,
}

impl ExperimentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStage::Characterization => "characterization",
            ExperimentStage::InVitro => "in-vitro",
            ExperimentStage::InVivo => "in-vivo",
        }
    }
}

/// Progress of an experiment. Failed runs are tracked too.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperimentStatus {
    #[default]
    Planning,
    InProgress,
    Completed,
    Failed,
}

/// A file attached to an experiment.
///
/// `url` is either a remote reference or, while the upload is still queued,
/// the original local path (`is_local == true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedFile {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub is_local: bool,
}

/// Kind of an external link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Code,
    Document,
    Data,
    Other,
}

/// A link to an external resource (notebook, repository, dataset).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<LinkKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One experiment's full data snapshot as handled by the save pipeline.
///
/// Stage-specific metadata blocks are kept as opaque JSON; the core never
/// interprets them. Fields this crate does not know about (legacy in-vivo
/// columns and the like) are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentRecord {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
    pub stage: ExperimentStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_method: Option<String>,
    #[serde(default)]
    pub status: ExperimentStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub files: Vec<AttachedFile>,
    #[serde(default)]
    pub links: Vec<ExternalLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_vivo_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_vitro_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characterization_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExperimentRecord {
    /// Create a new record with a fresh UUID7 id
    pub fn new(project_id: impl Into<String>, title: impl Into<String>, stage: ExperimentStage) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            project_id: project_id.into(),
            title: title.into(),
            date: now,
            notes: String::new(),
            stage,
            method: None,
            other_method: None,
            status: ExperimentStatus::default(),
            tags: Vec::new(),
            images: Vec::new(),
            files: Vec::new(),
            links: Vec::new(),
            protocol: None,
            sample_id: None,
            experiment_type: None,
            start_time: None,
            end_time: None,
            in_vivo_metadata: None,
            in_vitro_metadata: None,
            characterization_metadata: None,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    /// Same record with a caller-chosen id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// True if any image or file still points at a local path.
    pub fn has_local_attachments(&self) -> bool {
        self.files.iter().any(|f| f.is_local)
            || self
                .images
                .iter()
                .any(|url| !url.starts_with("http://") && !url.starts_with("https://"))
    }

    /// Replace a local attachment reference with its uploaded location.
    ///
    /// Images are matched by URL, files by queue id or URL. Returns whether
    /// anything changed.
    pub fn resolve_attachment(&mut self, upload_id: &str, local_path: &str, remote_url: &str) -> bool {
        let mut changed = false;

        for image in self.images.iter_mut() {
            if image == local_path {
                *image = remote_url.to_string();
                changed = true;
            }
        }

        for file in self.files.iter_mut() {
            if file.is_local && (file.id == upload_id || file.url == local_path) {
                file.url = remote_url.to_string();
                file.is_local = false;
                changed = true;
            }
        }

        changed
    }
}

/// A record as stored in the local shadow, with its sync marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    #[serde(flatten)]
    pub record: ExperimentRecord,
    pub synced: bool,
    pub saved_at: DateTime<Utc>,
}

/// A pending remote write for one record.
///
/// `id` mirrors the record id and is the dedup key of the sync queue.
/// Aliases accept queue entries written by the original mobile client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    #[serde(alias = "experiment")]
    pub record: ExperimentRecord,
    #[serde(alias = "createdAt")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl SyncQueueItem {
    /// Fresh queue entry for a record snapshot
    pub fn new(record: ExperimentRecord) -> Self {
        Self {
            id: record.id.clone(),
            record,
            enqueued_at: Utc::now(),
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Same snapshot after one more failed attempt
    pub fn retried(&self, attempted_at: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_attempt_at: Some(attempted_at),
            ..self.clone()
        }
    }
}

/// Kind of binary attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Image,
    File,
}

impl UploadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadKind::Image => "image",
            UploadKind::File => "file",
        }
    }
}

fn default_mime_type() -> String {
    "application/octet-stream".to_string()
}

/// A pending binary upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadQueueItem {
    pub id: String,
    pub experiment_id: String,
    #[serde(alias = "type")]
    pub kind: UploadKind,
    #[serde(alias = "localUri")]
    pub local_path: String,
    #[serde(alias = "fileName")]
    pub display_name: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(alias = "createdAt")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl UploadQueueItem {
    /// The attachment handed back to the caller while this upload is pending
    pub fn to_local_attachment(&self) -> AttachedFile {
        AttachedFile {
            id: self.id.clone(),
            name: self.display_name.clone(),
            url: self.local_path.clone(),
            size: self.size,
            mime_type: Some(self.mime_type.clone()),
            uploaded_at: self.enqueued_at,
            is_local: true,
        }
    }
}

/// Aggregate result of one drain pass over a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainCounts {
    pub success: usize,
    pub failed: usize,
    /// Items skipped because their backoff window had not elapsed
    #[serde(default)]
    pub deferred: usize,
}

impl DrainCounts {
    pub fn is_empty(&self) -> bool {
        self.success == 0 && self.failed == 0 && self.deferred == 0
    }
}
