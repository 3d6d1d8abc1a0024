//! HTTP adapter for a PostgREST + object-storage backend.
//!
//! Records are written to `/rest/v1/<table>` as snake_case rows stamped with
//! the owning user. Attachments go to `/storage/v1/object/<bucket>/<path>`.
//! Every request carries the `apikey` header and a bearer token (the session
//! access token when signed in, the API key otherwise).

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::models::{
    AttachedFile, ExperimentRecord, ExperimentStage, ExperimentStatus, ExternalLink,
};
use crate::remote::{RemoteError, RemoteService};

/// Record fields without a typed slot that map to their own columns.
/// (record field, column)
const LEGACY_COLUMNS: [(&str, &str); 6] = [
    ("fileLinks", "file_links"),
    ("mouseVendor", "mouse_vendor"),
    ("strain", "strain"),
    ("ageWeeks", "age_weeks"),
    ("diet", "diet"),
    ("runNumber", "run_number"),
];

/// One row of the experiments table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRow {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub protocol: Option<String>,
    pub stage: ExperimentStage,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status: Option<ExperimentStatus>,
    #[serde(default)]
    pub sample_id: Option<String>,
    #[serde(default)]
    pub experiment_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Option<Vec<AttachedFile>>,
    #[serde(default)]
    pub links: Option<Vec<ExternalLink>>,
    #[serde(default)]
    pub in_vivo_metadata: Option<Value>,
    #[serde(default)]
    pub in_vitro_metadata: Option<Value>,
    #[serde(default)]
    pub characterization_metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Legacy columns and anything else the server returns
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

impl ExperimentRow {
    /// Row for an upsert, stamped with `user_id` and `updated_at`.
    pub fn from_record(record: &ExperimentRecord, user_id: &str, updated_at: DateTime<Utc>) -> Self {
        let mut columns = Map::new();
        for (field, column) in LEGACY_COLUMNS {
            let value = match record.extra.get(field) {
                Some(value) => value.clone(),
                None if column == "file_links" => Value::Array(Vec::new()),
                None => Value::Null,
            };
            columns.insert(column.to_string(), value);
        }

        Self {
            id: record.id.clone(),
            project_id: record.project_id.clone(),
            title: record.title.clone(),
            date: record.date,
            notes: Some(record.notes.clone()),
            images: Some(record.images.clone()),
            tags: Some(record.tags.clone()),
            protocol: record.protocol.clone(),
            stage: record.stage,
            method: record.method.clone(),
            status: Some(record.status),
            sample_id: record.sample_id.clone(),
            experiment_type: record.experiment_type.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            files: Some(record.files.clone()),
            links: Some(record.links.clone()),
            in_vivo_metadata: record.in_vivo_metadata.clone(),
            in_vitro_metadata: record.in_vitro_metadata.clone(),
            characterization_metadata: record.characterization_metadata.clone(),
            created_at: record.created_at,
            updated_at,
            user_id: Some(user_id.to_string()),
            columns,
        }
    }

    /// Convert a fetched row back into a record
    pub fn into_record(self) -> ExperimentRecord {
        let mut extra = Map::new();
        for (field, column) in LEGACY_COLUMNS {
            match self.columns.get(column) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    extra.insert(field.to_string(), value.clone());
                }
            }
        }

        ExperimentRecord {
            id: self.id,
            project_id: self.project_id,
            title: self.title,
            date: self.date,
            notes: self.notes.unwrap_or_default(),
            stage: self.stage,
            method: self.method,
            other_method: None,
            status: self.status.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            images: self.images.unwrap_or_default(),
            files: self.files.unwrap_or_default(),
            links: self.links.unwrap_or_default(),
            protocol: self.protocol,
            sample_id: self.sample_id,
            experiment_type: self.experiment_type,
            start_time: self.start_time,
            end_time: self.end_time,
            in_vivo_metadata: self.in_vivo_metadata,
            in_vitro_metadata: self.in_vitro_metadata,
            characterization_metadata: self.characterization_metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
            extra,
        }
    }
}

/// Connection settings for [`RestRemote`]
#[derive(Debug, Clone)]
pub struct RestRemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub probe_table: String,
    pub public_buckets: Vec<String>,
    pub request_timeout: Duration,
}

impl RestRemoteConfig {
    pub fn from_config(config: &Config) -> Self {
        let remote = config.remote();
        Self {
            base_url: remote.base_url.clone(),
            api_key: remote.api_key.clone(),
            access_token: remote.access_token.clone(),
            user_id: config.user_id().map(String::from),
            probe_table: remote.probe_table.clone(),
            public_buckets: remote.public_buckets.clone(),
            request_timeout: Duration::from_secs(remote.request_timeout_secs),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Session {
    access_token: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

pub struct RestRemote {
    client: Client,
    base_url: String,
    api_key: String,
    probe_table: String,
    public_buckets: Vec<String>,
    session: RwLock<Session>,
}

impl RestRemote {
    pub fn new(config: RestRemoteConfig) -> Result<Self, RemoteError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RemoteError::Config("base_url is not set".to_string()));
        }
        if config.api_key.is_empty() {
            return Err(RemoteError::Config("api_key is not set".to_string()));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            probe_table: config.probe_table,
            public_buckets: config.public_buckets,
            session: RwLock::new(Session {
                access_token: config.access_token,
                user_id: config.user_id,
            }),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace the signed-in session (None clears it)
    pub fn set_session(&self, access_token: Option<String>, user_id: Option<String>) {
        if let Ok(mut session) = self.session.write() {
            session.access_token = access_token;
            session.user_id = user_id;
        }
    }

    fn session(&self) -> Session {
        self.session
            .read()
            .map(|session| session.clone())
            .unwrap_or_default()
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let token = self
            .session()
            .access_token
            .unwrap_or_else(|| self.api_key.clone());
        request.header("apikey", &self.api_key).bearer_auth(token)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, urlencoding::encode(table))
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(path)
        )
    }

    /// Public URL of an object in a public bucket
    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(path)
        )
    }

    pub fn is_public_bucket(&self, bucket: &str) -> bool {
        self.public_buckets.iter().any(|b| b == bucket)
    }

    /// Time-limited URL for an object in a private bucket.
    pub async fn create_signed_url(
        &self,
        bucket: &str,
        path: &str,
        expires_in: Duration,
    ) -> Result<String, RemoteError> {
        let url = format!(
            "{}/storage/v1/object/sign/{}/{}",
            self.base_url,
            urlencoding::encode(bucket),
            encode_path(path)
        );
        let response = self
            .authorized(self.client.post(url))
            .json(&serde_json::json!({ "expiresIn": expires_in.as_secs() }))
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let signed: SignedUrlResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("Failed to parse signed URL: {}", e)))?;

        Ok(format!("{}/storage/v1{}", self.base_url, signed.signed_url))
    }
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Auth(body),
        StatusCode::NOT_FOUND => RemoteError::NotFound(body),
        _ => RemoteError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

impl RemoteService for RestRemote {
    async fn upsert_record(&self, table: &str, record: &ExperimentRecord) -> Result<(), RemoteError> {
        let user_id = self
            .session()
            .user_id
            .ok_or_else(|| RemoteError::Auth("sign-in required to save records".to_string()))?;
        let row = ExperimentRow::from_record(record, &user_id, Utc::now());

        let response = self
            .authorized(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        check_status(response).await?;

        tracing::debug!(record_id = %record.id, table = %table, "Upserted record");
        Ok(())
    }

    async fn fetch_record(&self, table: &str, id: &str) -> Result<Option<ExperimentRecord>, RemoteError> {
        let response = self
            .authorized(self.client.get(self.table_url(table)))
            .query(&[("id", format!("eq.{}", id)), ("select", "*".to_string())])
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let rows: Vec<ExperimentRow> = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| RemoteError::Decode(format!("Failed to parse rows: {}", e)))?;

        Ok(rows.into_iter().next().map(ExperimentRow::into_record))
    }

    async fn delete_record(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let response = self
            .authorized(self.client.delete(self.table_url(table)))
            .query(&[("id", format!("eq.{}", id))])
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }

    async fn upload_binary(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, RemoteError> {
        let size = bytes.len();
        let response = self
            .authorized(self.client.post(self.object_url(bucket, path)))
            .header("Content-Type", content_type)
            // retries of a queued upload reuse the same path
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            check_status(response).await?;
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body: String::new(),
            });
        }

        tracing::debug!(bucket = %bucket, path = %path, size = size, "Uploaded object");
        if self.is_public_bucket(bucket) {
            Ok(self.public_url(bucket, path))
        } else {
            Ok(path.to_string())
        }
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let response = self
            .authorized(self.client.get(self.table_url(&self.probe_table)))
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }
}
