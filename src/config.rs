//! Configuration management for Mousy.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory can be customized.
//!
//! Sections:
//! - account: the signed-in user, used as the owner prefix for uploads
//! - remote: backend endpoint, table and bucket names
//! - sync: drain loop interval, retry policy and decode strictness

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MousyError, MousyResult};
use crate::local_store::DecodeMode;
use crate::reconcile::{Backoff, RetryPolicy};

/// Account configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Id of the signed-in user (None = signed out)
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Remote backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Backend base URL, e.g. "https://xyz.supabase.co"
    #[serde(default)]
    pub base_url: String,
    /// Public API key sent with every request
    #[serde(default)]
    pub api_key: String,
    /// Session access token (falls back to the API key when absent)
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_records_table")]
    pub records_table: String,
    /// Table read by the connectivity probe
    #[serde(default = "default_probe_table")]
    pub probe_table: String,
    #[serde(default = "default_image_bucket")]
    pub image_bucket: String,
    #[serde(default = "default_file_bucket")]
    pub file_bucket: String,
    /// Buckets whose objects are addressed by public URL
    #[serde(default = "default_public_buckets")]
    pub public_buckets: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_records_table() -> String {
    "experiments".to_string()
}

fn default_probe_table() -> String {
    "projects".to_string()
}

fn default_image_bucket() -> String {
    "experiment-images".to_string()
}

fn default_file_bucket() -> String {
    "experiment-files".to_string()
}

fn default_public_buckets() -> Vec<String> {
    vec![default_image_bucket()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            records_table: default_records_table(),
            probe_table: default_probe_table(),
            image_bucket: default_image_bucket(),
            file_bucket: default_file_bucket(),
            public_buckets: default_public_buckets(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Backoff configuration ("none" or "exponential")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_mode")]
    pub mode: String,
    #[serde(default = "default_backoff_base_secs")]
    pub base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub max_secs: u64,
}

fn default_backoff_mode() -> String {
    "none".to_string()
}

fn default_backoff_base_secs() -> u64 {
    30
}

fn default_backoff_max_secs() -> u64 {
    3600
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mode: default_backoff_mode(),
            base_secs: default_backoff_base_secs(),
            max_secs: default_backoff_max_secs(),
        }
    }
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> MousyResult<Backoff> {
        match self.mode.as_str() {
            "none" => Ok(Backoff::None),
            "exponential" => Ok(Backoff::Exponential {
                base: Duration::from_secs(self.base_secs),
                max: Duration::from_secs(self.max_secs.max(self.base_secs)),
            }),
            other => Err(MousyError::Config(format!("Unknown backoff mode: {}", other))),
        }
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Start the background drain loop when the client opens
    #[serde(default = "default_true")]
    pub auto_sync_enabled: bool,
    #[serde(default = "default_auto_sync_interval_secs")]
    pub auto_sync_interval_secs: u64,
    /// Sync-queue attempts before an entry is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Upload-queue attempts before an entry is dropped (None = never)
    #[serde(default)]
    pub upload_max_retries: Option<u32>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Fail on invalid stored timestamps instead of substituting "now"
    #[serde(default)]
    pub strict_timestamps: bool,
    /// Write uploaded URLs back into the owning local record
    #[serde(default = "default_true")]
    pub splice_resolved_uploads: bool,
}

fn default_true() -> bool {
    true
}

fn default_auto_sync_interval_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            auto_sync_interval_secs: default_auto_sync_interval_secs(),
            max_retries: default_max_retries(),
            upload_max_retries: None,
            probe_timeout_ms: default_probe_timeout_ms(),
            backoff: BackoffConfig::default(),
            strict_timestamps: false,
            splice_resolved_uploads: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the database file
    #[serde(default)]
    pub database_file: String,
    /// Prefix of the queue storage keys
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_namespace() -> String {
    "@mousy".to_string()
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            namespace: default_namespace(),
            account: AccountConfig::default(),
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Runtime options for the sync core, derived from [`ConfigData`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub namespace: String,
    pub owner_id: Option<String>,
    pub records_table: String,
    pub image_bucket: String,
    pub file_bucket: String,
    pub auto_sync_interval: Duration,
    pub probe_timeout: Duration,
    pub record_retry: RetryPolicy,
    pub upload_retry: RetryPolicy,
    pub decode_mode: DecodeMode,
    pub splice_resolved_uploads: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        let remote = RemoteConfig::default();
        let sync = SyncConfig::default();
        Self {
            namespace: default_namespace(),
            owner_id: None,
            records_table: remote.records_table,
            image_bucket: remote.image_bucket,
            file_bucket: remote.file_bucket,
            auto_sync_interval: Duration::from_secs(sync.auto_sync_interval_secs),
            probe_timeout: Duration::from_millis(sync.probe_timeout_ms),
            record_retry: RetryPolicy::records(),
            upload_retry: RetryPolicy::uploads(),
            decode_mode: DecodeMode::Lenient,
            splice_resolved_uploads: sync.splice_resolved_uploads,
        }
    }
}

impl SyncOptions {
    /// Build options from a loaded configuration
    pub fn from_config(config: &Config) -> MousyResult<Self> {
        Self::from_data(&config.data)
    }

    fn from_data(data: &ConfigData) -> MousyResult<Self> {
        let backoff = data.sync.backoff.to_backoff()?;
        if data.sync.auto_sync_interval_secs == 0 {
            return Err(MousyError::Config(
                "auto_sync_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            namespace: data.namespace.clone(),
            owner_id: data.account.user_id.clone(),
            records_table: data.remote.records_table.clone(),
            image_bucket: data.remote.image_bucket.clone(),
            file_bucket: data.remote.file_bucket.clone(),
            auto_sync_interval: Duration::from_secs(data.sync.auto_sync_interval_secs),
            probe_timeout: Duration::from_millis(data.sync.probe_timeout_ms),
            record_retry: RetryPolicy {
                max_retries: Some(data.sync.max_retries),
                backoff,
            },
            upload_retry: RetryPolicy {
                max_retries: data.sync.upload_max_retries,
                backoff,
            },
            decode_mode: if data.sync.strict_timestamps {
                DecodeMode::Strict
            } else {
                DecodeMode::Lenient
            },
            splice_resolved_uploads: data.sync.splice_resolved_uploads,
        })
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Create a new configuration manager
    ///
    /// On mobile platforms (without the `desktop` feature), `config_dir` is required.
    pub fn new(config_dir: Option<PathBuf>) -> MousyResult<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir,
            None => {
                #[cfg(feature = "desktop")]
                {
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("mousy")
                }
                #[cfg(not(feature = "desktop"))]
                {
                    return Err(MousyError::Config(
                        "config_dir is required on mobile platforms".to_string(),
                    ));
                }
            }
        };

        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("mousy.db").to_string_lossy().to_string();
            default
        };

        let data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(
                            path = %config_file.display(),
                            error = %e,
                            "Config file is not valid JSON, using defaults"
                        );
                        default_data()
                    }
                },
                Err(_) => default_data(),
            }
        } else {
            default_data()
        };

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> MousyResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the raw configuration data
    pub fn data(&self) -> &ConfigData {
        &self.data
    }

    /// Get the database file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    /// Get the storage key namespace
    pub fn namespace(&self) -> &str {
        &self.data.namespace
    }

    /// Get the signed-in user id
    pub fn user_id(&self) -> Option<&str> {
        self.data.account.user_id.as_deref()
    }

    /// Set or clear the signed-in user id
    pub fn set_user_id(&mut self, user_id: Option<&str>) -> MousyResult<()> {
        self.data.account.user_id = user_id.map(String::from);
        self.save()
    }

    /// Get the remote backend configuration
    pub fn remote(&self) -> &RemoteConfig {
        &self.data.remote
    }

    /// Point the client at a backend
    pub fn set_remote_endpoint(
        &mut self,
        base_url: &str,
        api_key: &str,
        access_token: Option<&str>,
    ) -> MousyResult<()> {
        let base_url = base_url.trim().trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(MousyError::validation(
                "base_url",
                "must start with http:// or https://",
            ));
        }
        self.data.remote.base_url = base_url.to_string();
        self.data.remote.api_key = api_key.to_string();
        self.data.remote.access_token = access_token.map(String::from);
        self.save()
    }

    /// Check whether a backend endpoint is configured
    pub fn is_remote_configured(&self) -> bool {
        !self.data.remote.base_url.is_empty() && !self.data.remote.api_key.is_empty()
    }

    /// Get sync configuration
    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    /// Enable or disable the background drain loop
    pub fn set_auto_sync_enabled(&mut self, enabled: bool) -> MousyResult<()> {
        self.data.sync.auto_sync_enabled = enabled;
        self.save()
    }

    /// Set the drain loop interval
    pub fn set_auto_sync_interval_secs(&mut self, secs: u64) -> MousyResult<()> {
        if secs == 0 {
            return Err(MousyError::validation(
                "auto_sync_interval_secs",
                "must be greater than zero",
            ));
        }
        self.data.sync.auto_sync_interval_secs = secs;
        self.save()
    }

    /// Set the sync-queue retry cap
    pub fn set_max_retries(&mut self, max_retries: u32) -> MousyResult<()> {
        self.data.sync.max_retries = max_retries;
        self.save()
    }

    /// Switch between lenient and strict timestamp decoding
    pub fn set_strict_timestamps(&mut self, strict: bool) -> MousyResult<()> {
        self.data.sync.strict_timestamps = strict;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "namespace" => Some(self.data.namespace.clone()),
            "user_id" => self.data.account.user_id.clone(),
            "base_url" => Some(self.data.remote.base_url.clone()),
            "records_table" => Some(self.data.remote.records_table.clone()),
            "auto_sync_interval_secs" => Some(self.data.sync.auto_sync_interval_secs.to_string()),
            "max_retries" => Some(self.data.sync.max_retries.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> MousyResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "namespace" => self.data.namespace = value.to_string(),
            "user_id" => self.data.account.user_id = Some(value.to_string()),
            "records_table" => self.data.remote.records_table = value.to_string(),
            "auto_sync_interval_secs" => {
                let secs: u64 = value.parse().map_err(|_| {
                    MousyError::validation("auto_sync_interval_secs", "must be an integer")
                })?;
                return self.set_auto_sync_interval_secs(secs);
            }
            "max_retries" => {
                self.data.sync.max_retries = value
                    .parse()
                    .map_err(|_| MousyError::validation("max_retries", "must be an integer"))?;
            }
            _ => return Err(MousyError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}
