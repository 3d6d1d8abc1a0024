//! MousyCore - offline-first save and sync core of the Mousy lab notebook.
//!
//! This library provides:
//! - Data models (ExperimentRecord, AttachedFile, queue items)
//! - Local persistence (SQLite key-value store)
//! - Durable sync and upload queues
//! - Queue reconciliation and the background drain loop
//! - The save orchestrator and an HTTP backend adapter
//! - Configuration management
//!
//! The remote backend is reached only through the [`remote::RemoteService`]
//! trait, so the sync core can run against any store.
//!
//! # Feature Flags
//!
//! - `desktop`: Include desktop-specific features (config dir detection).
//! - `uniffi`: Generate UniFFI bindings for mobile platforms (Android, iOS).

pub mod attachments;
pub mod config;
pub mod database;
pub mod error;
pub mod local_store;
pub mod models;
pub mod probe;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod rest_remote;
pub mod scheduler;
pub mod sync_service;
pub mod validation;

#[cfg(test)]
pub(crate) mod testing;

// Mobile bindings module
#[cfg(feature = "uniffi")]
pub mod android;

// UniFFI scaffolding (must be at crate root)
#[cfg(feature = "uniffi")]
uniffi::setup_scaffolding!();

// Re-export commonly used types
pub use config::{Config, SyncOptions};
pub use database::Database;
pub use error::{MousyError, MousyResult};
pub use local_store::{DecodeMode, LocalStore};
pub use models::{AttachedFile, DrainCounts, ExperimentRecord, StoredRecord, SyncQueueItem, UploadQueueItem};
pub use reconcile::{Backoff, ReconcileSummary, Reconciler, RetryPolicy};
pub use remote::{RemoteError, RemoteService};
pub use rest_remote::RestRemote;
pub use scheduler::AutoSync;
pub use sync_service::{SaveOutcome, SyncService};

// Re-export mobile types when uniffi feature is enabled
#[cfg(feature = "uniffi")]
pub use android::{LabClient, MousyCoreError, RemoteSettings, SaveResultData, SyncResultData};
