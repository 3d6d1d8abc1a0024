//! Abstract remote service used by the sync core.
//!
//! The backend (relational store plus object storage) is an external
//! collaborator. The core only needs five operations from it, expressed as the
//! [`RemoteService`] trait. [`crate::rest_remote::RestRemote`] is the HTTP
//! implementation; tests use an in-memory double.

use std::fmt;

use crate::models::ExperimentRecord;

/// Errors that can occur while talking to the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Client configuration is missing or invalid
    Config(String),
    /// Transport-level failure (DNS, connect, timeout, TLS)
    Network(String),
    /// The server answered with a non-success status
    Status { status: u16, body: String },
    /// The response body could not be decoded
    Decode(String),
    /// No session or the session was rejected
    Auth(String),
    /// The requested record or object does not exist
    NotFound(String),
}

impl std::error::Error for RemoteError {}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RemoteError::Network(msg) => write!(f, "Network error: {}", msg),
            RemoteError::Status { status, body } => {
                write!(f, "Request failed with status {}: {}", status, body)
            }
            RemoteError::Decode(msg) => write!(f, "Failed to decode response: {}", msg),
            RemoteError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            RemoteError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

/// Trait for the remote backend.
///
/// Every method is a single suspension point. Implementations must be cheap
/// to share behind an `Arc` because the probe, the uploader, the reconciler
/// and the save orchestrator all hold the same instance.
pub trait RemoteService: Send + Sync + 'static {
    /// Insert or update one experiment record in `table`.
    fn upsert_record(
        &self,
        table: &str,
        record: &ExperimentRecord,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Fetch one record by id. `Ok(None)` when it does not exist.
    fn fetch_record(
        &self,
        table: &str,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ExperimentRecord>, RemoteError>> + Send;

    /// Delete one record by id. Deleting a missing record is not an error.
    fn delete_record(
        &self,
        table: &str,
        id: &str,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Upload a binary object and return a stable reference to it (URL or
    /// storage path).
    fn upload_binary(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl std::future::Future<Output = Result<String, RemoteError>> + Send;

    /// Cheap existence check used as a connectivity heuristic.
    fn probe(&self) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;
}

/// Build the object-storage path for an attachment.
///
/// Format: `{owner_id}/{experiment_id}/{file_name}`
pub fn storage_path(owner_id: &str, experiment_id: &str, file_name: &str) -> String {
    format!("{}/{}/{}", owner_id, experiment_id, file_name)
}
