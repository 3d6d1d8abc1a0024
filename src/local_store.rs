//! Local record store.
//!
//! Each experiment is kept as one JSON document under `experiment_<id>` with
//! a `synced` flag and a `savedAt` timestamp. Saving locally always succeeds
//! or fails hard; the remote side is never consulted here.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::database::{lock_database, Database};
use crate::error::{MousyError, MousyResult};
use crate::models::{ExperimentRecord, StoredRecord};

const RECORD_KEY_PREFIX: &str = "experiment_";

/// Timestamp fields every stored record must carry.
const REQUIRED_TIMESTAMPS: [&str; 4] = ["date", "createdAt", "updatedAt", "savedAt"];
const OPTIONAL_TIMESTAMPS: [&str; 2] = ["startTime", "endTime"];

/// How invalid stored timestamps are handled on load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMode {
    /// Substitute "now" for missing or invalid required timestamps and drop
    /// invalid optional ones. Every substitution is logged.
    #[default]
    Lenient,
    /// Any missing or invalid timestamp is a decode error.
    Strict,
}

/// Build the storage key for a record id
pub fn record_key(id: &str) -> String {
    format!("{}{}", RECORD_KEY_PREFIX, id)
}

/// Local shadow of every experiment record.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    decode_mode: DecodeMode,
}

impl LocalStore {
    pub fn new(db: Arc<Mutex<Database>>, decode_mode: DecodeMode) -> Self {
        Self { db, decode_mode }
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    /// Persist `record` with `synced = false`.
    ///
    /// Returns the `savedAt` stamp written alongside it.
    pub fn save_locally(&self, record: &ExperimentRecord) -> MousyResult<DateTime<Utc>> {
        let saved_at = Utc::now();
        let stored = StoredRecord {
            record: record.clone(),
            synced: false,
            saved_at,
        };

        let db = lock_database(&self.db)?;
        db.set_json(&record_key(&record.id), &stored)?;

        tracing::debug!(record_id = %record.id, "Saved record locally");
        Ok(saved_at)
    }

    /// Load a record from the local shadow.
    pub fn load_locally(&self, id: &str) -> MousyResult<Option<StoredRecord>> {
        let key = record_key(id);
        let raw = {
            let db = lock_database(&self.db)?;
            db.get_value(&key)?
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| MousyError::decode(&key, e.to_string()))?;
        normalize_timestamps(&key, &mut value, self.decode_mode)?;

        let stored = serde_json::from_value(value)
            .map_err(|e| MousyError::decode(&key, e.to_string()))?;
        Ok(Some(stored))
    }

    /// Flip the stored flag to synced. No-op when the record is absent.
    pub fn mark_synced(&self, id: &str) -> MousyResult<()> {
        self.update_synced_flag(id, None)
    }

    /// Flip the stored flag to synced only if the local copy was saved at or
    /// before `as_of`. A newer local save stays unsynced.
    pub fn mark_synced_as_of(&self, id: &str, as_of: DateTime<Utc>) -> MousyResult<()> {
        self.update_synced_flag(id, Some(as_of))
    }

    fn update_synced_flag(&self, id: &str, as_of: Option<DateTime<Utc>>) -> MousyResult<()> {
        let key = record_key(id);
        let db = lock_database(&self.db)?;

        let Some(raw) = db.get_value(&key)? else {
            return Ok(());
        };
        let mut value: Value =
            serde_json::from_str(&raw).map_err(|e| MousyError::decode(&key, e.to_string()))?;

        if let Some(as_of) = as_of {
            let saved_at = value.get("savedAt").and_then(parse_timestamp);
            if matches!(saved_at, Some(saved_at) if saved_at > as_of) {
                tracing::debug!(
                    record_id = %id,
                    "Local copy is newer than the synced snapshot, leaving it unsynced"
                );
                return Ok(());
            }
        }

        let Some(object) = value.as_object_mut() else {
            return Err(MousyError::decode(&key, "stored record is not an object"));
        };
        object.insert("synced".to_string(), Value::Bool(true));
        db.set_json(&key, &value)?;

        tracing::debug!(record_id = %id, "Marked record synced");
        Ok(())
    }

    /// Whether the record is synced. Records with no local shadow count as
    /// synced, as do legacy shadows without a flag.
    pub fn is_synced(&self, id: &str) -> MousyResult<bool> {
        let key = record_key(id);
        let db = lock_database(&self.db)?;

        let Some(raw) = db.get_value(&key)? else {
            return Ok(true);
        };
        let value: Value =
            serde_json::from_str(&raw).map_err(|e| MousyError::decode(&key, e.to_string()))?;

        Ok(value.get("synced") != Some(&Value::Bool(false)))
    }

    /// Remove the local shadow. Returns whether one existed.
    pub fn remove_locally(&self, id: &str) -> MousyResult<bool> {
        let db = lock_database(&self.db)?;
        db.delete_value(&record_key(id))
    }

    /// True when the local copy has not reached the backend yet, or still
    /// points at attachments that only exist on this device.
    ///
    /// An unknown id needs nothing.
    pub fn needs_sync(&self, id: &str) -> MousyResult<bool> {
        Ok(match self.load_locally(id)? {
            Some(stored) => !stored.synced || stored.record.has_local_attachments(),
            None => false,
        })
    }

    /// Ids of every local record whose flag is explicitly unsynced
    pub fn unsynced_ids(&self) -> MousyResult<Vec<String>> {
        let db = lock_database(&self.db)?;
        let mut ids = Vec::new();

        for key in db.keys_with_prefix(RECORD_KEY_PREFIX)? {
            let Some(raw) = db.get_value(&key)? else {
                continue;
            };
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) if value.get("synced") == Some(&Value::Bool(false)) => {
                    ids.push(key[RECORD_KEY_PREFIX.len()..].to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable local record");
                }
            }
        }

        Ok(ids)
    }
}

/// Accept RFC 3339 strings and epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => s.parse::<DateTime<Utc>>().ok(),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

fn normalize_timestamps(key: &str, value: &mut Value, mode: DecodeMode) -> MousyResult<()> {
    let Some(object) = value.as_object_mut() else {
        return Err(MousyError::decode(key, "stored record is not an object"));
    };

    // Shadows written before the flag existed are treated as synced
    object
        .entry("synced".to_string())
        .or_insert(Value::Bool(true));

    for field in REQUIRED_TIMESTAMPS {
        match object.get(field).map(parse_timestamp) {
            Some(Some(parsed)) => {
                object.insert(field.to_string(), Value::String(parsed.to_rfc3339()));
            }
            invalid => {
                if mode == DecodeMode::Strict {
                    let reason = if invalid.is_none() { "missing" } else { "invalid" };
                    return Err(MousyError::decode(key, format!("{} is {}", field, reason)));
                }
                tracing::warn!(key = %key, field = field, "Replacing unusable timestamp with now");
                object.insert(field.to_string(), Value::String(Utc::now().to_rfc3339()));
            }
        }
    }

    for field in OPTIONAL_TIMESTAMPS {
        match object.get(field).map(|v| (v.is_null(), parse_timestamp(v))) {
            None | Some((true, _)) => {}
            Some((false, Some(parsed))) => {
                object.insert(field.to_string(), Value::String(parsed.to_rfc3339()));
            }
            Some((false, None)) => {
                if mode == DecodeMode::Strict {
                    return Err(MousyError::decode(key, format!("{} is invalid", field)));
                }
                tracing::warn!(key = %key, field = field, "Dropping invalid optional timestamp");
                object.remove(field);
            }
        }
    }

    Ok(())
}
