//! Input validation for Mousy.
//!
//! This module provides validation functions for values that end up in
//! storage keys, object-storage paths or remote rows.
//! All validators return MousyError::Validation on failure.

use crate::error::{MousyError, MousyResult};
use crate::models::ExperimentRecord;

pub const MAX_RECORD_ID_LENGTH: usize = 128;
pub const MAX_FILE_NAME_LENGTH: usize = 255;
pub const MAX_MIME_TYPE_LENGTH: usize = 255;

/// Validate an identifier used in a storage key (`experiment_<id>`) and in
/// object-storage paths.
///
/// Identifiers must be non-empty, at most MAX_RECORD_ID_LENGTH characters,
/// and must not contain whitespace, control characters or '/'.
pub fn validate_record_id(id: &str, field_name: &str) -> MousyResult<()> {
    if id.is_empty() {
        return Err(MousyError::validation(field_name, "cannot be empty"));
    }

    if id.chars().count() > MAX_RECORD_ID_LENGTH {
        return Err(MousyError::validation(
            field_name,
            format!(
                "cannot exceed {} characters (got {})",
                MAX_RECORD_ID_LENGTH,
                id.chars().count()
            ),
        ));
    }

    if let Some(bad) = id
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || *c == '/')
    {
        return Err(MousyError::validation(
            field_name,
            format!("contains invalid character {:?}", bad),
        ));
    }

    Ok(())
}

/// Validate the parts of a record the save pipeline depends on.
///
/// Only the ids are checked: they end up in storage keys and object paths.
/// Free-text fields are stored as given.
pub fn validate_record(record: &ExperimentRecord) -> MousyResult<()> {
    validate_record_id(&record.id, "id")?;
    validate_record_id(&record.project_id, "project_id")
}

/// Make a file name safe for object storage.
///
/// Every character outside `[A-Za-z0-9._-]` becomes '_'. Empty names become
/// "file". Long names are truncated from the front so the extension survives.
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        return "file".to_string();
    }

    if sanitized.len() > MAX_FILE_NAME_LENGTH {
        // ASCII only at this point, byte slicing is safe
        return sanitized[sanitized.len() - MAX_FILE_NAME_LENGTH..].to_string();
    }

    sanitized
}

/// Validate a MIME type string ("type/subtype").
pub fn validate_mime_type(mime_type: &str) -> MousyResult<()> {
    let trimmed = mime_type.trim();
    if trimmed.is_empty() {
        return Err(MousyError::validation("mime_type", "cannot be empty"));
    }

    if trimmed.len() > MAX_MIME_TYPE_LENGTH {
        return Err(MousyError::validation(
            "mime_type",
            format!("cannot exceed {} characters", MAX_MIME_TYPE_LENGTH),
        ));
    }

    match trimmed.split_once('/') {
        Some((kind, sub)) if !kind.is_empty() && !sub.is_empty() => Ok(()),
        _ => Err(MousyError::validation(
            "mime_type",
            format!("'{}' is not in type/subtype form", trimmed),
        )),
    }
}
