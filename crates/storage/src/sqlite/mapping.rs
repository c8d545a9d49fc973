use chrono::{DateTime, Utc};
use sqlx::Row;
use tutor_core::model::{ActiveSessionRecord, ClientMetadata, SessionToken, UserId};

use crate::repository::StorageError;

/// `SQLITE_FULL`: database or disk is full.
const SQLITE_FULL: &str = "13";

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

/// Map a write failure, surfacing a full database as a quota error.
pub(crate) fn write_err(err: sqlx::Error) -> StorageError {
    let full = err
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SQLITE_FULL);
    if full {
        StorageError::QuotaExceeded
    } else {
        StorageError::Connection(err.to_string())
    }
}

pub(crate) fn read_err(err: sqlx::Error) -> StorageError {
    StorageError::Connection(err.to_string())
}

pub(crate) fn metadata_to_json(metadata: &ClientMetadata) -> Result<String, StorageError> {
    serde_json::to_string(&metadata.extra).map_err(ser)
}

pub(crate) fn map_record_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<ActiveSessionRecord, StorageError> {
    let user_id = UserId::new(row.try_get::<String, _>("user_id").map_err(ser)?).map_err(ser)?;
    let session_id = SessionToken::from_persisted(row.try_get::<String, _>("session_id").map_err(ser)?)
        .map_err(ser)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(ser)?;
    let last_activity: DateTime<Utc> = row.try_get("last_activity").map_err(ser)?;
    let browser: String = row.try_get("browser").map_err(ser)?;
    let extra_json: String = row.try_get("metadata").map_err(ser)?;
    let extra = serde_json::from_str(&extra_json).map_err(ser)?;

    Ok(ActiveSessionRecord {
        session_id,
        user_id,
        created_at,
        last_activity,
        metadata: ClientMetadata { browser, extra },
    })
}
