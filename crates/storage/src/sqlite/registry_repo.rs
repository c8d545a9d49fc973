use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use tutor_core::model::{ActiveSessionRecord, UserId};

use super::SqliteRepository;
use super::mapping::{map_record_row, metadata_to_json, read_err, write_err};
use crate::repository::{SessionRegistryStore, StorageError};
use crate::watch::RegistryWatch;

#[async_trait]
impl SessionRegistryStore for SqliteRepository {
    async fn put_record(&self, record: &ActiveSessionRecord) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO active_sessions (
                user_id, session_id, created_at, last_activity, browser, metadata
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                session_id = excluded.session_id,
                created_at = excluded.created_at,
                last_activity = excluded.last_activity,
                browser = excluded.browser,
                metadata = excluded.metadata
            ",
        )
        .bind(record.user_id.as_str())
        .bind(record.session_id.as_str())
        .bind(record.created_at)
        .bind(record.last_activity)
        .bind(record.browser())
        .bind(metadata_to_json(&record.metadata)?)
        .execute(&self.pool)
        .await
        .map_err(write_err)?;

        debug!(user_id = %record.user_id, session_id = %record.session_id, "registry record written");
        self.feed.publish(&record.user_id, Some(record.clone()));
        Ok(())
    }

    async fn touch_activity(
        &self,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let res = sqlx::query("UPDATE active_sessions SET last_activity = ?1 WHERE user_id = ?2")
            .bind(at)
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if res.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }

        let updated = self.get_record(user_id).await?;
        self.feed.publish(user_id, updated);
        Ok(())
    }

    async fn delete_record(&self, user_id: &UserId) -> Result<(), StorageError> {
        let res = sqlx::query("DELETE FROM active_sessions WHERE user_id = ?1")
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(write_err)?;

        if res.rows_affected() > 0 {
            self.feed.publish(user_id, None);
        }
        Ok(())
    }

    async fn get_record(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ActiveSessionRecord>, StorageError> {
        let row = sqlx::query(
            r"
            SELECT user_id, session_id, created_at, last_activity, browser, metadata
            FROM active_sessions
            WHERE user_id = ?1
            ",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(read_err)?;

        row.as_ref().map(map_record_row).transpose()
    }

    async fn watch(&self, user_id: &UserId) -> Result<RegistryWatch, StorageError> {
        let rx = self.feed.subscribe();
        let initial = self.get_record(user_id).await?;
        Ok(RegistryWatch::new(user_id.clone(), initial, rx))
    }
}
