use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tutor_core::model::{ActiveSessionRecord, UserId};

use crate::memory::{InMemoryKeyValueStore, InMemoryRegistry};
use crate::watch::RegistryWatch;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage unavailable")]
    Unavailable,
}

/// Durable string key-value storage private to one client context.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be read.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::QuotaExceeded` when the store is full, or other storage errors.
    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a value. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be written.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be read.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Remote registry holding at most one active-session record per user.
///
/// Writes are never conditional: `put_record` overwrites, `touch_activity` merges a
/// single field. Every change is pushed to the user's watchers.
#[async_trait]
pub trait SessionRegistryStore: Send + Sync {
    /// Overwrite the user's record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write cannot be applied.
    async fn put_record(&self, record: &ActiveSessionRecord) -> Result<(), StorageError>;

    /// Merge `last_activity` into the user's existing record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no record exists, or other storage errors.
    async fn touch_activity(&self, user_id: &UserId, at: DateTime<Utc>)
    -> Result<(), StorageError>;

    /// Delete the user's record. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the delete cannot be applied.
    async fn delete_record(&self, user_id: &UserId) -> Result<(), StorageError>;

    /// Fetch the user's record, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the read fails.
    async fn get_record(&self, user_id: &UserId)
    -> Result<Option<ActiveSessionRecord>, StorageError>;

    /// Subscribe to the user's record. The current state is delivered first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the initial read fails.
    async fn watch(&self, user_id: &UserId) -> Result<RegistryWatch, StorageError>;
}

/// Storage handles used by the services layer.
///
/// `local` is the durable mirror store, `ephemeral` is scoped to one client
/// context (it holds the session token), `registry` is shared between devices.
#[derive(Clone)]
pub struct Storage {
    pub local: Arc<dyn KeyValueStore>,
    pub ephemeral: Arc<dyn KeyValueStore>,
    pub registry: Arc<dyn SessionRegistryStore>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_registry(Arc::new(InMemoryRegistry::new()))
    }

    /// Fresh in-memory local stores attached to an existing (possibly shared) registry.
    #[must_use]
    pub fn with_registry(registry: Arc<dyn SessionRegistryStore>) -> Self {
        Self {
            local: Arc::new(InMemoryKeyValueStore::new()),
            ephemeral: Arc::new(InMemoryKeyValueStore::new()),
            registry,
        }
    }
}
