//! Shared error types for the services crate.
//!
//! Most session and persistence operations never return these: failures the
//! application is expected to ride out are logged and reported as `false` or
//! `None`. These enums cover the few places a caller must branch.

use thiserror::Error;

use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;
use tutor_core::model::SessionPhaseError;

/// Errors emitted by `SessionLifecycle`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    #[error("session registry is unavailable")]
    RegistryUnavailable,
    #[error(transparent)]
    Phase(#[from] SessionPhaseError),
}

/// Internal failures of activity persistence, logged at the public boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum PersistenceError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}
