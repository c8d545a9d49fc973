use std::sync::Arc;

use storage::repository::Storage;

use crate::activity::{ActivityPersistence, ActivityTracker};
use crate::config::{PersistenceConfig, SessionConfig};
use crate::error::AppServicesError;
use crate::identity::SessionIdentity;
use crate::lifecycle::SessionLifecycle;
use crate::registry::ActiveSessionService;
use crate::Clock;

/// Assembles app-facing services over one storage bundle.
#[derive(Clone)]
pub struct AppServices {
    sessions: ActiveSessionService,
    persistence: Arc<ActivityPersistence>,
}

impl AppServices {
    #[must_use]
    pub fn new(
        storage: &Storage,
        clock: Clock,
        session_config: SessionConfig,
        persistence_config: PersistenceConfig,
    ) -> Self {
        let identity = SessionIdentity::new(Arc::clone(&storage.ephemeral), clock.clone());
        let sessions = ActiveSessionService::new(
            Arc::clone(&storage.registry),
            identity,
            clock.clone(),
            session_config,
        );
        let persistence = Arc::new(ActivityPersistence::new(
            Arc::clone(&storage.local),
            clock,
            persistence_config,
        ));
        Self {
            sessions,
            persistence,
        }
    }

    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        session_config: SessionConfig,
        persistence_config: PersistenceConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::new(&storage, clock, session_config, persistence_config))
    }

    #[must_use]
    pub fn sessions(&self) -> &ActiveSessionService {
        &self.sessions
    }

    #[must_use]
    pub fn persistence(&self) -> Arc<ActivityPersistence> {
        Arc::clone(&self.persistence)
    }

    /// A fresh lifecycle for one client context.
    #[must_use]
    pub fn lifecycle(&self) -> SessionLifecycle {
        SessionLifecycle::new(self.sessions.clone())
    }

    /// A fresh tracker for one exercise view.
    #[must_use]
    pub fn tracker(&self) -> ActivityTracker {
        ActivityTracker::new(Arc::clone(&self.persistence))
    }
}
