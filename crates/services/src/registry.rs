use std::sync::Arc;

use storage::repository::{SessionRegistryStore, StorageError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tutor_core::Clock;
use tutor_core::model::{ActiveSessionRecord, ClientMetadata, SessionToken, UserId};

use crate::config::SessionConfig;
use crate::heartbeat::HeartbeatHandle;
use crate::identity::SessionIdentity;

//
// ─── ACTIVE SESSION SERVICE ────────────────────────────────────────────────────
//

/// Enforces one active session per user through the shared registry.
///
/// Ownership is last-writer-wins: creating a session overwrites whatever
/// record exists, and the previous owner learns about it through its
/// conflict listener. Nothing here reads before writing.
#[derive(Clone)]
pub struct ActiveSessionService {
    registry: Arc<dyn SessionRegistryStore>,
    identity: SessionIdentity,
    clock: Clock,
    config: SessionConfig,
}

impl ActiveSessionService {
    #[must_use]
    pub fn new(
        registry: Arc<dyn SessionRegistryStore>,
        identity: SessionIdentity,
        clock: Clock,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            identity,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Claim the user's session for this context, evicting any other owner.
    ///
    /// Returns `None` (after logging) if the registry write fails.
    pub async fn create_active_session(
        &self,
        user_id: &UserId,
        metadata: ClientMetadata,
    ) -> Option<SessionToken> {
        let token = self.identity.current_or_create().await;
        let record =
            ActiveSessionRecord::new(user_id.clone(), token.clone(), metadata, self.clock.now());

        match self.registry.put_record(&record).await {
            Ok(()) => {
                info!(%user_id, session_id = %token, "active session created");
                Some(token)
            }
            Err(err) => {
                warn!(%user_id, error = %err, "failed to create active session");
                None
            }
        }
    }

    /// Refresh `last_activity` on the user's record.
    ///
    /// Only the timestamp is merged; owner token, creation time and metadata
    /// are left alone. Failures are logged and reported as `false`.
    pub async fn update_session_activity(&self, user_id: &UserId) -> bool {
        match self.registry.touch_activity(user_id, self.clock.now()).await {
            Ok(()) => {
                debug!(%user_id, "session activity refreshed");
                true
            }
            Err(StorageError::NotFound) => {
                debug!(%user_id, "no active session to refresh");
                false
            }
            Err(err) => {
                warn!(%user_id, error = %err, "failed to refresh session activity");
                false
            }
        }
    }

    /// Delete the user's record and forget this context's token. Idempotent.
    ///
    /// The local token is cleared even when the delete fails.
    pub async fn close_active_session(&self, user_id: &UserId) -> bool {
        let deleted = match self.registry.delete_record(user_id).await {
            Ok(()) => {
                info!(%user_id, "active session closed");
                true
            }
            Err(err) => {
                warn!(%user_id, error = %err, "failed to close active session");
                false
            }
        };
        self.identity.clear().await;
        deleted
    }

    /// Fetch the user's current registry record, if readable.
    pub async fn active_record(&self, user_id: &UserId) -> Option<ActiveSessionRecord> {
        match self.registry.get_record(user_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(%user_id, error = %err, "failed to read active session");
                None
            }
        }
    }

    /// Watch the user's record and call `on_conflict` for every delivered
    /// snapshot owned by another token.
    ///
    /// The local token is read from this context's cache. Callers that
    /// already hold the token they registered with should use
    /// [`ActiveSessionService::listen_as_owner`], which keeps working when
    /// the cache is unreadable.
    ///
    /// The subscription is live when this returns. Repeated snapshots with the
    /// same foreign owner call `on_conflict` again, so it must be idempotent.
    /// Deleted records never count as conflicts. If the registry cannot be
    /// watched the failure is logged and the returned subscription is inert.
    pub async fn listen_to_session_conflicts<F>(
        &self,
        user_id: &UserId,
        on_conflict: F,
    ) -> ConflictSubscription
    where
        F: FnMut(ActiveSessionRecord) + Send + 'static,
    {
        let local = self.identity.current().await;
        if local.is_none() {
            warn!(%user_id, "listening for conflicts without a local session token");
        }
        self.spawn_listener(user_id, local, on_conflict).await
    }

    /// Like [`ActiveSessionService::listen_to_session_conflicts`], comparing
    /// snapshots against `token` instead of the cached one.
    pub async fn listen_as_owner<F>(
        &self,
        user_id: &UserId,
        token: &SessionToken,
        on_conflict: F,
    ) -> ConflictSubscription
    where
        F: FnMut(ActiveSessionRecord) + Send + 'static,
    {
        self.spawn_listener(user_id, Some(token.clone()), on_conflict)
            .await
    }

    async fn spawn_listener<F>(
        &self,
        user_id: &UserId,
        local: Option<SessionToken>,
        mut on_conflict: F,
    ) -> ConflictSubscription
    where
        F: FnMut(ActiveSessionRecord) + Send + 'static,
    {
        let mut watch = match self.registry.watch(user_id).await {
            Ok(watch) => watch,
            Err(err) => {
                warn!(%user_id, error = %err, "failed to watch active session");
                return ConflictSubscription { task: None };
            }
        };

        let task = tokio::spawn(async move {
            while let Some(snapshot) = watch.next().await {
                let Some(record) = snapshot else {
                    debug!(user_id = %watch.user_id(), "active session record removed");
                    continue;
                };
                let owned = local.as_ref().is_some_and(|token| record.is_owned_by(token));
                if !owned {
                    info!(
                        user_id = %record.user_id,
                        owner = %record.session_id,
                        browser = record.browser(),
                        "session conflict detected"
                    );
                    on_conflict(record);
                }
            }
        });

        ConflictSubscription { task: Some(task) }
    }

    /// Refresh activity now and then every heartbeat interval until the
    /// returned handle is stopped or dropped.
    pub async fn start_session_heartbeat(&self, user_id: &UserId) -> HeartbeatHandle {
        self.update_session_activity(user_id).await;
        HeartbeatHandle::spawn(self.clone(), user_id.clone(), self.config.heartbeat_interval)
    }
}

//
// ─── CONFLICT SUBSCRIPTION ─────────────────────────────────────────────────────
//

/// Handle to a running conflict listener. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ConflictSubscription {
    task: Option<JoinHandle<()>>,
}

impl ConflictSubscription {
    /// Stop delivering conflicts. No callback runs after this returns
    /// unless one was already executing.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConflictSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use storage::memory::{InMemoryKeyValueStore, InMemoryRegistry};
    use storage::watch::RegistryWatch;
    use tutor_core::time::manual_clock;

    use super::*;

    /// Counts writes by kind and can refuse to open watches.
    #[derive(Default)]
    struct CountingRegistry {
        inner: InMemoryRegistry,
        puts: AtomicUsize,
        touches: AtomicUsize,
        refuse_watch: bool,
    }

    #[async_trait]
    impl SessionRegistryStore for CountingRegistry {
        async fn put_record(&self, record: &ActiveSessionRecord) -> Result<(), StorageError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put_record(record).await
        }

        async fn touch_activity(
            &self,
            user_id: &UserId,
            at: DateTime<Utc>,
        ) -> Result<(), StorageError> {
            self.touches.fetch_add(1, Ordering::SeqCst);
            self.inner.touch_activity(user_id, at).await
        }

        async fn delete_record(&self, user_id: &UserId) -> Result<(), StorageError> {
            self.inner.delete_record(user_id).await
        }

        async fn get_record(
            &self,
            user_id: &UserId,
        ) -> Result<Option<ActiveSessionRecord>, StorageError> {
            self.inner.get_record(user_id).await
        }

        async fn watch(&self, user_id: &UserId) -> Result<RegistryWatch, StorageError> {
            if self.refuse_watch {
                return Err(StorageError::Unavailable);
            }
            self.inner.watch(user_id).await
        }
    }

    fn service(registry: Arc<CountingRegistry>) -> ActiveSessionService {
        let clock = manual_clock();
        let identity = SessionIdentity::new(Arc::new(InMemoryKeyValueStore::new()), clock.clone());
        ActiveSessionService::new(registry, identity, clock, SessionConfig::default())
    }

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_only_touches_never_rewrites() {
        let registry = Arc::new(CountingRegistry::default());
        let sessions = service(Arc::clone(&registry));

        sessions
            .create_active_session(&user(), ClientMetadata::new("Firefox"))
            .await
            .unwrap();
        let heartbeat = sessions.start_session_heartbeat(&user()).await;
        tokio::time::sleep(Duration::from_secs(95)).await;
        heartbeat.stop();

        assert_eq!(registry.puts.load(Ordering::SeqCst), 1);
        // Immediate refresh plus ticks at 30s, 60s and 90s.
        assert_eq!(registry.touches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unwatchable_registry_yields_inert_subscription() {
        let registry = Arc::new(CountingRegistry {
            refuse_watch: true,
            ..CountingRegistry::default()
        });
        let sessions = service(registry);

        let subscription = sessions
            .listen_to_session_conflicts(&user(), |_| panic!("no conflicts expected"))
            .await;
        assert!(!subscription.is_active());
    }

    #[tokio::test]
    async fn update_without_record_reports_false() {
        let sessions = service(Arc::new(CountingRegistry::default()));
        assert!(!sessions.update_session_activity(&user()).await);
        assert!(sessions.active_record(&user()).await.is_none());
    }
}
