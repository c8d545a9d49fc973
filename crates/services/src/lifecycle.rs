use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tracing::{info, warn};
use tutor_core::model::{ActiveSessionRecord, ClientMetadata, SessionPhase, SessionToken, UserId};

use crate::error::LifecycleError;
use crate::heartbeat::HeartbeatHandle;
use crate::identity::SessionIdentity;
use crate::registry::{ActiveSessionService, ConflictSubscription};

#[derive(Default)]
struct Inner {
    phase: SessionPhase,
    user_id: Option<UserId>,
    token: Option<SessionToken>,
    heartbeat: Option<HeartbeatHandle>,
    listener: Option<ConflictSubscription>,
    evicted_by: Option<ActiveSessionRecord>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One browser context's claim on a user session.
///
/// `login` registers the session, starts the heartbeat and watches for
/// conflicts. When another context takes over, the heartbeat and listener
/// are torn down, the local token is dropped and the phase becomes
/// `Evicted`. Dropping the lifecycle stops all background work.
pub struct SessionLifecycle {
    sessions: ActiveSessionService,
    inner: Arc<Mutex<Inner>>,
    phase_tx: Arc<watch::Sender<SessionPhase>>,
}

impl SessionLifecycle {
    #[must_use]
    pub fn new(sessions: ActiveSessionService) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Unregistered);
        Self {
            sessions,
            inner: Arc::new(Mutex::new(Inner::default())),
            phase_tx: Arc::new(phase_tx),
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        lock(&self.inner).phase
    }

    /// Receiver that observes every phase change.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        lock(&self.inner).user_id.clone()
    }

    #[must_use]
    pub fn token(&self) -> Option<SessionToken> {
        lock(&self.inner).token.clone()
    }

    /// The record that evicted this context, once `Evicted`.
    #[must_use]
    pub fn evicted_by(&self) -> Option<ActiveSessionRecord> {
        lock(&self.inner).evicted_by.clone()
    }

    #[must_use]
    pub fn is_heartbeat_running(&self) -> bool {
        lock(&self.inner)
            .heartbeat
            .as_ref()
            .is_some_and(HeartbeatHandle::is_running)
    }

    /// Claim the user's session for this context.
    ///
    /// # Errors
    ///
    /// Returns `LifecycleError::Phase` unless the lifecycle is `Unregistered`,
    /// and `LifecycleError::RegistryUnavailable` if the registry write fails.
    pub async fn login(
        &mut self,
        user_id: &UserId,
        metadata: ClientMetadata,
    ) -> Result<SessionToken, LifecycleError> {
        self.phase().transition(SessionPhase::Active)?;

        let token = self
            .sessions
            .create_active_session(user_id, metadata)
            .await
            .ok_or(LifecycleError::RegistryUnavailable)?;
        let heartbeat = self.sessions.start_session_heartbeat(user_id).await;

        {
            let mut inner = lock(&self.inner);
            inner.phase = SessionPhase::Active;
            inner.user_id = Some(user_id.clone());
            inner.token = Some(token.clone());
            inner.heartbeat = Some(heartbeat);
        }
        self.phase_tx.send_replace(SessionPhase::Active);

        let weak_inner = Arc::downgrade(&self.inner);
        let weak_phase = Arc::downgrade(&self.phase_tx);
        let identity = self.sessions.identity().clone();
        let listener = self
            .sessions
            .listen_as_owner(user_id, &token, move |record| {
                evict(&weak_inner, &weak_phase, &identity, record);
            })
            .await;

        let mut inner = lock(&self.inner);
        if inner.phase == SessionPhase::Active {
            inner.listener = Some(listener);
        }
        Ok(token)
    }

    /// Leave the session.
    ///
    /// An active owner deletes its registry record. An evicted context only
    /// cleans up locally: the record belongs to the new owner. Returns `false`
    /// if the registry delete failed.
    pub async fn logout(&mut self) -> bool {
        let (phase, user_id, heartbeat, listener) = {
            let mut inner = lock(&self.inner);
            (
                inner.phase,
                inner.user_id.clone(),
                inner.heartbeat.take(),
                inner.listener.take(),
            )
        };
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        if let Some(listener) = listener {
            listener.unsubscribe();
        }

        match phase {
            SessionPhase::Active => {
                let closed = match &user_id {
                    Some(user_id) => self.sessions.close_active_session(user_id).await,
                    None => true,
                };
                self.set_phase(SessionPhase::Closed);
                closed
            }
            SessionPhase::Unregistered => {
                self.set_phase(SessionPhase::Closed);
                true
            }
            SessionPhase::Evicted => {
                self.sessions.identity().clear().await;
                true
            }
            SessionPhase::Closed => true,
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        {
            let mut inner = lock(&self.inner);
            inner.phase = phase;
            inner.token = None;
        }
        self.phase_tx.send_replace(phase);
    }
}

fn evict(
    inner: &Weak<Mutex<Inner>>,
    phase_tx: &Weak<watch::Sender<SessionPhase>>,
    identity: &SessionIdentity,
    record: ActiveSessionRecord,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let (heartbeat, listener) = {
        let mut guard = lock(&inner);
        if guard.phase != SessionPhase::Active {
            return;
        }
        info!(
            user_id = %record.user_id,
            owner = %record.session_id,
            browser = record.browser(),
            "session taken over by another context"
        );
        guard.phase = SessionPhase::Evicted;
        guard.token = None;
        guard.evicted_by = Some(record);
        (guard.heartbeat.take(), guard.listener.take())
    };

    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
    }
    // Running inside the listener task: this aborts it at its next await.
    drop(listener);

    if let Some(phase_tx) = phase_tx.upgrade() {
        phase_tx.send_replace(SessionPhase::Evicted);
    }

    let identity = identity.clone();
    tokio::spawn(async move {
        identity.clear().await;
    });
}

impl Drop for SessionLifecycle {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        if inner.phase == SessionPhase::Active {
            warn!("session lifecycle dropped while active; stopping background work");
        }
        drop(inner.heartbeat.take());
        drop(inner.listener.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppServices;
    use crate::config::{PersistenceConfig, SessionConfig};
    use crate::identity::SESSION_TOKEN_KEY;
    use std::time::Duration;

    use storage::memory::InMemoryKeyValueStore;
    use storage::repository::{KeyValueStore, SessionRegistryStore, Storage};
    use tutor_core::time::manual_clock;

    fn lifecycle(storage: &Storage) -> SessionLifecycle {
        AppServices::new(
            storage,
            manual_clock(),
            SessionConfig::default(),
            PersistenceConfig::default(),
        )
        .lifecycle()
    }

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    #[tokio::test]
    async fn logout_before_login_closes() {
        let mut lifecycle = lifecycle(&Storage::in_memory());
        assert!(lifecycle.logout().await);
        assert_eq!(lifecycle.phase(), SessionPhase::Closed);
        assert!(lifecycle.login(&user(), ClientMetadata::new("Firefox")).await.is_err());
    }

    #[tokio::test]
    async fn logout_deletes_record_and_token() {
        let storage = Storage::in_memory();
        let mut lifecycle = lifecycle(&storage);
        let token = lifecycle
            .login(&user(), ClientMetadata::new("Firefox"))
            .await
            .unwrap();
        assert_eq!(lifecycle.token(), Some(token));
        assert_eq!(lifecycle.user_id(), Some(user()));

        assert!(lifecycle.logout().await);
        assert_eq!(lifecycle.phase(), SessionPhase::Closed);
        assert!(lifecycle.token().is_none());
        assert!(!lifecycle.is_heartbeat_running());
        assert!(storage.registry.get_record(&user()).await.unwrap().is_none());
        assert!(storage.ephemeral.get(SESSION_TOKEN_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_login_is_rejected() {
        let mut lifecycle = lifecycle(&Storage::in_memory());
        lifecycle
            .login(&user(), ClientMetadata::new("Firefox"))
            .await
            .unwrap();
        assert!(matches!(
            lifecycle.login(&user(), ClientMetadata::new("Firefox")).await,
            Err(LifecycleError::Phase(_))
        ));
        assert_eq!(lifecycle.phase(), SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_token_cache_does_not_evict_own_session() {
        let ephemeral = InMemoryKeyValueStore::new();
        ephemeral.set_available(false);
        let storage = Storage {
            ephemeral: Arc::new(ephemeral),
            ..Storage::in_memory()
        };
        let mut lifecycle = lifecycle(&storage);

        let token = lifecycle
            .login(&user(), ClientMetadata::new("Firefox"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(lifecycle.phase(), SessionPhase::Active);
        assert!(lifecycle.evicted_by().is_none());
        assert!(lifecycle.is_heartbeat_running());
        let stored = storage.registry.get_record(&user()).await.unwrap().unwrap();
        assert_eq!(stored.session_id, token);
    }
}
