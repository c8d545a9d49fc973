use std::sync::Arc;

use storage::repository::KeyValueStore;
use tracing::{debug, warn};
use tutor_core::Clock;
use tutor_core::model::SessionToken;

/// Key under which the token is cached in the per-context store.
pub const SESSION_TOKEN_KEY: &str = "session_id";

/// Generates and caches this context's session token.
#[derive(Clone)]
pub struct SessionIdentity {
    store: Arc<dyn KeyValueStore>,
    clock: Clock,
}

impl SessionIdentity {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Clock) -> Self {
        Self { store, clock }
    }

    /// The cached token, if one exists and is readable.
    pub async fn current(&self) -> Option<SessionToken> {
        match self.store.get(SESSION_TOKEN_KEY).await {
            Ok(Some(raw)) => match SessionToken::from_persisted(raw) {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!(error = %err, "discarding unreadable cached session token");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "failed to read cached session token");
                None
            }
        }
    }

    /// Reuse the cached token or mint and cache a new one.
    ///
    /// If the token cannot be cached it is still returned; the next call will
    /// mint a different one.
    pub async fn current_or_create(&self) -> SessionToken {
        if let Some(token) = self.current().await {
            return token;
        }
        let token = SessionToken::generate(self.clock.now_millis());
        match self.store.set(SESSION_TOKEN_KEY, token.as_str()).await {
            Ok(()) => debug!(session_id = %token, "created session token"),
            Err(err) => warn!(error = %err, "failed to cache session token"),
        }
        token
    }

    /// Forget the cached token. Missing tokens are not an error.
    pub async fn clear(&self) {
        if let Err(err) = self.store.remove(SESSION_TOKEN_KEY).await {
            warn!(error = %err, "failed to clear cached session token");
        }
    }
}
