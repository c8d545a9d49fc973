use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{SessionToken, UserId};

//
// ─── CLIENT METADATA ───────────────────────────────────────────────────────────
//

/// Descriptive fields attached to a session record when it is created.
///
/// Heartbeats never touch these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMetadata {
    #[serde(default)]
    pub browser: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ClientMetadata {
    #[must_use]
    pub fn new(browser: impl Into<String>) -> Self {
        Self {
            browser: browser.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Attach an extra descriptive field (role, email, ...).
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

//
// ─── ACTIVE SESSION RECORD ─────────────────────────────────────────────────────
//

/// The single registry entry naming which session currently owns a user.
///
/// Serialized in the camelCase shape shared with other clients:
/// `{sessionId, userId, createdAt, lastActivity, browser, ...extra}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSessionRecord {
    pub session_id: SessionToken,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(flatten)]
    pub metadata: ClientMetadata,
}

impl ActiveSessionRecord {
    #[must_use]
    pub fn new(
        user_id: UserId,
        session_id: SessionToken,
        metadata: ClientMetadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            created_at: now,
            last_activity: now,
            metadata,
        }
    }

    /// True when `token` is the current owner of this record.
    #[must_use]
    pub fn is_owned_by(&self, token: &SessionToken) -> bool {
        &self.session_id == token
    }

    #[must_use]
    pub fn browser(&self) -> &str {
        &self.metadata.browser
    }
}

//
// ─── SESSION PHASE ─────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionPhaseError {
    #[error("cannot move session from {from:?} to {to:?}")]
    InvalidTransition { from: SessionPhase, to: SessionPhase },
}

/// Lifecycle of one browser context's claim on a user session.
///
/// `Evicted` and `Closed` are terminal; re-entering `Active` needs a new token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Unregistered,
    Active,
    Evicted,
    Closed,
}

impl SessionPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Evicted | SessionPhase::Closed)
    }

    /// Validate and apply a transition.
    ///
    /// # Errors
    ///
    /// Returns `SessionPhaseError::InvalidTransition` for moves the lifecycle does not allow.
    pub fn transition(self, to: SessionPhase) -> Result<SessionPhase, SessionPhaseError> {
        use SessionPhase::{Active, Closed, Evicted, Unregistered};
        match (self, to) {
            (Unregistered, Active | Closed) | (Active, Evicted | Closed) => Ok(to),
            _ => Err(SessionPhaseError::InvalidTransition { from: self, to }),
        }
    }
}
