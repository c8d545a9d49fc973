use tokio::sync::broadcast;
use tracing::warn;
use tutor_core::model::{ActiveSessionRecord, UserId};

/// Buffered registry changes per feed before slow watchers start lagging.
const FEED_CAPACITY: usize = 64;

/// A change to one user's registry record. `record` is `None` after a delete.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub user_id: UserId,
    pub record: Option<ActiveSessionRecord>,
}

/// Fan-out of registry changes to in-process watchers.
#[derive(Debug, Clone)]
pub(crate) struct RegistryFeed {
    tx: broadcast::Sender<RegistryEvent>,
}

impl RegistryFeed {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, user_id: &UserId, record: Option<ActiveSessionRecord>) {
        // No watchers is fine.
        let _ = self.tx.send(RegistryEvent {
            user_id: user_id.clone(),
            record,
        });
    }

    /// Subscribe before reading `initial` so no change slips between the two.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }
}

/// Live subscription to one user's registry record.
///
/// Each call to [`RegistryWatch::next`] yields one snapshot: `Some(record)` after
/// a write, `None` after a delete. The stream ends when the store is dropped.
#[derive(Debug)]
pub struct RegistryWatch {
    user_id: UserId,
    initial: Option<Option<ActiveSessionRecord>>,
    rx: broadcast::Receiver<RegistryEvent>,
}

impl RegistryWatch {
    pub(crate) fn new(
        user_id: UserId,
        initial: Option<ActiveSessionRecord>,
        rx: broadcast::Receiver<RegistryEvent>,
    ) -> Self {
        Self {
            user_id,
            initial: Some(initial),
            rx,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Wait for the next snapshot. Returns `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<Option<ActiveSessionRecord>> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) if event.user_id == self.user_id => return Some(event.record),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(user_id = %self.user_id, skipped, "registry watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
