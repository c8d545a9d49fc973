use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;
use tutor_core::model::{ActivityState, DocumentId};

use super::persistence::ActivityPersistence;

/// Background saver for one document.
///
/// Writes the latest state `debounce` after the last change, and
/// unconditionally every `periodic` so continuous edits still get persisted.
/// Dropping the task cancels both timers without a final write.
#[derive(Debug)]
pub struct AutosaveTask {
    document_id: DocumentId,
    latest: watch::Sender<Option<ActivityState>>,
    task: JoinHandle<()>,
}

impl AutosaveTask {
    #[must_use]
    pub fn spawn(
        persistence: Arc<ActivityPersistence>,
        document_id: DocumentId,
        debounce: Duration,
        periodic: Duration,
    ) -> Self {
        Self::start(persistence, document_id, None, debounce, periodic)
    }

    /// Start with `state` already pending. It is written by the periodic
    /// save only; the debounce window opens on the first `update`.
    #[must_use]
    pub fn spawn_seeded(
        persistence: Arc<ActivityPersistence>,
        document_id: DocumentId,
        state: ActivityState,
        debounce: Duration,
        periodic: Duration,
    ) -> Self {
        Self::start(persistence, document_id, Some(state), debounce, periodic)
    }

    fn start(
        persistence: Arc<ActivityPersistence>,
        document_id: DocumentId,
        initial: Option<ActivityState>,
        debounce: Duration,
        periodic: Duration,
    ) -> Self {
        let (latest, rx) = watch::channel(initial);
        let task = tokio::spawn(run(persistence, document_id.clone(), rx, debounce, periodic));
        Self {
            document_id,
            latest,
            task,
        }
    }

    #[must_use]
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Replace the pending state and restart the debounce window.
    pub fn update(&self, state: ActivityState) {
        self.latest.send_replace(Some(state));
    }

    /// Most recent state handed to the task, saved or not.
    #[must_use]
    pub fn latest(&self) -> Option<ActivityState> {
        self.latest.borrow().clone()
    }

    pub fn cancel(self) {
        self.task.abort();
    }
}

impl Drop for AutosaveTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    persistence: Arc<ActivityPersistence>,
    document_id: DocumentId,
    mut rx: watch::Receiver<Option<ActivityState>>,
    debounce: Duration,
    periodic: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + periodic, periodic);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                deadline = Some(Instant::now() + debounce);
            }
            () = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                save_latest(&persistence, &document_id, &mut rx, "debounced").await;
            }
            _ = ticker.tick() => {
                save_latest(&persistence, &document_id, &mut rx, "periodic").await;
            }
        }
    }
}

async fn save_latest(
    persistence: &ActivityPersistence,
    document_id: &DocumentId,
    rx: &mut watch::Receiver<Option<ActivityState>>,
    trigger: &'static str,
) {
    let latest = rx.borrow_and_update().clone();
    if let Some(state) = latest {
        let saved = persistence.save(document_id, &state).await;
        debug!(%document_id, trigger, saved, "autosave");
    }
}
