use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::debug;
use tutor_core::model::UserId;

use crate::registry::ActiveSessionService;

/// Running heartbeat for one user. Dropping the handle stops it.
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Spawn the periodic refresh. The first tick is one `every` from now;
    /// the caller performs the immediate refresh.
    pub(crate) fn spawn(sessions: ActiveSessionService, user_id: UserId, every: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Failures are logged inside and retried on the next tick.
                sessions.update_session_activity(&user_id).await;
            }
        });
        debug!(interval_secs = every.as_secs(), "session heartbeat started");
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
