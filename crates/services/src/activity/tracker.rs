use std::sync::Arc;

use tracing::{debug, info};
use tutor_core::model::{ActivityState, DocumentId};

use super::autosave::AutosaveTask;
use super::persistence::ActivityPersistence;

/// Per-view driver for activity persistence: which document is open,
/// whether saving is enabled, and when autosave timers run.
pub struct ActivityTracker {
    persistence: Arc<ActivityPersistence>,
    enabled: bool,
    document_id: Option<DocumentId>,
    rehydrated: Option<DocumentId>,
    autosave: Option<AutosaveTask>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new(persistence: Arc<ActivityPersistence>) -> Self {
        Self {
            persistence,
            enabled: true,
            document_id: None,
            rehydrated: None,
            autosave: None,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn document_id(&self) -> Option<&DocumentId> {
        self.document_id.as_ref()
    }

    #[must_use]
    pub fn has_pending_autosave(&self) -> bool {
        self.autosave.is_some()
    }

    /// Turn saving on or off. Disabling cancels pending timers.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if !enabled {
            self.autosave = None;
            debug!("activity tracking disabled");
        }
    }

    /// Point the tracker at a document.
    ///
    /// The first time a given id becomes active, any stored state is loaded
    /// and passed to `rehydrate`, and the periodic save starts keeping it
    /// fresh. Setting the same id again does nothing.
    /// Returns whether `rehydrate` was called.
    pub async fn set_document<F>(&mut self, document_id: Option<DocumentId>, rehydrate: F) -> bool
    where
        F: FnOnce(ActivityState),
    {
        if self.document_id == document_id {
            return false;
        }
        self.autosave = None;
        self.document_id = document_id;

        let Some(id) = self.document_id.clone() else {
            self.rehydrated = None;
            return false;
        };
        if !self.enabled || self.rehydrated.as_ref() == Some(&id) {
            return false;
        }
        self.rehydrated = Some(id.clone());

        match self.persistence.load(&id).await {
            Some(state) => {
                info!(document_id = %id, "rehydrating saved activity");
                let config = self.persistence.config();
                self.autosave = Some(AutosaveTask::spawn_seeded(
                    Arc::clone(&self.persistence),
                    id,
                    state.clone(),
                    config.debounce,
                    config.periodic_save,
                ));
                rehydrate(state);
                true
            }
            None => false,
        }
    }

    /// Note a change to tracked state; it is saved once edits pause or on the
    /// next periodic tick. Ignored while disabled or without a document.
    pub fn record_change(&mut self, state: ActivityState) {
        if !self.enabled {
            return;
        }
        let Some(id) = self.document_id.clone() else {
            return;
        };
        let config = self.persistence.config();
        let (debounce, periodic) = (config.debounce, config.periodic_save);
        let persistence = Arc::clone(&self.persistence);
        self.autosave
            .get_or_insert_with(|| AutosaveTask::spawn(persistence, id, debounce, periodic))
            .update(state);
    }

    /// Save immediately. `false` when disabled, without a document, or on
    /// storage failure.
    pub async fn save_now(&self, state: &ActivityState) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(id) = &self.document_id else {
            return false;
        };
        self.persistence.save(id, state).await
    }

    /// Save whatever the autosave task is holding, without waiting for timers.
    pub async fn flush(&self) -> bool {
        let Some(state) = self.autosave.as_ref().and_then(AutosaveTask::latest) else {
            return false;
        };
        self.save_now(&state).await
    }

    /// Remove the current document's stored state and stop its timers.
    pub async fn clear(&mut self) -> bool {
        self.autosave = None;
        let Some(id) = &self.document_id else {
            return false;
        };
        self.persistence.clear(id).await
    }
}
