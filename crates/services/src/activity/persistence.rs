use std::sync::Arc;

use serde_json::Value;
use storage::repository::KeyValueStore;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tutor_core::Clock;
use tutor_core::model::{
    ActivityIndex, ActivityIndexEntry, ActivitySnapshot, ActivityState, DocumentId,
    SNAPSHOT_VERSION,
};

use super::retention::{self, PruneReport};
use crate::config::PersistenceConfig;
use crate::error::PersistenceError;

/// Snapshot storage for in-progress exercises, one record per document plus
/// a shared index used for retention.
///
/// Public operations never fail: storage and parse errors are logged and
/// reported as `false` / `None`.
pub struct ActivityPersistence {
    store: Arc<dyn KeyValueStore>,
    clock: Clock,
    config: PersistenceConfig,
    // Serializes read-modify-write cycles on the index record.
    index_lock: Mutex<()>,
}

impl ActivityPersistence {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Clock, config: PersistenceConfig) -> Self {
        Self {
            store,
            clock,
            config,
            index_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    #[must_use]
    pub fn snapshot_key(&self, document_id: &DocumentId) -> String {
        format!("{}{}", self.config.key_prefix, document_id)
    }

    /// Snapshot key for `document_id`, or `None` if it would land on the
    /// index record.
    fn storable_key(&self, document_id: &DocumentId) -> Option<String> {
        let key = self.snapshot_key(document_id);
        if key == self.config.index_key() {
            warn!(%document_id, "document id collides with the activity index key");
            return None;
        }
        Some(key)
    }

    /// Write a snapshot of `state`, then refresh the index and apply retention.
    ///
    /// Returns `false` if the snapshot could not be written. Index and
    /// retention failures after a successful write are logged only.
    pub async fn save(&self, document_id: &DocumentId, state: &ActivityState) -> bool {
        let Some(key) = self.storable_key(document_id) else {
            return false;
        };
        let snapshot = ActivitySnapshot::capture(document_id.clone(), state.clone(), self.clock.now());

        if let Err(err) = self.write_snapshot(&key, &snapshot).await {
            warn!(%document_id, error = %err, "failed to save activity snapshot");
            return false;
        }
        debug!(
            %document_id,
            answered = snapshot.metrics.answered_count,
            completion = snapshot.metrics.completion_percentage,
            "activity snapshot saved"
        );

        match self.record_in_index(document_id, snapshot.index_entry()).await {
            Ok(report) if !report.is_empty() => {
                info!(
                    expired = report.expired.len(),
                    overflow = report.overflow.len(),
                    failed = report.failed.len(),
                    "activity retention applied"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(%document_id, error = %err, "failed to update activity index"),
        }
        true
    }

    /// Stored exercise state for `document_id`.
    ///
    /// A snapshot written under another schema version is returned as-is
    /// with a warning. Missing or corrupt snapshots yield `None`.
    pub async fn load(&self, document_id: &DocumentId) -> Option<ActivityState> {
        let raw = self.read_raw(document_id).await?;
        let value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                error!(%document_id, error = %err, "corrupt activity snapshot");
                return None;
            }
        };

        let version = value.get("version").and_then(Value::as_str).unwrap_or("unknown");
        if version != SNAPSHOT_VERSION {
            warn!(
                %document_id,
                stored = version,
                current = SNAPSHOT_VERSION,
                "activity snapshot version mismatch; loading without migration"
            );
        }

        let Some(data) = value.get("data").cloned() else {
            error!(%document_id, "activity snapshot has no data");
            return None;
        };
        match serde_json::from_value(data) {
            Ok(state) => Some(state),
            Err(err) => {
                error!(%document_id, error = %err, "unreadable activity snapshot data");
                None
            }
        }
    }

    /// Full stored snapshot, including metrics. `None` if missing or unreadable.
    pub async fn load_snapshot(&self, document_id: &DocumentId) -> Option<ActivitySnapshot> {
        let raw = self.read_raw(document_id).await?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                error!(%document_id, error = %err, "corrupt activity snapshot");
                None
            }
        }
    }

    /// Remove the snapshot and its index entry.
    pub async fn clear(&self, document_id: &DocumentId) -> bool {
        let Some(key) = self.storable_key(document_id) else {
            return false;
        };
        if let Err(err) = self.store.remove(&key).await {
            warn!(%document_id, error = %err, "failed to clear activity snapshot");
            return false;
        }

        let _guard = self.index_lock.lock().await;
        let result: Result<(), PersistenceError> = async {
            let mut index = self.read_index().await?;
            if index.remove(document_id).is_some() {
                self.write_index(&index).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!(%document_id, "activity snapshot cleared");
                true
            }
            Err(err) => {
                warn!(%document_id, error = %err, "failed to update activity index on clear");
                false
            }
        }
    }

    /// Current index of tracked documents. Empty if unreadable.
    pub async fn index(&self) -> ActivityIndex {
        let _guard = self.index_lock.lock().await;
        match self.read_index().await {
            Ok(index) => index,
            Err(err) => {
                warn!(error = %err, "failed to read activity index");
                ActivityIndex::new()
            }
        }
    }

    /// Apply the age and capacity bounds without saving anything.
    pub async fn prune(&self) -> PruneReport {
        let _guard = self.index_lock.lock().await;
        match self.apply_retention(None).await {
            Ok(report) => report,
            Err(err) => {
                warn!(error = %err, "activity retention failed");
                PruneReport::default()
            }
        }
    }

    async fn record_in_index(
        &self,
        document_id: &DocumentId,
        entry: ActivityIndexEntry,
    ) -> Result<PruneReport, PersistenceError> {
        let _guard = self.index_lock.lock().await;
        self.apply_retention(Some((document_id, entry))).await
    }

    /// Caller holds `index_lock`.
    async fn apply_retention(
        &self,
        upsert: Option<(&DocumentId, ActivityIndexEntry)>,
    ) -> Result<PruneReport, PersistenceError> {
        let mut index = self.read_index().await?;
        let mut dirty = false;
        if let Some((document_id, entry)) = upsert {
            index.upsert(document_id.clone(), entry);
            dirty = true;
        }

        let (expired, overflow) = retention::plan(&index, self.clock.now_millis(), &self.config);
        let report = if expired.is_empty() && overflow.is_empty() {
            PruneReport::default()
        } else {
            dirty = true;
            retention::evict(self.store.as_ref(), &self.config, &mut index, expired, overflow)
                .await
        };

        if dirty {
            self.write_index(&index).await?;
        }
        Ok(report)
    }

    async fn write_snapshot(
        &self,
        key: &str,
        snapshot: &ActivitySnapshot,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(snapshot)?;
        self.store.set(key, &json).await?;
        Ok(())
    }

    async fn read_raw(&self, document_id: &DocumentId) -> Option<String> {
        let key = self.storable_key(document_id)?;
        match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%document_id, error = %err, "failed to read activity snapshot");
                None
            }
        }
    }

    async fn read_index(&self) -> Result<ActivityIndex, PersistenceError> {
        let Some(raw) = self.store.get(&self.config.index_key()).await? else {
            return Ok(ActivityIndex::new());
        };
        match serde_json::from_str(&raw) {
            Ok(index) => Ok(index),
            Err(err) => {
                warn!(error = %err, "corrupt activity index; rebuilding from snapshots");
                self.rebuild_index().await
            }
        }
    }

    async fn write_index(&self, index: &ActivityIndex) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(index)?;
        self.store.set(&self.config.index_key(), &json).await?;
        Ok(())
    }

    /// Reconstruct the index by scanning stored snapshots. Unreadable
    /// snapshots are skipped.
    async fn rebuild_index(&self) -> Result<ActivityIndex, PersistenceError> {
        let index_key = self.config.index_key();
        let mut index = ActivityIndex::new();
        for key in self.store.keys(&self.config.key_prefix).await? {
            if key == index_key {
                continue;
            }
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<ActivitySnapshot>(&raw) {
                Ok(snapshot) => index.upsert(snapshot.document_id.clone(), snapshot.index_entry()),
                Err(err) => warn!(%key, error = %err, "skipping unreadable snapshot during rebuild"),
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeMap;
    use storage::memory::InMemoryKeyValueStore;
    use tutor_core::model::AiFeedback;
    use tutor_core::time::manual_clock;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    fn reference_state() -> ActivityState {
        let mut state = ActivityState::default();
        state.student_answers.insert(0, "abc".into());
        state.student_answers.insert(1, String::new());
        state.ai_feedbacks.insert(0, AiFeedback::evaluated("alta"));
        state
    }

    fn setup() -> (ActivityPersistence, InMemoryKeyValueStore, Clock) {
        let store = InMemoryKeyValueStore::new();
        let clock = manual_clock();
        let persistence = ActivityPersistence::new(
            Arc::new(store.clone()),
            clock.clone(),
            PersistenceConfig::default(),
        );
        (persistence, store, clock)
    }

    #[tokio::test]
    async fn save_writes_snapshot_with_metrics_and_index() {
        let (persistence, store, clock) = setup();
        assert!(persistence.save(&doc("d1"), &reference_state()).await);

        let snapshot = persistence.load_snapshot(&doc("d1")).await.unwrap();
        assert_eq!(snapshot.version, "1.0");
        assert_eq!(snapshot.last_modified, clock.now_millis());
        assert_eq!(snapshot.metrics.total_questions, 2);
        assert_eq!(snapshot.metrics.answered_count, 1);
        assert_eq!(snapshot.metrics.feedback_count, 1);
        assert_eq!(snapshot.metrics.completion_percentage, 50);
        assert_eq!(
            snapshot.metrics.evaluation_distribution,
            BTreeMap::from([("alta".to_owned(), 1)])
        );

        let raw_index = store.get("activity_progress_index").await.unwrap().unwrap();
        let index: Value = serde_json::from_str(&raw_index).unwrap();
        assert_eq!(index["d1"]["completion"], 50);
        assert_eq!(index["d1"]["answered_count"], 1);
    }

    #[tokio::test]
    async fn saving_same_state_twice_yields_same_metrics() {
        let (persistence, _store, clock) = setup();
        persistence.save(&doc("d1"), &reference_state()).await;
        let first = persistence.load_snapshot(&doc("d1")).await.unwrap().metrics;
        clock.advance(Duration::seconds(5));
        persistence.save(&doc("d1"), &reference_state()).await;
        let second = persistence.load_snapshot(&doc("d1")).await.unwrap().metrics;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn load_returns_saved_state() {
        let (persistence, _store, _clock) = setup();
        persistence.save(&doc("d1"), &reference_state()).await;
        assert_eq!(persistence.load(&doc("d1")).await, Some(reference_state()));
        assert_eq!(persistence.load(&doc("missing")).await, None);
    }

    #[tokio::test]
    async fn corrupt_snapshot_loads_as_none() {
        let (persistence, store, _clock) = setup();
        store.set("activity_progress_d1", "{not json").await.unwrap();
        assert_eq!(persistence.load(&doc("d1")).await, None);
        assert!(persistence.load_snapshot(&doc("d1")).await.is_none());
    }

    #[tokio::test]
    async fn version_mismatch_still_returns_data() {
        let (persistence, store, _clock) = setup();
        let json = serde_json::json!({
            "version": "0.9",
            "document_id": "d1",
            "data": {"student_answers": {"0": "old answer"}, "current_index": 0}
        });
        store
            .set("activity_progress_d1", &json.to_string())
            .await
            .unwrap();

        let state = persistence.load(&doc("d1")).await.unwrap();
        assert_eq!(
            state.student_answers.get(&0).map(String::as_str),
            Some("old answer")
        );
    }

    #[tokio::test]
    async fn quota_exceeded_save_returns_false() {
        let store = InMemoryKeyValueStore::with_quota(32);
        let persistence =
            ActivityPersistence::new(Arc::new(store), manual_clock(), PersistenceConfig::default());
        assert!(!persistence.save(&doc("d1"), &reference_state()).await);
    }

    #[tokio::test]
    async fn clear_removes_snapshot_and_index_entry() {
        let (persistence, _store, _clock) = setup();
        persistence.save(&doc("d1"), &reference_state()).await;
        persistence.save(&doc("d2"), &reference_state()).await;

        assert!(persistence.clear(&doc("d1")).await);
        assert!(persistence.clear(&doc("d1")).await);
        assert_eq!(persistence.load(&doc("d1")).await, None);

        let index = persistence.index().await;
        assert!(!index.contains(&doc("d1")));
        assert!(index.contains(&doc("d2")));
    }

    #[tokio::test]
    async fn unavailable_store_degrades_quietly() {
        let (persistence, store, _clock) = setup();
        store.set_available(false);
        assert!(!persistence.save(&doc("d1"), &reference_state()).await);
        assert_eq!(persistence.load(&doc("d1")).await, None);
        assert!(!persistence.clear(&doc("d1")).await);
        assert!(persistence.index().await.is_empty());
        assert!(persistence.prune().await.is_empty());
    }

    #[tokio::test]
    async fn capacity_bound_evicts_oldest() {
        let (persistence, _store, clock) = setup();
        for i in 0..16 {
            clock.advance(Duration::seconds(1));
            assert!(persistence.save(&doc(&format!("doc-{i:02}")), &reference_state()).await);
        }

        let index = persistence.index().await;
        assert_eq!(index.len(), 15);
        assert!(!index.contains(&doc("doc-00")));
        assert!(index.contains(&doc("doc-15")));
        assert_eq!(persistence.load(&doc("doc-00")).await, None);
    }

    #[tokio::test]
    async fn age_bound_evicts_regardless_of_count() {
        let (persistence, _store, clock) = setup();
        persistence.save(&doc("stale"), &reference_state()).await;
        clock.advance(Duration::days(31));
        persistence.save(&doc("fresh"), &reference_state()).await;

        let index = persistence.index().await;
        assert_eq!(index.len(), 1);
        assert!(index.contains(&doc("fresh")));
        assert_eq!(persistence.load(&doc("stale")).await, None);
    }

    #[tokio::test]
    async fn prune_without_save_applies_age_bound() {
        let (persistence, _store, clock) = setup();
        persistence.save(&doc("d1"), &reference_state()).await;
        clock.advance(Duration::days(30) + Duration::milliseconds(1));

        let report = persistence.prune().await;
        assert_eq!(report.expired, vec![doc("d1")]);
        assert!(persistence.index().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_index_is_rebuilt_from_snapshots() {
        let (persistence, store, _clock) = setup();
        persistence.save(&doc("d1"), &reference_state()).await;
        persistence.save(&doc("d2"), &reference_state()).await;
        store.set("activity_progress_index", "][").await.unwrap();

        let index = persistence.index().await;
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&doc("d1")).unwrap().completion, 50);
    }

    #[tokio::test]
    async fn document_named_like_the_index_is_refused() {
        let (persistence, store, _clock) = setup();
        assert!(persistence.save(&doc("d1"), &reference_state()).await);

        assert!(!persistence.save(&doc("index"), &reference_state()).await);
        assert!(persistence.load(&doc("index")).await.is_none());
        assert!(!persistence.clear(&doc("index")).await);

        let index = persistence.index().await;
        assert_eq!(index.len(), 1);
        assert!(index.contains(&doc("d1")));
        let raw_index = store.get("activity_progress_index").await.unwrap().unwrap();
        assert!(serde_json::from_str::<ActivityIndex>(&raw_index).is_ok());
    }
}
