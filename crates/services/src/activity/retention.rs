use storage::repository::KeyValueStore;
use tracing::{debug, warn};
use tutor_core::model::{ActivityIndex, DocumentId};

use crate::config::PersistenceConfig;

/// Documents removed (or not) by one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Evicted for exceeding the age bound.
    pub expired: Vec<DocumentId>,
    /// Evicted, oldest first, to get back under the capacity bound.
    pub overflow: Vec<DocumentId>,
    /// Selected for eviction but their snapshot could not be removed.
    pub failed: Vec<DocumentId>,
}

impl PruneReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.overflow.is_empty() && self.failed.is_empty()
    }

    #[must_use]
    pub fn evicted(&self) -> usize {
        self.expired.len() + self.overflow.len()
    }
}

/// Age bound first, then capacity over whatever is left.
pub(super) fn plan(
    index: &ActivityIndex,
    now_millis: i64,
    config: &PersistenceConfig,
) -> (Vec<DocumentId>, Vec<DocumentId>) {
    let cutoff = now_millis.saturating_sub(config.max_age.num_milliseconds());
    let expired = index.expired_before(cutoff);

    let mut remaining = index.clone();
    for id in &expired {
        remaining.remove(id);
    }
    let overflow = remaining.overflow(config.capacity);

    (expired, overflow)
}

/// Remove planned snapshots and drop them from `index`.
///
/// Entries whose snapshot cannot be removed stay indexed so a later pass
/// retries them.
pub(super) async fn evict(
    store: &dyn KeyValueStore,
    config: &PersistenceConfig,
    index: &mut ActivityIndex,
    expired: Vec<DocumentId>,
    overflow: Vec<DocumentId>,
) -> PruneReport {
    let mut report = PruneReport::default();

    for (id, is_expired) in expired
        .into_iter()
        .map(|id| (id, true))
        .chain(overflow.into_iter().map(|id| (id, false)))
    {
        let key = format!("{}{}", config.key_prefix, id);
        match store.remove(&key).await {
            Ok(()) => {
                index.remove(&id);
                debug!(document_id = %id, expired = is_expired, "evicted activity snapshot");
                if is_expired {
                    report.expired.push(id);
                } else {
                    report.overflow.push(id);
                }
            }
            Err(err) => {
                warn!(document_id = %id, error = %err, "failed to evict activity snapshot");
                report.failed.push(id);
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::model::ActivityIndexEntry;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    fn index_of(entries: &[(&str, i64)]) -> ActivityIndex {
        let mut index = ActivityIndex::new();
        for (id, last_modified) in entries {
            index.upsert(
                doc(id),
                ActivityIndexEntry {
                    last_modified: *last_modified,
                    completion: 0,
                    answered_count: 0,
                },
            );
        }
        index
    }

    #[test]
    fn expired_entries_do_not_count_against_capacity() {
        let now = 100 * DAY_MS;
        let index = index_of(&[
            ("ancient", now - 40 * DAY_MS),
            ("a", now - 3),
            ("b", now - 2),
            ("c", now - 1),
        ]);
        let config = PersistenceConfig::default().with_capacity(2);

        let (expired, overflow) = plan(&index, now, &config);
        assert_eq!(expired, vec![doc("ancient")]);
        assert_eq!(overflow, vec![doc("a")]);
    }

    #[test]
    fn nothing_planned_within_bounds() {
        let now = 100 * DAY_MS;
        let index = index_of(&[("a", now - DAY_MS), ("b", now)]);
        let (expired, overflow) = plan(&index, now, &PersistenceConfig::default());
        assert!(expired.is_empty());
        assert!(overflow.is_empty());
    }
}
