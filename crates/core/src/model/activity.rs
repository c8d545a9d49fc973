use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::DocumentId;

/// Schema version written into every snapshot.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Bucket used for feedback entries that carry no evaluation result.
pub const UNEVALUATED: &str = "unevaluated";

//
// ─── EXERCISE STATE ────────────────────────────────────────────────────────────
//

/// AI feedback for one question.
///
/// Only the categorical result is interpreted; everything else is carried verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiFeedback {
    #[serde(
        rename = "evaluacion",
        alias = "evaluation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub evaluation: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AiFeedback {
    #[must_use]
    pub fn evaluated(result: impl Into<String>) -> Self {
        Self {
            evaluation: Some(result.into()),
            extra: BTreeMap::new(),
        }
    }

    /// Distribution bucket this feedback counts towards.
    #[must_use]
    pub fn bucket(&self) -> &str {
        self.evaluation
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNEVALUATED)
    }
}

/// In-progress exercise state for one document, keyed by question index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityState {
    #[serde(default)]
    pub student_answers: BTreeMap<u32, String>,
    #[serde(default)]
    pub ai_feedbacks: BTreeMap<u32, AiFeedback>,
    #[serde(default)]
    pub criterion_feedbacks: BTreeMap<u32, Value>,
    #[serde(default)]
    pub current_index: u32,
}

impl ActivityState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.student_answers.is_empty()
            && self.ai_feedbacks.is_empty()
            && self.criterion_feedbacks.is_empty()
    }
}

//
// ─── METRICS ───────────────────────────────────────────────────────────────────
//

/// Summary figures derived from an [`ActivityState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMetrics {
    pub total_questions: u32,
    pub answered_count: u32,
    pub feedback_count: u32,
    pub completion_percentage: u32,
    pub evaluation_distribution: BTreeMap<String, u32>,
    pub last_question_index: u32,
}

impl ActivityMetrics {
    /// Derive metrics from exercise state. Pure: equal input gives equal output.
    #[must_use]
    pub fn from_state(state: &ActivityState) -> Self {
        let total_questions = state
            .student_answers
            .keys()
            .next_back()
            .map_or(0, |max| max.saturating_add(1));

        let answered_count = count_u32(
            state
                .student_answers
                .values()
                .filter(|answer| !answer.trim().is_empty()),
        );

        let feedback_count = count_u32(state.ai_feedbacks.values());

        let mut evaluation_distribution = BTreeMap::new();
        for feedback in state.ai_feedbacks.values() {
            *evaluation_distribution
                .entry(feedback.bucket().to_owned())
                .or_insert(0_u32) += 1;
        }

        Self {
            total_questions,
            answered_count,
            feedback_count,
            completion_percentage: percentage(answered_count, total_questions),
            evaluation_distribution,
            last_question_index: state.current_index,
        }
    }
}

fn count_u32<I: Iterator>(iter: I) -> u32 {
    u32::try_from(iter.count()).unwrap_or(u32::MAX)
}

fn percentage(part: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    let part = u64::from(part);
    let total = u64::from(total);
    let rounded = (part * 100 + total / 2) / total;
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

//
// ─── SNAPSHOT ──────────────────────────────────────────────────────────────────
//

/// Persisted point-in-time copy of exercise state plus its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub version: String,
    pub document_id: DocumentId,
    pub timestamp: DateTime<Utc>,
    pub last_modified: i64,
    pub data: ActivityState,
    pub metrics: ActivityMetrics,
}

impl ActivitySnapshot {
    #[must_use]
    pub fn capture(document_id: DocumentId, state: ActivityState, now: DateTime<Utc>) -> Self {
        let metrics = ActivityMetrics::from_state(&state);
        Self {
            version: SNAPSHOT_VERSION.to_owned(),
            document_id,
            timestamp: now,
            last_modified: now.timestamp_millis(),
            data: state,
            metrics,
        }
    }

    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == SNAPSHOT_VERSION
    }

    #[must_use]
    pub fn index_entry(&self) -> ActivityIndexEntry {
        ActivityIndexEntry {
            last_modified: self.last_modified,
            completion: self.metrics.completion_percentage,
            answered_count: self.metrics.answered_count,
        }
    }
}

//
// ─── INDEX ─────────────────────────────────────────────────────────────────────
//

/// Recency and completion for one tracked document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityIndexEntry {
    pub last_modified: i64,
    pub completion: u32,
    pub answered_count: u32,
}

/// Aggregate index over all tracked documents, used for retention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActivityIndex {
    entries: BTreeMap<DocumentId, ActivityIndexEntry>,
}

impl ActivityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, document_id: DocumentId, entry: ActivityIndexEntry) {
        self.entries.insert(document_id, entry);
    }

    pub fn remove(&mut self, document_id: &DocumentId) -> Option<ActivityIndexEntry> {
        self.entries.remove(document_id)
    }

    #[must_use]
    pub fn get(&self, document_id: &DocumentId) -> Option<&ActivityIndexEntry> {
        self.entries.get(document_id)
    }

    #[must_use]
    pub fn contains(&self, document_id: &DocumentId) -> bool {
        self.entries.contains_key(document_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &ActivityIndexEntry)> {
        self.entries.iter()
    }

    /// Documents whose `last_modified` is strictly before `cutoff_millis`.
    #[must_use]
    pub fn expired_before(&self, cutoff_millis: i64) -> Vec<DocumentId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.last_modified < cutoff_millis)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Oldest documents beyond `capacity`, oldest first.
    #[must_use]
    pub fn overflow(&self, capacity: usize) -> Vec<DocumentId> {
        let excess = self.entries.len().saturating_sub(capacity);
        if excess == 0 {
            return Vec::new();
        }
        let mut by_age: Vec<_> = self.entries.iter().collect();
        by_age.sort_by(|(a_id, a), (b_id, b)| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a_id.cmp(b_id))
        });
        by_age
            .into_iter()
            .take(excess)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    fn entry(last_modified: i64) -> ActivityIndexEntry {
        ActivityIndexEntry {
            last_modified,
            completion: 0,
            answered_count: 0,
        }
    }

    #[test]
    fn metrics_match_reference_scenario() {
        let mut state = ActivityState::default();
        state.student_answers.insert(0, "abc".into());
        state.student_answers.insert(1, String::new());
        state.ai_feedbacks.insert(0, AiFeedback::evaluated("alta"));

        let metrics = ActivityMetrics::from_state(&state);
        assert_eq!(metrics.total_questions, 2);
        assert_eq!(metrics.answered_count, 1);
        assert_eq!(metrics.feedback_count, 1);
        assert_eq!(metrics.completion_percentage, 50);
        assert_eq!(
            metrics.evaluation_distribution,
            BTreeMap::from([("alta".to_owned(), 1)])
        );
    }

    #[test]
    fn blank_answers_and_missing_results_are_classified() {
        let mut state = ActivityState::default();
        state.student_answers.insert(2, "   ".into());
        state.ai_feedbacks.insert(0, AiFeedback::default());
        state.ai_feedbacks.insert(1, AiFeedback::evaluated(""));
        state.current_index = 2;

        let metrics = ActivityMetrics::from_state(&state);
        assert_eq!(metrics.total_questions, 3);
        assert_eq!(metrics.answered_count, 0);
        assert_eq!(metrics.completion_percentage, 0);
        assert_eq!(metrics.evaluation_distribution.get(UNEVALUATED), Some(&2));
        assert_eq!(metrics.last_question_index, 2);
    }

    #[test]
    fn empty_state_has_zero_metrics() {
        let metrics = ActivityMetrics::from_state(&ActivityState::default());
        assert_eq!(metrics, ActivityMetrics::default());
    }

    #[test]
    fn completion_rounds_to_nearest() {
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        assert_eq!(percentage(3, 3), 100);
    }

    #[test]
    fn state_uses_snake_case_wire_shape() {
        let json = serde_json::json!({
            "student_answers": {"0": "abc", "1": ""},
            "ai_feedbacks": {"0": {"evaluacion": "alta", "comentario": "bien"}},
            "criterion_feedbacks": {},
            "current_index": 1
        });
        let state: ActivityState = serde_json::from_value(json).unwrap();
        assert_eq!(state.student_answers.get(&0).map(String::as_str), Some("abc"));
        let feedback = state.ai_feedbacks.get(&0).unwrap();
        assert_eq!(feedback.bucket(), "alta");
        assert_eq!(feedback.extra.get("comentario"), Some(&Value::from("bien")));
    }

    #[test]
    fn snapshot_capture_stamps_version_and_time() {
        let snapshot = ActivitySnapshot::capture(doc("d1"), ActivityState::default(), fixed_now());
        assert!(snapshot.is_current_version());
        assert_eq!(snapshot.last_modified, fixed_now().timestamp_millis());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["document_id"], "d1");
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn overflow_picks_oldest_first() {
        let mut index = ActivityIndex::new();
        for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
            index.upsert(doc(id), entry(100 - i64::try_from(i).unwrap()));
        }
        assert_eq!(index.overflow(2), vec![doc("d"), doc("c")]);
        assert!(index.overflow(4).is_empty());
    }

    #[test]
    fn expired_uses_strict_cutoff() {
        let mut index = ActivityIndex::new();
        index.upsert(doc("old"), entry(10));
        index.upsert(doc("edge"), entry(20));
        assert_eq!(index.expired_before(20), vec![doc("old")]);
    }

    #[test]
    fn index_serializes_as_plain_map() {
        let mut index = ActivityIndex::new();
        index.upsert(
            doc("d1"),
            ActivityIndexEntry {
                last_modified: 5,
                completion: 50,
                answered_count: 1,
            },
        );
        let json = serde_json::to_value(&index).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"d1": {"last_modified": 5, "completion": 50, "answered_count": 1}})
        );
    }
}
