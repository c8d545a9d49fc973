use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tutor_core::model::{ActiveSessionRecord, UserId};

use crate::repository::{KeyValueStore, SessionRegistryStore, StorageError};
use crate::watch::{RegistryFeed, RegistryWatch};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StorageError> {
    mutex
        .lock()
        .map_err(|_| StorageError::Connection("in-memory store poisoned".into()))
}

//
// ─── KEY-VALUE STORE ───────────────────────────────────────────────────────────
//

/// In-memory key-value store for tests and ephemeral per-context data.
///
/// Optionally enforces a byte quota over keys plus values and can be switched
/// off to simulate disabled storage.
#[derive(Clone, Debug)]
pub struct InMemoryKeyValueStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota_bytes: Option<usize>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyValueStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            quota_bytes: None,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// Toggle availability; every operation fails with `Unavailable` while off.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable)
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_available()?;
        Ok(lock(&self.entries)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut entries = lock(&self.entries)?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(StorageError::QuotaExceeded);
            }
        }
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.ensure_available()?;
        lock(&self.entries)?.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.ensure_available()?;
        Ok(lock(&self.entries)?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

//
// ─── SESSION REGISTRY ──────────────────────────────────────────────────────────
//

/// In-memory registry shared between simulated devices by cloning.
#[derive(Clone, Debug)]
pub struct InMemoryRegistry {
    records: Arc<Mutex<HashMap<UserId, ActiveSessionRecord>>>,
    feed: RegistryFeed,
    online: Arc<AtomicBool>,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            feed: RegistryFeed::new(),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle connectivity; every operation fails with `Connection` while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<(), StorageError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Connection("registry offline".into()))
        }
    }
}

#[async_trait]
impl SessionRegistryStore for InMemoryRegistry {
    async fn put_record(&self, record: &ActiveSessionRecord) -> Result<(), StorageError> {
        self.ensure_online()?;
        // Publish under the lock so watchers see writes in stored order.
        let mut records = lock(&self.records)?;
        records.insert(record.user_id.clone(), record.clone());
        self.feed.publish(&record.user_id, Some(record.clone()));
        Ok(())
    }

    async fn touch_activity(
        &self,
        user_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.ensure_online()?;
        let mut records = lock(&self.records)?;
        let record = records.get_mut(user_id).ok_or(StorageError::NotFound)?;
        record.last_activity = at;
        self.feed.publish(user_id, Some(record.clone()));
        Ok(())
    }

    async fn delete_record(&self, user_id: &UserId) -> Result<(), StorageError> {
        self.ensure_online()?;
        let mut records = lock(&self.records)?;
        if records.remove(user_id).is_some() {
            self.feed.publish(user_id, None);
        }
        Ok(())
    }

    async fn get_record(
        &self,
        user_id: &UserId,
    ) -> Result<Option<ActiveSessionRecord>, StorageError> {
        self.ensure_online()?;
        Ok(lock(&self.records)?.get(user_id).cloned())
    }

    async fn watch(&self, user_id: &UserId) -> Result<RegistryWatch, StorageError> {
        let rx = self.feed.subscribe();
        let initial = self.get_record(user_id).await?;
        Ok(RegistryWatch::new(user_id.clone(), initial, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tutor_core::model::{ClientMetadata, SessionToken};
    use tutor_core::time::fixed_now;

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    fn record(token: &str) -> ActiveSessionRecord {
        ActiveSessionRecord::new(
            user(),
            SessionToken::from_persisted(token).unwrap(),
            ClientMetadata::new("test-agent"),
            fixed_now(),
        )
    }

    #[tokio::test]
    async fn quota_rejects_oversized_writes() {
        let store = InMemoryKeyValueStore::with_quota(10);
        store.set("k", "12345").await.unwrap();
        let err = store.set("k2", "1234567").await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded));
        // Replacing an existing key only counts the new value.
        store.set("k", "123456789").await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryKeyValueStore::new();
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StorageError::Unavailable)));
        assert!(matches!(store.remove("k").await, Err(StorageError::Unavailable)));
    }

    #[tokio::test]
    async fn keys_filter_by_prefix() {
        let store = InMemoryKeyValueStore::new();
        store.set("a_1", "x").await.unwrap();
        store.set("b_1", "x").await.unwrap();
        store.set("a_2", "x").await.unwrap();
        assert_eq!(store.keys("a_").await.unwrap(), vec!["a_1", "a_2"]);
    }

    #[tokio::test]
    async fn touch_requires_existing_record() {
        let registry = InMemoryRegistry::new();
        let later = fixed_now() + chrono::Duration::seconds(30);
        assert!(matches!(
            registry.touch_activity(&user(), later).await,
            Err(StorageError::NotFound)
        ));

        registry.put_record(&record("session_1_a")).await.unwrap();
        registry.touch_activity(&user(), later).await.unwrap();
        let stored = registry.get_record(&user()).await.unwrap().unwrap();
        assert_eq!(stored.last_activity, later);
        assert_eq!(stored.created_at, fixed_now());
    }

    #[tokio::test]
    async fn watch_delivers_current_state_then_changes() {
        let registry = InMemoryRegistry::new();
        registry.put_record(&record("session_1_a")).await.unwrap();

        let mut watch = registry.watch(&user()).await.unwrap();
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.session_id.as_str(), "session_1_a");

        registry.put_record(&record("session_2_b")).await.unwrap();
        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(second.session_id.as_str(), "session_2_b");

        registry.delete_record(&user()).await.unwrap();
        assert!(watch.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_ignores_other_users() {
        let registry = InMemoryRegistry::new();
        let mut watch = registry.watch(&user()).await.unwrap();
        assert!(watch.next().await.unwrap().is_none());

        let other = ActiveSessionRecord::new(
            UserId::new("u2").unwrap(),
            SessionToken::from_persisted("session_9_z").unwrap(),
            ClientMetadata::default(),
            fixed_now(),
        );
        registry.put_record(&other).await.unwrap();
        registry.put_record(&record("session_1_a")).await.unwrap();

        let next = watch.next().await.unwrap().unwrap();
        assert_eq!(next.user_id, user());
    }

    #[tokio::test]
    async fn offline_registry_reports_connection_errors() {
        let registry = InMemoryRegistry::new();
        registry.set_online(false);
        assert!(matches!(
            registry.put_record(&record("session_1_a")).await,
            Err(StorageError::Connection(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_reach_watchers_in_stored_order() {
        let registry = InMemoryRegistry::new();
        let mut watch = registry.watch(&user()).await.unwrap();
        assert!(watch.next().await.unwrap().is_none());

        let writers: Vec<_> = (0..20)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .put_record(&record(&format!("session_{i}_w")))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let mut last = None;
        for _ in 0..20 {
            last = watch.next().await.unwrap();
        }
        let stored = registry.get_record(&user()).await.unwrap();
        assert_eq!(last, stored);
    }
}
