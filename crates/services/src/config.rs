use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Timing for the active-session heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Defaults overridden by `TUTOR_HEARTBEAT_SECS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, "TUTOR_HEARTBEAT_SECS").filter(|s| *s > 0) {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        config
    }
}

/// Storage keys, retention bounds and autosave timing for activity snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Prefix for snapshot keys; the index lives at `<prefix>index`.
    pub key_prefix: String,
    /// Maximum number of tracked documents.
    pub capacity: usize,
    pub max_age: chrono::Duration,
    pub debounce: Duration,
    pub periodic_save: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: "activity_progress_".to_owned(),
            capacity: 15,
            max_age: chrono::Duration::days(30),
            debounce: Duration::from_secs(3),
            periodic_save: Duration::from_secs(30),
        }
    }
}

impl PersistenceConfig {
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_periodic_save(mut self, every: Duration) -> Self {
        self.periodic_save = every;
        self
    }

    /// Defaults overridden by `TUTOR_RETENTION_CAPACITY`, `TUTOR_RETENTION_DAYS`,
    /// `TUTOR_DEBOUNCE_MS` and `TUTOR_PERIODIC_SAVE_SECS`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(capacity) = parse_var::<usize>(&lookup, "TUTOR_RETENTION_CAPACITY") {
            config.capacity = capacity;
        }
        if let Some(days) = parse_var::<i64>(&lookup, "TUTOR_RETENTION_DAYS").filter(|d| *d > 0) {
            config.max_age = chrono::Duration::days(days);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "TUTOR_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TUTOR_PERIODIC_SAVE_SECS").filter(|s| *s > 0)
        {
            config.periodic_save = Duration::from_secs(secs);
        }
        config
    }

    #[must_use]
    pub fn index_key(&self) -> String {
        format!("{}index", self.key_prefix)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}
