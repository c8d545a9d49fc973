#![forbid(unsafe_code)]

pub mod activity;
pub mod app_services;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod lifecycle;
pub mod registry;

pub use tutor_core::Clock;

pub use activity::{ActivityPersistence, ActivityTracker, AutosaveTask, PruneReport};
pub use app_services::AppServices;
pub use config::{PersistenceConfig, SessionConfig};
pub use error::{AppServicesError, LifecycleError};
pub use heartbeat::HeartbeatHandle;
pub use identity::SessionIdentity;
pub use lifecycle::SessionLifecycle;
pub use registry::{ActiveSessionService, ConflictSubscription};
