#![forbid(unsafe_code)]

pub mod memory;
pub mod repository;
pub mod sqlite;
pub mod watch;

pub use memory::{InMemoryKeyValueStore, InMemoryRegistry};
pub use repository::{KeyValueStore, SessionRegistryStore, Storage, StorageError};
pub use watch::{RegistryEvent, RegistryWatch};
