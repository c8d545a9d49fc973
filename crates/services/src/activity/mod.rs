//! Local persistence of in-progress exercise state.
//!
//! `ActivityPersistence` owns the snapshot and index records in the local
//! mirror store, `ActivityTracker` decides when to write them for the
//! document currently open, and `AutosaveTask` drives the timers.

mod autosave;
mod persistence;
mod retention;
mod tracker;

pub use autosave::AutosaveTask;
pub use persistence::ActivityPersistence;
pub use retention::PruneReport;
pub use tracker::ActivityTracker;
