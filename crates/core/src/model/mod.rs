mod activity;
mod ids;
mod session;

pub use activity::{
    ActivityIndex, ActivityIndexEntry, ActivityMetrics, ActivitySnapshot, ActivityState,
    AiFeedback, SNAPSHOT_VERSION, UNEVALUATED,
};
pub use ids::{DocumentId, IdError, SessionToken, UserId};
pub use session::{ActiveSessionRecord, ClientMetadata, SessionPhase, SessionPhaseError};
