pub mod activity;
pub mod attempt;
pub mod change;
pub mod connection;
pub mod stats;
pub mod sync;
pub mod update;

pub use activity::{ActivityEvent, ActivityKind};
pub use attempt::{AnswerMap, AttemptState, CompletionStatus, SaveOutcome, ScoreSummary};
pub use change::{ChangeEvent, ChangeKind, IncomingChanges};
pub use connection::{ConnectionSession, ConnectionStats, OpenConnectionRequest};
pub use stats::{AttemptSyncStats, SyncStats};
pub use sync::{
    AutoSaveConfig, AutoSaveRequest, ConflictStrategy, Resolution, SyncConflict, SyncResult,
    SynchronizeRequest,
};
pub use update::UpdateEvent;
