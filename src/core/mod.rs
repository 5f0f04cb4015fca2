pub mod abort;
pub mod directory;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod restore;
pub mod transfer_engine;

pub use abort::{AbortOutcome, abort};
pub use directory::{AccountDirectory, DirectorySnapshot, SnapshotMode};
pub use models::{
    AccountStatus, BackupTarget, ContentType, DirectoryBackupStatus, ResolvePolicy, Session,
    SessionStatus,
};
pub use orchestrator::{BackupOrchestrator, BackupPlan, BackupRequest};
pub use progress::{ProgressSink, ThrottledProgress};
pub use restore::{RestoreOrchestrator, RestorePlan, RestoreRequest};
pub use transfer_engine::{Endpoint, TimeRange, TransferTarget};
