use thiserror::Error;

/// Failure kinds surfaced by the backup and restore runs.
///
/// These travel inside `anyhow::Error`; callers that need to branch on the
/// kind use `err.downcast_ref::<Error>()`.
#[derive(Debug, Error)]
pub enum Error {
    /// Another orchestrator holds the process lock and is still alive.
    #[error("another process is running: {pid}")]
    Locking { pid: i32 },

    #[error("backup error: {0}")]
    Backup(String),

    #[error("restore error: {0}")]
    Restore(String),

    #[error("directory query failed: {0}")]
    DirectoryQuery(String),

    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The hosting environment does not satisfy a run precondition.
    #[error("precondition failed: {0}")]
    Precondition(String),
}

impl Error {
    /// Returns the domain error carried by an `anyhow::Error`, if any.
    pub fn kind_of(err: &anyhow::Error) -> Option<&Error> {
        err.downcast_ref::<Error>()
    }
}
