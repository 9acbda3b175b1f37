use crate::events::JobStatus;
use crate::types::{ExitCode, JobId, Timestamp};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("history record {0} not found")]
    NotFound(JobId),
    #[error("history backend: {0}")]
    Backend(String),
}

/// Final state of a run, as handed to the durable store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedRun {
    pub id: JobId,
    pub status: JobStatus,
    pub exit_code: ExitCode,
    /// All output lines joined with `\n`.
    pub output: String,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

/// The durable side of a job: the supervisor reports status transitions here.
///
/// Records are created by the caller before `JobSupervisor::start`, which is how
/// job ids are minted. Implementations may block; the supervisor calls them from
/// the blocking pool.
pub trait HistoryStore: Send + Sync + 'static {
    fn mark_started(&self, id: JobId, started_at: Timestamp) -> Result<(), StoreError>;
    fn mark_finished(&self, run: &FinishedRun) -> Result<(), StoreError>;
}
