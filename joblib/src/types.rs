/// Identifier shared between a live job and its durable history record.
pub type JobId = i64;
pub type Argv = Vec<String>;
/// `None` when the process was killed by a signal or never launched.
pub type ExitCode = Option<i32>;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
