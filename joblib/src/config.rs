use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings shared by every job a `JobSupervisor` launches.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// The program every job runs, e.g. the resolved `rsync` binary.
    pub program: PathBuf,
    /// Working directory of every spawned process.
    pub work_dir: PathBuf,
    /// How long a finished job stays in the registry for late subscribers.
    pub retention: Duration,
    /// Pending lines a single subscriber may buffer before it starts missing output.
    pub subscriber_capacity: usize,
    /// Upper bound on waiting for the output readers once the process has exited.
    pub drain_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            work_dir: work_dir.into(),
            retention: DEFAULT_RETENTION,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Zero is treated as one.
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}
