use crate::broadcaster::{Broadcaster, SubscriberId};
use crate::events::{JobEvent, JobStatus};
use crate::types::{ExitCode, JobId, Timestamp};

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The live state of one external-process run.
///
/// This is a handle: clones share the same job. All mutation goes through the
/// job's own lock, which is never held across an await point.
#[derive(Clone, Debug)]
pub struct Job {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    id: JobId,
    subscriber_capacity: usize,
    cancel: CancellationToken,
    state: RwLock<State>,
}

#[derive(Debug)]
struct State {
    status: JobStatus,
    output: Vec<String>,
    exit_code: ExitCode,
    started_at: Timestamp,
    finished_at: Option<Timestamp>,
    broadcaster: Broadcaster,
}

/// Point-in-time copy of a job, taken under its shared lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub output: Vec<String>,
    pub exit_code: ExitCode,
    pub started_at: Timestamp,
    pub finished_at: Option<Timestamp>,
}

/// A live viewer's end of the job's output stream.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<JobEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// `None` once the job has finished and every pending event was received.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

/// Result of [`Job::watch`]: the history so far plus, while the job still runs,
/// a subscription that picks up exactly where `output` ends.
#[derive(Debug)]
pub struct Watch {
    pub output: Vec<String>,
    pub status: JobStatus,
    pub exit_code: ExitCode,
    pub subscription: Option<Subscription>,
}

impl Job {
    pub(crate) fn new(id: JobId, subscriber_capacity: usize) -> Self {
        let state = State {
            status: JobStatus::Running,
            output: Vec::new(),
            exit_code: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
            broadcaster: Broadcaster::new(),
        };
        Self {
            inner: Arc::new(Inner {
                id,
                subscriber_capacity,
                cancel: CancellationToken::new(),
                state: RwLock::new(state),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn status(&self) -> JobStatus {
        self.read().status
    }

    pub fn exit_code(&self) -> ExitCode {
        self.read().exit_code
    }

    pub fn started_at(&self) -> Timestamp {
        self.read().started_at
    }

    pub fn output(&self) -> Vec<String> {
        self.read().output.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.read();
        JobSnapshot {
            id: self.inner.id,
            status: state.status,
            output: state.output.clone(),
            exit_code: state.exit_code,
            started_at: state.started_at,
            finished_at: state.finished_at,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Arm the cancellation signal unless the job already finished.
    ///
    /// Runs under the job's lock, so a request that returns `true` is always
    /// seen by [`Job::finish`].
    pub(crate) fn request_cancel(&self) -> bool {
        let state = self.write();
        if state.status.is_terminal() {
            return false;
        }
        self.inner.cancel.cancel();
        true
    }

    pub(crate) fn same_job(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to lines appended from now on.
    ///
    /// Use [`Job::watch`] when the lines produced so far are needed too.
    /// Subscribing to a finished job yields an already-closed subscription.
    pub fn subscribe(&self) -> Subscription {
        let mut state = self.write();
        self.subscribe_locked(&mut state)
    }

    fn subscribe_locked(&self, state: &mut State) -> Subscription {
        let (id, rx) = state.broadcaster.add(self.inner.subscriber_capacity);
        if state.status.is_terminal() {
            // drops the sender, so the receiver reads end-of-stream
            state.broadcaster.remove(id);
        }
        Subscription { id, rx }
    }

    /// Safe to call repeatedly and after the job has finished.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.write().broadcaster.remove(id);
    }

    /// Replay-then-subscribe under a single lock, so no line is missed or seen twice.
    pub fn watch(&self) -> Watch {
        let mut state = self.write();
        let subscription = if state.status.is_terminal() {
            None
        } else {
            Some(self.subscribe_locked(&mut state))
        };
        Watch {
            output: state.output.clone(),
            status: state.status,
            exit_code: state.exit_code,
            subscription,
        }
    }

    /// Record a line and offer it to every subscriber. Lines arriving after the
    /// job finished are discarded and `false` is returned.
    pub(crate) fn append(&self, line: String) -> bool {
        let mut state = self.write();
        if state.status.is_terminal() {
            return false;
        }
        state.broadcaster.broadcast(&JobEvent::Output(line.clone()));
        state.output.push(line);
        true
    }

    /// Move to a terminal status and close every subscriber. Only the first call has any effect.
    ///
    /// A job whose cancellation was requested always ends `cancelled`.
    pub(crate) fn finish(&self, status: JobStatus, exit_code: ExitCode) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.write();
        if state.status.is_terminal() {
            return false;
        }
        let status = if self.inner.cancel.is_cancelled() {
            JobStatus::Cancelled
        } else {
            status
        };
        state.status = status;
        state.exit_code = exit_code;
        state.finished_at = Some(chrono::Utc::now());
        state
            .broadcaster
            .close(JobEvent::Finished { status, exit_code });
        true
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.read().broadcaster.len()
    }
}
