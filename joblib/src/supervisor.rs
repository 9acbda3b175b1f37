use crate::config::SupervisorConfig;
use crate::error::{JobError, Result};
use crate::history::{FinishedRun, HistoryStore, StoreError};
use crate::job::Job;
use crate::types::{Argv, JobId};
use crate::worker::{self, Outcome};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, error, info};

/// Launches jobs, tracks the ones still running or recently finished, and
/// reports their outcome to the history store.
///
/// This struct is a handle and can be cloned freely; clones share one registry.
/// The registry lock only guards membership and is never held while waiting on
/// a process.
#[derive(Clone)]
pub struct JobSupervisor {
    inner: Arc<Shared>,
}

struct Shared {
    config: SupervisorConfig,
    store: Arc<dyn HistoryStore>,
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl Shared {
    fn jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_mut(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JobSupervisor {
    pub fn new(config: SupervisorConfig, store: Arc<dyn HistoryStore>) -> Self {
        Self {
            inner: Arc::new(Shared {
                config,
                store,
                jobs: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Register job `id` and launch the configured program with `argv` in the background.
    ///
    /// Returns as soon as the job is registered; it is visible through [`JobSupervisor::get`]
    /// in `running` status before this returns. The id must come from the history
    /// store's record. Must be called from within a tokio runtime.
    pub fn start(&self, id: JobId, argv: Argv) -> Result<Job> {
        let job = Job::new(id, self.inner.config.subscriber_capacity);
        {
            let mut jobs = self.inner.jobs_mut();
            if let Some(existing) = jobs.get(&id) {
                if !existing.status().is_terminal() {
                    return Err(JobError::AlreadyRunning(id));
                }
            }
            // a retained finished job with the same id is replaced
            jobs.insert(id, job.clone());
        }
        info!(job_id = id, program = %self.inner.config.program.display(), ?argv, "starting job");

        let supervisor = self.clone();
        let handle = job.clone();
        tokio::spawn(async move { supervisor.supervise(handle, argv).await });
        Ok(job)
    }

    async fn supervise(self, job: Job, argv: Argv) {
        let id = job.id();
        let started_at = job.started_at();
        self.persist(id, move |store| store.mark_started(id, started_at))
            .await;

        let Outcome { status, exit_code } = worker::run(&job, &self.inner.config, &argv).await;
        job.finish(status, exit_code);

        let snapshot = job.snapshot();
        info!(job_id = id, status = %snapshot.status, ?exit_code, "job finished");
        let run = FinishedRun {
            id,
            status: snapshot.status,
            exit_code: snapshot.exit_code,
            output: snapshot.output.join("\n"),
            started_at: snapshot.started_at,
            finished_at: snapshot.finished_at.unwrap_or_else(chrono::Utc::now),
        };
        self.persist(id, move |store| store.mark_finished(&run)).await;

        self.schedule_eviction(job);
    }

    /// Run a store operation on the blocking pool. Failures are logged, never propagated.
    async fn persist<F>(&self, id: JobId, op: F)
    where
        F: FnOnce(&dyn HistoryStore) -> std::result::Result<(), StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(job_id = id, error = %err, "failed to persist job state"),
            Err(err) => error!(job_id = id, error = %err, "history store task failed"),
        }
    }

    fn schedule_eviction(&self, job: Job) {
        let registry: Weak<Shared> = Arc::downgrade(&self.inner);
        let retention = self.inner.config.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let shared = match registry.upgrade() {
                Some(shared) => shared,
                None => return,
            };
            let mut jobs = shared.jobs_mut();
            let id = job.id();
            // the id may have been reused by a newer run in the meantime
            if jobs.get(&id).map_or(false, |current| current.same_job(&job)) {
                jobs.remove(&id);
                debug!(job_id = id, "evicted finished job");
            }
        });
    }

    /// The live job, if it is running or finished within the retention window.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.jobs().get(&id).cloned()
    }

    /// Ask a running job to stop. Does not wait for the process to exit.
    pub fn cancel(&self, id: JobId) -> Result<()> {
        let job = self.get(id).ok_or(JobError::NotFound(id))?;
        if !job.request_cancel() {
            return Err(JobError::NotRunning(id));
        }
        info!(job_id = id, "cancellation requested");
        Ok(())
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .jobs()
            .values()
            .filter(|job| !job.status().is_terminal())
            .count()
    }

    /// Every registered job, running or retained.
    pub fn jobs(&self) -> Vec<Job> {
        self.inner.jobs().values().cloned().collect()
    }

    /// Cancel every running job, returning how many were asked to stop.
    pub fn shutdown(&self) -> usize {
        let cancelled = self
            .jobs()
            .iter()
            .filter(|job| job.request_cancel())
            .count();
        if cancelled > 0 {
            info!(count = cancelled, "cancelled running jobs for shutdown");
        }
        cancelled
    }
}
