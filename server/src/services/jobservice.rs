use crate::browse::{self, Listing};
use crate::error::ServiceError;
use crate::history::{HistoryRecord, NewRun, SqliteHistoryStore};
use crate::ssh_config;

use futures::Stream;
use joblib::types::{JobId, Timestamp};
use joblib::{FinishedRun, HistoryStore, Job, JobEvent, JobStatus, JobSupervisor, StoreError, Watch};
use protobuf::sync_jobs_server::SyncJobs;
use protobuf::watch_event::Event;
use protobuf::{
    BrowseReply, BrowseRequest, Empty, ExitCode, FileEntry, HistoryEntry, HistoryReply,
    HistoryRequest, JobDetail, JobDone, JobRef, RunRequest, SshHost, SshHostsReply, StatusReply,
    WatchEvent,
};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// Upper bound (and default) for history listings.
const MAX_HISTORY: usize = 100;
/// Events buffered between a job and one streaming client.
const WATCH_BUFFER: usize = 128;

type WatchSender = mpsc::Sender<Result<WatchEvent, Status>>;

pub struct SyncJobsService {
    supervisor: JobSupervisor,
    store: Arc<SqliteHistoryStore>,
    work_dir: PathBuf,
    rsync_path: Option<PathBuf>,
}

impl SyncJobsService {
    pub fn new(
        supervisor: JobSupervisor,
        store: Arc<SqliteHistoryStore>,
        work_dir: PathBuf,
        rsync_path: Option<PathBuf>,
    ) -> Self {
        Self {
            supervisor,
            store,
            work_dir,
            rsync_path,
        }
    }

    /// Run a history query on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce(&SqliteHistoryStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        Ok(result?)
    }

    /// Close out a record whose job could not be registered, so it does not stay pending.
    async fn mark_not_started(&self, id: JobId, reason: String) {
        let now = chrono::Utc::now();
        let run = FinishedRun {
            id,
            status: JobStatus::Failed,
            exit_code: None,
            output: reason,
            started_at: now,
            finished_at: now,
        };
        if let Err(err) = self.with_store(move |store| store.mark_finished(&run)).await {
            warn!(job_id = id, error = %err, "failed to record rejected run");
        }
    }

    /// A history row with the live job's status laid over it, when the job is still registered.
    fn entry_with_live_status(&self, record: HistoryRecord) -> HistoryEntry {
        let mut entry = history_entry(record);
        if let Some(job) = self.supervisor.get(entry.id) {
            entry.status = job.status().to_string();
        }
        entry
    }
}

fn format_ts(ts: Option<Timestamp>) -> String {
    ts.map(|ts| ts.to_rfc3339()).unwrap_or_default()
}

fn history_entry(record: HistoryRecord) -> HistoryEntry {
    HistoryEntry {
        id: record.id,
        source: record.source,
        destination: record.destination,
        options: record.options,
        full_command: record.full_command,
        status: record.status,
        exit_code: record.exit_code.map(|code| ExitCode { code }),
        output: record.output.unwrap_or_default(),
        created_at: format_ts(Some(record.created_at)),
        started_at: format_ts(record.started_at),
        completed_at: format_ts(record.completed_at),
    }
}

fn line_event(line: String) -> WatchEvent {
    WatchEvent {
        event: Some(Event::Line(line)),
    }
}

fn done_event(status: impl Into<String>) -> WatchEvent {
    WatchEvent {
        event: Some(Event::Done(JobDone {
            status: status.into(),
        })),
    }
}

/// Replay what the job has produced so far, follow it live, and finish with its final status.
async fn forward_live(job: Job, watch: Watch, tx: WatchSender) {
    for line in watch.output {
        if tx.send(Ok(line_event(line))).await.is_err() {
            return;
        }
    }

    let mut status = watch.status;
    if let Some(mut subscription) = watch.subscription {
        loop {
            match subscription.recv().await {
                Some(JobEvent::Output(line)) => {
                    if tx.send(Ok(line_event(line))).await.is_err() {
                        debug!(job_id = job.id(), "viewer went away");
                        job.unsubscribe(subscription.id());
                        return;
                    }
                }
                Some(JobEvent::Finished { status: last, .. }) => {
                    status = last;
                    break;
                }
                // closed without a marker: the viewer's buffer was full when the job finished
                None => {
                    status = job.status();
                    break;
                }
            }
        }
    }
    let _ = tx.send(Ok(done_event(status.as_str()))).await;
}

/// Send a finished run's stored output as one block, then its status.
async fn forward_stored(record: HistoryRecord, tx: WatchSender) {
    if let Some(output) = record.output.filter(|output| !output.is_empty()) {
        if tx.send(Ok(line_event(output))).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Ok(done_event(record.status))).await;
}

async fn rsync_version(rsync: &Path) -> String {
    match Command::new(rsync).arg("--version").output().await {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    }
}

fn browse_reply(listing: Listing) -> BrowseReply {
    BrowseReply {
        current_path: listing.current_path,
        full_path: listing.full_path.to_string_lossy().into_owned(),
        entries: listing
            .entries
            .into_iter()
            .map(|entry| FileEntry {
                name: entry.name,
                path: entry.path,
                is_dir: entry.is_dir,
                size: entry.size,
            })
            .collect(),
    }
}

#[tonic::async_trait]
impl SyncJobs for SyncJobsService {
    type WatchJobStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, Status>> + Send>>;

    async fn server_status(&self, _req: Request<Empty>) -> Result<Response<StatusReply>, Status> {
        let rsync_version = match &self.rsync_path {
            Some(rsync) => rsync_version(rsync).await,
            None => String::new(),
        };
        Ok(Response::new(StatusReply {
            rsync_available: self.rsync_path.is_some(),
            rsync_path: self
                .rsync_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_default(),
            rsync_version,
            work_dir: self.work_dir.to_string_lossy().into_owned(),
            running_jobs: self.supervisor.running_count() as u32,
        }))
    }

    async fn run(&self, req: Request<RunRequest>) -> Result<Response<HistoryEntry>, Status> {
        if self.rsync_path.is_none() {
            return Err(ServiceError::RsyncUnavailable.into());
        }
        let RunRequest {
            source,
            destination,
            options,
        } = req.into_inner();
        if source.trim().is_empty() || destination.trim().is_empty() {
            return Err(ServiceError::InvalidArgument(
                "source and destination are required".to_string(),
            )
            .into());
        }

        let run = NewRun {
            source,
            destination,
            options,
        };
        let argv = run.argv();
        let record = self.with_store(move |store| store.create(&run)).await?;
        info!(job_id = record.id, command = %record.full_command, "run requested");
        if let Err(err) = self.supervisor.start(record.id, argv) {
            self.mark_not_started(record.id, err.to_string()).await;
            return Err(ServiceError::from(err).into());
        }

        Ok(Response::new(self.entry_with_live_status(record)))
    }

    async fn cancel(&self, req: Request<JobRef>) -> Result<Response<Empty>, Status> {
        let id = req.into_inner().id;
        self.supervisor.cancel(id).map_err(ServiceError::from)?;
        Ok(Response::new(Empty {}))
    }

    async fn get_job(&self, req: Request<JobRef>) -> Result<Response<JobDetail>, Status> {
        let id = req.into_inner().id;
        let record = self.with_store(move |store| store.get(id)).await?;
        let mut entry = history_entry(record);
        let mut live_output = Vec::new();
        if let Some(job) = self.supervisor.get(id) {
            let snapshot = job.snapshot();
            entry.status = snapshot.status.to_string();
            live_output = snapshot.output;
        }
        Ok(Response::new(JobDetail {
            entry: Some(entry),
            live_output,
        }))
    }

    async fn history(
        &self,
        req: Request<HistoryRequest>,
    ) -> Result<Response<HistoryReply>, Status> {
        let limit = match req.into_inner().limit as usize {
            0 => MAX_HISTORY,
            limit => limit.min(MAX_HISTORY),
        };
        let records = self.with_store(move |store| store.list(limit)).await?;
        let entries = records
            .into_iter()
            .map(|record| self.entry_with_live_status(record))
            .collect();
        Ok(Response::new(HistoryReply { entries }))
    }

    async fn delete_history(&self, req: Request<JobRef>) -> Result<Response<Empty>, Status> {
        let id: JobId = req.into_inner().id;
        self.with_store(move |store| store.delete(id)).await?;
        Ok(Response::new(Empty {}))
    }

    async fn watch_job(
        &self,
        req: Request<JobRef>,
    ) -> Result<Response<Self::WatchJobStream>, Status> {
        let id = req.into_inner().id;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        match self.supervisor.get(id) {
            Some(job) => {
                let watch = job.watch();
                tokio::spawn(forward_live(job, watch, tx));
            }
            None => {
                let record = self.with_store(move |store| store.get(id)).await?;
                tokio::spawn(forward_stored(record, tx));
            }
        }

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream) as Self::WatchJobStream))
    }

    async fn browse(&self, req: Request<BrowseRequest>) -> Result<Response<BrowseReply>, Status> {
        let path = req.into_inner().path;
        let root = self.work_dir.clone();
        let listing = tokio::task::spawn_blocking(move || browse::browse(&root, &path))
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?
            .map_err(ServiceError::from)?;
        Ok(Response::new(browse_reply(listing)))
    }

    async fn ssh_hosts(&self, _req: Request<Empty>) -> Result<Response<SshHostsReply>, Status> {
        let hosts = tokio::task::spawn_blocking(ssh_config::load)
            .await
            .map_err(|err| ServiceError::Internal(err.to_string()))?;
        Ok(Response::new(SshHostsReply {
            hosts: hosts
                .into_iter()
                .map(|host| SshHost {
                    name: host.name,
                    hostname: host.hostname,
                    user: host.user,
                    port: host.port,
                })
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblib::SupervisorConfig;
    use tokio_stream::StreamExt;
    use tonic::Code;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteHistoryStore>,
        service: SyncJobsService,
    }

    fn fixture(rsync: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().canonicalize().unwrap();
        let store = Arc::new(SqliteHistoryStore::open(work_dir.join("history.db")).unwrap());
        let rsync_path = rsync.map(PathBuf::from);
        let program = rsync_path.clone().unwrap_or_else(|| PathBuf::from("rsync"));
        let supervisor = JobSupervisor::new(SupervisorConfig::new(program, &work_dir), store.clone());
        let service = SyncJobsService::new(supervisor, store.clone(), work_dir, rsync_path);
        Fixture {
            _dir: dir,
            store,
            service,
        }
    }

    fn run_request(options: &[&str]) -> Request<RunRequest> {
        Request::new(RunRequest {
            source: "from".into(),
            destination: "to".into(),
            options: options.iter().map(|o| o.to_string()).collect(),
        })
    }

    async fn collect_watch(service: &SyncJobsService, id: JobId) -> Vec<WatchEvent> {
        let mut stream = service
            .watch_job(Request::new(JobRef { id }))
            .await
            .expect("watch response")
            .into_inner();
        let mut events = vec![];
        while let Some(event) = stream.next().await {
            events.push(event.expect("watch event"));
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_then_watch_streams_output_and_final_status() {
        let fx = fixture(Some("echo"));
        let entry = fx
            .service
            .run(run_request(&["-av"]))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(entry.full_command, "rsync -av from to");

        let events = collect_watch(&fx.service, entry.id).await;
        assert_eq!(
            events,
            vec![line_event("-av from to".into()), done_event("completed")]
        );

        // once persisted, the history row carries the real exit code
        for _ in 0..200 {
            if fx.store.get(entry.id).unwrap().completed_at.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let detail = fx
            .service
            .get_job(Request::new(JobRef { id: entry.id }))
            .await
            .unwrap()
            .into_inner();
        let stored = detail.entry.unwrap();
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.exit_code, Some(ExitCode { code: 0 }));
        assert_eq!(stored.output, "-av from to");
        assert_eq!(detail.live_output, vec!["-av from to".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watch_falls_back_to_stored_record() {
        let fx = fixture(Some("echo"));
        let record = fx
            .store
            .create(&NewRun {
                source: "a".into(),
                destination: "b".into(),
                options: vec![],
            })
            .unwrap();
        let now = chrono::Utc::now();
        fx.store
            .mark_finished(&FinishedRun {
                id: record.id,
                status: JobStatus::Failed,
                exit_code: Some(1),
                output: "line one\nline two".into(),
                started_at: now,
                finished_at: now,
            })
            .unwrap();

        let events = collect_watch(&fx.service, record.id).await;
        assert_eq!(
            events,
            vec![line_event("line one\nline two".into()), done_event("failed")]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_ids_are_not_found() {
        let fx = fixture(Some("echo"));
        let status = fx
            .service
            .cancel(Request::new(JobRef { id: 99 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);

        let status = fx
            .service
            .watch_job(Request::new(JobRef { id: 99 }))
            .await
            .err()
            .expect("watching an unknown id must fail");
        assert_eq!(status.code(), Code::NotFound);

        let status = fx
            .service
            .get_job(Request::new(JobRef { id: 99 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn run_requires_rsync_and_paths() {
        let fx = fixture(None);
        let status = fx.service.run(run_request(&[])).await.unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        let fx = fixture(Some("echo"));
        let status = fx
            .service
            .run(Request::new(RunRequest {
                source: " ".into(),
                destination: "to".into(),
                options: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_and_history_reflect_live_status() {
        let fx = fixture(Some("sleep"));
        let entry = fx
            .service
            .run(Request::new(RunRequest {
                source: "30".into(),
                destination: "30".into(),
                options: vec![],
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(entry.status, "running");

        let status = fx
            .service
            .server_status(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(status.rsync_available);
        assert_eq!(status.running_jobs, 1);

        fx.service
            .cancel(Request::new(JobRef { id: entry.id }))
            .await
            .unwrap();
        let events = collect_watch(&fx.service, entry.id).await;
        assert_eq!(events.last(), Some(&done_event("cancelled")));

        let history = fx
            .service
            .history(Request::new(HistoryRequest { limit: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(history.entries.len(), 1);
        assert_eq!(history.entries[0].status, "cancelled");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn browse_rejects_escape() {
        let fx = fixture(Some("echo"));
        let status = fx
            .service
            .browse(Request::new(BrowseRequest {
                path: "../..".into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let reply = fx
            .service
            .browse(Request::new(BrowseRequest { path: "".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(reply.entries.iter().any(|entry| entry.name == "history.db"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_viewer_still_gets_final_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteHistoryStore::open(dir.path().join("history.db")).unwrap());
        let config = SupervisorConfig::new("sh", dir.path()).with_subscriber_capacity(1);
        let supervisor = JobSupervisor::new(config, store.clone());
        let id = store
            .create(&NewRun {
                source: "x".into(),
                destination: "y".into(),
                options: vec![],
            })
            .unwrap()
            .id;
        let job = supervisor
            .start(
                id,
                vec![
                    "-c".into(),
                    "sleep 0.2; for i in 1 2 3 4 5 6; do echo $i; done".into(),
                ],
            )
            .unwrap();

        // nothing reads the client side until the job is over, so the viewer's queue fills up
        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(forward_live(job.clone(), job.watch(), tx));
        for _ in 0..500 {
            if job.status().is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(job.status(), JobStatus::Completed);

        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event.expect("watch event"));
        }
        assert!(events.len() <= 4, "some lines must have been missed: {:?}", events);
        assert_eq!(events.last(), Some(&done_event("completed")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_start_does_not_leave_record_pending() {
        let fx = fixture(Some("sleep"));
        let last = fx
            .store
            .create(&NewRun {
                source: "1".into(),
                destination: "1".into(),
                options: vec![],
            })
            .unwrap();
        // occupy the id the next insert will receive
        let next_id = last.id + 1;
        fx.service
            .supervisor
            .start(next_id, vec!["30".into()])
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = fx
            .service
            .run(Request::new(RunRequest {
                source: "30".into(),
                destination: "30".into(),
                options: vec![],
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::AlreadyExists);

        let record = fx.store.get(next_id).unwrap();
        assert_eq!(record.status, "failed");
        assert!(record.completed_at.is_some());
        fx.service.supervisor.cancel(next_id).unwrap();
    }
}
