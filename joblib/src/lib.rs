mod broadcaster;
pub mod config;
pub mod error;
mod events;
pub mod history;
mod job;
mod supervisor;
pub mod types;
mod worker;

pub use broadcaster::SubscriberId;
pub use config::SupervisorConfig;
pub use events::{JobEvent, JobStatus, ParseStatusError};
pub use history::{FinishedRun, HistoryStore, StoreError};
pub use job::{Job, JobSnapshot, Subscription, Watch};
pub use supervisor::JobSupervisor;


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn basic() {
        let store = Arc::new(test_support::RecordingStore::default());
        let supervisor = JobSupervisor::new(SupervisorConfig::new("echo", "/tmp"), store);
        let echo_str = "hello world!";
        let job = supervisor
            .start(1, vec![echo_str.to_string()])
            .expect("job start err");

        let Watch {
            mut output,
            subscription,
            ..
        } = job.watch();
        if let Some(mut subscription) = subscription {
            while let Some(event) = subscription.recv().await {
                match event {
                    JobEvent::Output(line) => output.push(line),
                    JobEvent::Finished { status, exit_code } => {
                        assert_eq!(status, JobStatus::Completed);
                        assert_eq!(exit_code, Some(0));
                    }
                }
            }
        }
        assert_eq!(output, vec![echo_str.to_string()]);
        assert_eq!(job.status(), JobStatus::Completed);
    }
}
