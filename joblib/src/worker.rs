use crate::config::SupervisorConfig;
use crate::events::JobStatus;
use crate::job::Job;
use crate::types::ExitCode;

use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::select;
use tracing::{debug, warn};

/// How a run ended, before it is applied to the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Outcome {
    pub status: JobStatus,
    pub exit_code: ExitCode,
}

/// Run `config.program` with `argv` to completion, feeding every output line into `job`.
///
/// Returns once the process has exited (or failed to launch) and its output has
/// been drained. Cancellation of the job's token kills the process, or cuts the
/// drain short if the process already exited.
pub(crate) async fn run(job: &Job, config: &SupervisorConfig, argv: &[String]) -> Outcome {
    let mut command = Command::new(&config.program);
    command
        .args(argv)
        .current_dir(&config.work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(job_id = job.id(), program = %config.program.display(), error = %err, "failed to launch process");
            job.append(format!(
                "Error starting {}: {}",
                config.program.display(),
                err
            ));
            return Outcome {
                status: JobStatus::Failed,
                exit_code: None,
            };
        }
    };
    debug!(job_id = job.id(), pid = ?child.id(), "process spawned");

    // stdout and stderr are drained independently, so their lines interleave by arrival
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pipe_lines(stdout, job.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pipe_lines(stderr, job.clone())));
    }

    let token = job.cancel_token().clone();
    let waited = select! {
        exit_status = child.wait() => exit_status,
        _ = token.cancelled() => {
            debug!(job_id = job.id(), "cancellation requested, killing process");
            if let Err(err) = child.start_kill() {
                warn!(job_id = job.id(), error = %err, "failed to kill process");
            }
            child.wait().await
        }
    };
    // the process may have left a child (e.g. ssh) holding the pipes open
    let drain = tokio::time::timeout(config.drain_timeout, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    });
    let drained = if token.is_cancelled() {
        drain.await.is_ok()
    } else {
        select! {
            drained = drain => drained.is_ok(),
            _ = token.cancelled() => {
                debug!(job_id = job.id(), "cancelled while draining output");
                false
            }
        }
    };
    if !drained {
        if !token.is_cancelled() {
            warn!(job_id = job.id(), "output still open after process exit, abandoning readers");
        }
        for reader in &readers {
            reader.abort();
        }
    }

    // sampled after the drain: the job still reads as running until then
    let cancelled = token.is_cancelled();
    classify(job, cancelled, waited)
}

fn classify(job: &Job, cancelled: bool, waited: io::Result<ExitStatus>) -> Outcome {
    match waited {
        Ok(exit_status) if cancelled => Outcome {
            status: JobStatus::Cancelled,
            exit_code: exit_status.code(),
        },
        Err(_) if cancelled => Outcome {
            status: JobStatus::Cancelled,
            exit_code: None,
        },
        Ok(exit_status) if exit_status.success() => Outcome {
            status: JobStatus::Completed,
            exit_code: exit_status.code(),
        },
        Ok(exit_status) => Outcome {
            status: JobStatus::Failed,
            exit_code: exit_status.code(),
        },
        Err(err) => {
            warn!(job_id = job.id(), error = %err, "failed to wait for process");
            job.append(format!("Error waiting for process: {}", err));
            Outcome {
                status: JobStatus::Failed,
                exit_code: None,
            }
        }
    }
}

async fn pipe_lines<R: AsyncRead + Unpin>(stream: R, job: Job) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                job.append(decode_line(&buf));
            }
            Err(err) => {
                warn!(job_id = job.id(), error = %err, "error reading process output");
                break;
            }
        }
    }
}

/// Strip the line terminator; bytes that are not UTF-8 are replaced rather than ending the stream.
fn decode_line(buf: &[u8]) -> String {
    let line = buf.strip_suffix(b"\n").unwrap_or(buf);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
