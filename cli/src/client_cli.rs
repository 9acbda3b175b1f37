use protobuf::{
    sync_jobs_client::SyncJobsClient, watch_event::Event, BrowseRequest, Empty, HistoryEntry,
    HistoryRequest, JobRef, RunRequest, WatchEvent,
};
use std::error;
use std::path::Path;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::Status;

type JobId = i64;

pub struct ClientCli {
    inner: SyncJobsClient<Channel>,
}

fn print_entry(entry: &HistoryEntry) {
    let exit_code = entry
        .exit_code
        .as_ref()
        .map(|exit| exit.code.to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:>5}  {:<10} exit {:<3} {}  {}",
        entry.id, entry.status, exit_code, entry.created_at, entry.full_command
    );
}

impl ClientCli {
    pub async fn connect(
        server_addr: &str,
        ca_cert: Option<&Path>,
        domain: &str,
    ) -> Result<Self, Box<dyn error::Error>> {
        let mut endpoint = Channel::from_shared(server_addr.to_string())?;
        if let Some(ca_cert) = ca_cert {
            let ca_cert = tokio::fs::read(ca_cert).await?;
            let tls = ClientTlsConfig::new()
                .domain_name(domain)
                .ca_certificate(Certificate::from_pem(ca_cert));
            endpoint = endpoint.tls_config(tls)?;
        }
        let channel = endpoint.connect().await?;
        Ok(Self {
            inner: SyncJobsClient::new(channel),
        })
    }

    pub async fn status(&mut self) -> Result<(), Status> {
        let status = self.inner.server_status(Empty {}).await?.into_inner();
        if status.rsync_available {
            println!("rsync:        {} ({})", status.rsync_path, status.rsync_version);
        } else {
            println!("rsync:        not available");
        }
        println!("work dir:     {}", status.work_dir);
        println!("running jobs: {}", status.running_jobs);
        Ok(())
    }

    pub async fn run(
        &mut self,
        source: String,
        destination: String,
        options: Vec<String>,
    ) -> Result<JobId, Status> {
        let entry = self
            .inner
            .run(RunRequest {
                source,
                destination,
                options,
            })
            .await?
            .into_inner();
        println!("Started job id: {}", entry.id);
        Ok(entry.id)
    }

    pub async fn cancel(&mut self, id: JobId) -> Result<(), Status> {
        self.inner.cancel(JobRef { id }).await?;
        println!("Cancelled job id: {}", id);
        Ok(())
    }

    /// Stream the job's output; returns the final status.
    pub async fn watch(&mut self, id: JobId) -> Result<String, Status> {
        let mut stream = self.inner.watch_job(JobRef { id }).await?.into_inner();
        let mut status = String::new();
        while let Some(WatchEvent { event }) = stream.message().await? {
            match event {
                Some(Event::Line(line)) => println!("{}", line),
                Some(Event::Done(done)) => status = done.status,
                None => {}
            }
        }
        println!("Job {} {}", id, status);
        Ok(status)
    }

    pub async fn show(&mut self, id: JobId) -> Result<(), Status> {
        let detail = self.inner.get_job(JobRef { id }).await?.into_inner();
        let entry = detail
            .entry
            .ok_or_else(|| Status::internal("server responded with empty history entry"))?;
        print_entry(&entry);
        println!("started:   {}", entry.started_at);
        println!("completed: {}", entry.completed_at);
        if detail.live_output.is_empty() {
            println!("{}", entry.output);
        } else {
            for line in &detail.live_output {
                println!("{}", line);
            }
        }
        Ok(())
    }

    pub async fn history(&mut self, limit: u32) -> Result<(), Status> {
        let history = self
            .inner
            .history(HistoryRequest { limit })
            .await?
            .into_inner();
        for entry in &history.entries {
            print_entry(entry);
        }
        Ok(())
    }

    pub async fn delete(&mut self, id: JobId) -> Result<(), Status> {
        self.inner.delete_history(JobRef { id }).await?;
        println!("Deleted history record {}", id);
        Ok(())
    }

    pub async fn browse(&mut self, path: String) -> Result<(), Status> {
        let listing = self
            .inner
            .browse(BrowseRequest { path })
            .await?
            .into_inner();
        println!("{}", listing.full_path);
        for entry in &listing.entries {
            let marker = if entry.is_dir { "/" } else { "" };
            println!("{:>12}  {}{}", entry.size, entry.name, marker);
        }
        Ok(())
    }

    pub async fn ssh_hosts(&mut self) -> Result<(), Status> {
        let hosts = self.inner.ssh_hosts(Empty {}).await?.into_inner().hosts;
        for host in &hosts {
            let user = if host.user.is_empty() {
                String::new()
            } else {
                format!("{}@", host.user)
            };
            let port = if host.port.is_empty() {
                String::new()
            } else {
                format!(":{}", host.port)
            };
            let hostname = if host.hostname.is_empty() {
                &host.name
            } else {
                &host.hostname
            };
            println!("{:<20} {}{}{}", host.name, user, hostname, port);
        }
        Ok(())
    }
}
