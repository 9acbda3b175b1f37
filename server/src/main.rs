mod browse;
mod config;
mod error;
mod history;
mod logging;
mod services;
mod shutdown;
mod ssh_config;

use clap::Parser;
use config::ServerConfig;
use history::SqliteHistoryStore;
use joblib::JobSupervisor;
use protobuf::sync_jobs_server::SyncJobsServer;
use services::jobservice::SyncJobsService;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

/// How long shutdown waits for cancelled jobs to record their final state.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_tracing();
    let config = ServerConfig::parse();
    let shutdown = shutdown::install_shutdown_handler()?;
    serve(config, shutdown).await
}

async fn serve(
    config: ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let work_dir = config.work_dir()?;
    let rsync_path = config.rsync_path();
    if rsync_path.is_none() {
        warn!("rsync not found, run requests will be refused");
    }

    let store = Arc::new(SqliteHistoryStore::open(&config.db)?);
    let supervisor = JobSupervisor::new(
        config.supervisor_config(rsync_path.as_deref(), &work_dir),
        store.clone(),
    );
    let job_service =
        SyncJobsService::new(supervisor.clone(), store, work_dir.clone(), rsync_path.clone());

    let mut builder = Server::builder();
    if let Some((cert, key)) = config.tls_files()? {
        let cert = tokio::fs::read(cert).await?;
        let key = tokio::fs::read(key).await?;
        builder = builder.tls_config(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))?;
    }

    info!(
        addr = %config.listen,
        workdir = %work_dir.display(),
        rsync = ?rsync_path,
        "starting rsync job server"
    );
    builder
        .add_service(SyncJobsServer::new(job_service))
        .serve_with_shutdown(config.listen, shutdown.cancelled())
        .await?;

    supervisor.shutdown();
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while supervisor.running_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!("server stopped");
    Ok(())
}
