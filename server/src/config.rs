use clap::Parser;
use joblib::SupervisorConfig;
use std::env;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Run rsync jobs and stream their output over gRPC
#[derive(Debug, Parser)]
#[clap(name = "syncweb-server")]
pub struct ServerConfig {
    /// Address to listen on
    #[clap(long, env = "SYNCWEB_LISTEN", default_value = "127.0.0.1:50051")]
    pub listen: SocketAddr,

    /// Working directory for rsync and root for browsing (default: current directory)
    #[clap(long, env = "SYNCWEB_DIR", parse(from_os_str))]
    pub dir: Option<PathBuf>,

    /// SQLite database holding the run history
    #[clap(long, env = "SYNCWEB_DB", default_value = "rsync-web.db", parse(from_os_str))]
    pub db: PathBuf,

    /// rsync binary to run (default: `rsync` on PATH)
    #[clap(long, env = "SYNCWEB_RSYNC", parse(from_os_str))]
    pub rsync: Option<PathBuf>,

    /// Seconds a finished job stays available for live viewers
    #[clap(long, default_value = "300")]
    pub retention_secs: u64,

    /// Output lines buffered per live viewer before it starts missing lines
    #[clap(long, default_value = "100")]
    pub subscriber_capacity: usize,

    /// PEM certificate for TLS (requires --tls-key)
    #[clap(long, parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS (requires --tls-cert)
    #[clap(long, parse(from_os_str))]
    pub tls_key: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("--tls-cert and --tls-key must be given together")]
    IncompleteTls,
    #[error("working directory {path}: {source}")]
    WorkDir { path: PathBuf, source: io::Error },
}

impl ServerConfig {
    /// The absolute, symlink-free working directory.
    pub fn work_dir(&self) -> Result<PathBuf, ConfigError> {
        let dir = match &self.dir {
            Some(dir) => dir.clone(),
            None => env::current_dir().map_err(|source| ConfigError::WorkDir {
                path: PathBuf::from("."),
                source,
            })?,
        };
        dir.canonicalize()
            .map_err(|source| ConfigError::WorkDir { path: dir, source })
    }

    /// The rsync binary, if one is configured or can be found on `PATH`.
    pub fn rsync_path(&self) -> Option<PathBuf> {
        self.rsync.clone().or_else(|| find_in_path("rsync"))
    }

    pub fn tls_files(&self) -> Result<Option<(&Path, &Path)>, ConfigError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_path(), key.as_path()))),
            (None, None) => Ok(None),
            _ => Err(ConfigError::IncompleteTls),
        }
    }

    pub fn supervisor_config(&self, rsync: Option<&Path>, work_dir: &Path) -> SupervisorConfig {
        // without rsync the service refuses runs, so the program is never spawned
        let program = rsync.map_or_else(|| PathBuf::from("rsync"), Path::to_path_buf);
        SupervisorConfig::new(program, work_dir)
            .with_retention(Duration::from_secs(self.retention_secs))
            .with_subscriber_capacity(self.subscriber_capacity)
    }
}

/// Look `name` up on `PATH` the way a shell would.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn defaults() {
        let config = ServerConfig::try_parse_from(["syncweb-server"]).unwrap();
        assert_eq!(
            config.listen,
            "127.0.0.1:50051".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.db, PathBuf::from("rsync-web.db"));
        assert_eq!(config.retention_secs, 300);
        assert_eq!(config.subscriber_capacity, 100);
        assert!(config.tls_files().unwrap().is_none());
    }

    #[test]
    fn supervisor_settings_follow_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::try_parse_from([
            "syncweb-server",
            "--rsync",
            "/opt/bin/rsync",
            "--retention-secs",
            "7",
            "--subscriber-capacity",
            "3",
        ])
        .unwrap();
        let rsync = config.rsync_path().unwrap();
        assert_eq!(rsync, PathBuf::from("/opt/bin/rsync"));

        let supervisor = config.supervisor_config(Some(&rsync), dir.path());
        assert_eq!(supervisor.program, PathBuf::from("/opt/bin/rsync"));
        assert_eq!(supervisor.work_dir, dir.path());
        assert_eq!(supervisor.retention, Duration::from_secs(7));
        assert_eq!(supervisor.subscriber_capacity, 3);
    }

    #[test]
    fn tls_needs_both_files() {
        let config =
            ServerConfig::try_parse_from(["syncweb-server", "--tls-cert", "server.pem"]).unwrap();
        assert!(matches!(config.tls_files(), Err(ConfigError::IncompleteTls)));
    }

    #[test]
    fn work_dir_is_canonical() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let config = ServerConfig::try_parse_from(vec![
            OsString::from("syncweb-server"),
            OsString::from("--dir"),
            nested.join("..").join("a").into_os_string(),
        ])
        .unwrap();
        assert_eq!(config.work_dir().unwrap(), nested.canonicalize().unwrap());
    }

    #[test]
    fn finds_sh_on_path() {
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-name").is_none());
    }
}
