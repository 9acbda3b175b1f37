use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Start, watch and cancel rsync jobs on a sync server
#[derive(Debug, Parser)]
#[clap(name = "syncweb")]
pub struct ArgParser {
    /// The address of the server
    #[clap(
        short = 's',
        long = "server",
        env = "SYNCWEB_SERVER",
        default_value = "http://127.0.0.1:50051"
    )]
    pub server: String,
    /// CA certificate (PEM) to verify a TLS server with
    #[clap(long, parse(from_os_str))]
    pub ca_cert: Option<PathBuf>,
    /// Domain name expected in the server certificate
    #[clap(long, default_value = "localhost")]
    pub domain: String,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Subcommand)]
pub enum SubCommand {
    /// show server and rsync status
    Status,
    /// start a new rsync run
    Run {
        #[clap(long)]
        /// what to copy
        source: String,

        #[clap(long = "dest")]
        /// where to copy it
        destination: String,

        #[clap(long = "option", allow_hyphen_values = true)]
        /// an rsync option, may be repeated (e.g. --option=-av)
        options: Vec<String>,

        #[clap(long)]
        /// follow the output until the run finishes
        watch: bool,
    },
    /// cancel a running job
    Cancel {
        /// job id
        job_id: i64,
    },
    /// stream a job's output until it finishes
    Watch {
        /// job id
        job_id: i64,
    },
    /// show one history record
    Show {
        /// job id
        job_id: i64,
    },
    /// list recent runs
    History {
        #[clap(long, default_value = "20")]
        /// how many runs to list
        limit: u32,
    },
    /// delete a history record
    Delete {
        /// job id
        job_id: i64,
    },
    /// list a directory under the server's working directory
    Browse {
        /// path relative to the working directory
        #[clap(default_value = ".")]
        path: String,
    },
    /// list hosts from the server's ssh config
    SshHosts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_repeated_options() {
        let args = ArgParser::try_parse_from([
            "syncweb",
            "run",
            "--source",
            "/data",
            "--dest",
            "backup:/data",
            "--option=-av",
            "--option",
            "--delete",
            "--watch",
        ])
        .unwrap();
        assert_eq!(args.server, "http://127.0.0.1:50051");
        assert_eq!(
            args.sub_command,
            SubCommand::Run {
                source: "/data".into(),
                destination: "backup:/data".into(),
                options: vec!["-av".into(), "--delete".into()],
                watch: true,
            }
        );
    }

    #[test]
    fn job_ids_must_be_numbers() {
        assert!(ArgParser::try_parse_from(["syncweb", "cancel", "abc"]).is_err());
        let args = ArgParser::try_parse_from(["syncweb", "-s", "http://h:1", "watch", "7"]).unwrap();
        assert_eq!(args.server, "http://h:1");
        assert_eq!(args.sub_command, SubCommand::Watch { job_id: 7 });
    }
}
