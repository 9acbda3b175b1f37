mod arg_parser;
mod client_cli;

use arg_parser::{ArgParser, SubCommand};
use client_cli::ClientCli;

use clap::Parser;
use std::error;
use std::process;

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    let args = ArgParser::parse();
    let mut client = ClientCli::connect(&args.server, args.ca_cert.as_deref(), &args.domain).await?;

    match args.sub_command {
        SubCommand::Status => client.status().await?,
        SubCommand::Run {
            source,
            destination,
            options,
            watch,
        } => {
            let job_id = client.run(source, destination, options).await?;
            if watch {
                exit_with(client.watch(job_id).await?);
            }
        }
        SubCommand::Cancel { job_id } => client.cancel(job_id).await?,
        SubCommand::Watch { job_id } => exit_with(client.watch(job_id).await?),
        SubCommand::Show { job_id } => client.show(job_id).await?,
        SubCommand::History { limit } => client.history(limit).await?,
        SubCommand::Delete { job_id } => client.delete(job_id).await?,
        SubCommand::Browse { path } => client.browse(path).await?,
        SubCommand::SshHosts => client.ssh_hosts().await?,
    }

    Ok(())
}

/// Anything but a completed run makes the process fail.
fn exit_with(status: String) {
    if status != "completed" {
        process::exit(1);
    }
}
