mod cli;
mod commands;
mod output;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let endpoints = cli.endpoints.clone();

    let result = match cli.command {
        Command::Show {
            service,
            summary,
            bycn,
            json,
            all,
        } => commands::show(&endpoints, service, summary, bycn, json, all).await,
        Command::Cn {
            filter,
            storage_only,
            no_header,
            columns,
        } => commands::cn(&endpoints, filter, storage_only, no_header, columns).await,
        Command::Genconfig {
            template,
            from_file,
            directory,
        } => commands::genconfig(&endpoints, template, from_file, directory).await,
        Command::Update {
            path,
            service,
            dry_run,
            confirm,
            no_reprovision,
        } => commands::update(&endpoints, path, service, dry_run, confirm, no_reprovision).await,
        Command::Zk { command } => commands::zk(&endpoints, command).await,
        Command::Alarm { command } => commands::alarm(&endpoints, command).await,
        Command::Fleet(args) => commands::fleet(&endpoints, args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("shoal: {:#}", err);
            // Post-parse usage errors share clap's exit code; everything
            // else is an operational failure.
            if err.downcast_ref::<commands::UsageError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
