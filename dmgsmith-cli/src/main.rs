mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::{CommandFailure, status};

fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    dmgsmith::util::register_to_tracing(std::io::stderr, env_filter, false);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build(args) => commands::build::execute(args, &cli.global).await,
        Commands::List(args) => commands::list::execute(args, &cli.global).await,
        Commands::Download(args) => commands::download::execute(args, &cli.global).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(status::USAGE),
            };
        }
    };

    init_logging(cli.global.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<CommandFailure>()
                .map_or(status::FAILURE, |f| f.status);
            ExitCode::from(code)
        }
    }
}
