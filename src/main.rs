//! Entry point for the `pup` binary.
//!
//! The binary is intentionally thin: it configures tracing, parses CLI input,
//! loads the plan, and then hands control to either the core loop or the bus
//! client for operator commands.

mod child;
mod cli;
mod cluster;
mod config;
mod cron;
mod errors;
mod ipc;
mod logging;
mod pup;
mod supervisor;
mod watcher;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::Plan;
use crate::errors::PupError;
use crate::ipc::BusRequest;

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            error!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run => {
            let plan = Plan::load(&cli.config)?;
            pup::run(plan).await
        }
        Commands::Validate => {
            let plan = Plan::load(&cli.config)?;
            println!(
                "{}: {} process(es) valid",
                cli.config.display(),
                plan.processes.len()
            );
            Ok(())
        }
        command => {
            let plan = Plan::load(&cli.config)?;
            let request = match command {
                Commands::Start { id } => BusRequest::Start { id },
                Commands::Stop { id } => BusRequest::Stop { id },
                Commands::Restart { id } => BusRequest::Restart { id },
                Commands::Block { id } => BusRequest::Block { id },
                Commands::Unblock { id } => BusRequest::Unblock { id },
                Commands::Status => BusRequest::Status,
                Commands::Terminate => BusRequest::Terminate,
                Commands::Run | Commands::Validate => unreachable!("handled above"),
            };

            let response = ipc::request(&plan.ipc_path, &request).await?;
            if let Some(processes) = &response.processes {
                println!("{}", serde_json::to_string_pretty(processes)?);
            } else {
                println!("{}", response.message);
            }
            if !response.ok {
                anyhow::bail!("{}", response.message);
            }
            Ok(())
        }
    }
}

/// Exit codes of the core: 0 clean, 1 config error, 2 bus conflict, 3 fatal
/// internal error. Client-side failures exit 1.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PupError>() {
        Some(PupError::Config(_)) => 1,
        Some(PupError::BusConflict(_)) => 2,
        Some(PupError::Internal(_)) => 3,
        _ => 1,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
