use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_NAME;

#[derive(Debug, Parser)]
#[command(
    name = "pup",
    version = env!("PUP_BUILD_VERSION"),
    about = "Pup process supervisor"
)]
pub struct Cli {
    /// Configuration file the core (and its bus endpoint) is rooted at.
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_NAME)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the core in the foreground.
    Run,
    /// Load and validate the configuration without starting anything.
    Validate,
    Start {
        id: String,
    },
    Stop {
        id: String,
    },
    Restart {
        id: String,
    },
    Block {
        id: String,
    },
    Unblock {
        id: String,
    },
    Status,
    Terminate,
}
