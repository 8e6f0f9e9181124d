//! CLI argument definitions using clap
//!
//! Commands:
//! - eventgate init --config <path>
//! - eventgate serve --config <path>
//! - eventgate check --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// eventgate - queue, pub/sub broker and event delivery gateway
#[derive(Parser, Debug)]
#[command(name = "eventgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write a default configuration file
    Init {
        /// Path to configuration file
        #[arg(long, default_value = "./eventgate.json")]
        config: PathBuf,
    },

    /// Start the services and the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./eventgate.json")]
        config: PathBuf,
    },

    /// Validate a configuration file and exit
    Check {
        /// Path to configuration file
        #[arg(long, default_value = "./eventgate.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
