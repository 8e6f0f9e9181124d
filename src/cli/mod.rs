//! CLI module for eventgate
//!
//! Provides command-line interface for:
//! - init: Write a default configuration file
//! - serve: Start the services and the HTTP server
//! - check: Validate a configuration file

mod args;
mod commands;
mod config;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check, init, run, run_command, serve};
pub use config::{
    Config, GatewaySection, LimitSection, LoggingSection, MonitorSection, PubSubSection,
    QueueSection, RateLimitsSection, ReplaySection,
};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
