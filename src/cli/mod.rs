//! CLI module for slackline
//!
//! Provides command-line interface for:
//! - serve: Boot the hub and its WebSocket/HTTP server
//! - inspect: Dump the durable event log
//! - token: Mint a bearer token for local testing

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{inspect, open_hub, run, run_command, serve, token, Config, MembershipGrant};
pub use errors::{CliError, CliErrorCode, CliResult};
