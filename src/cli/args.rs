//! CLI argument definitions using clap
//!
//! Commands:
//! - slackline serve --config <path> [--port <port>]
//! - slackline inspect --config <path> [--topic <topic>] [--after <seq>]
//! - slackline token --config <path> --user <uuid>

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// slackline - self-hosted realtime fan-out for chat
#[derive(Parser, Debug)]
#[command(name = "slackline")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the hub and its WebSocket/HTTP server
    Serve {
        /// Path to configuration file
        #[arg(long, default_value = "./slackline.json")]
        config: PathBuf,

        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Print what the durable event log holds
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./slackline.json")]
        config: PathBuf,

        /// Topic to dump (e.g. channel:<uuid>); lists topics when omitted
        #[arg(long)]
        topic: Option<String>,

        /// Only events after this sequence
        #[arg(long, default_value_t = 0)]
        after: u64,

        /// Maximum number of events to print
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Mint a bearer token for a user with the configured secret
    Token {
        /// Path to configuration file
        #[arg(long, default_value = "./slackline.json")]
        config: PathBuf,

        /// User id the token identifies
        #[arg(long)]
        user: Uuid,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
