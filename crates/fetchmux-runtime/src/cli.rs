//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "fetchmux", version, about = "checkpointed log fetcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run every configured source until SIGINT/SIGTERM
    Run(RunOpts),
    /// Print the persisted checkpoints
    Checkpoints(CheckpointsOpts),
    /// Negotiate one sub-protocol over WebSocket and print one reply
    Probe(ProbeOpts),
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// TOML config file
    #[arg(long, short = 'c', env = "FETCHMUX_CONFIG")]
    pub config: PathBuf,

    /// Validate the config and exit
    #[arg(long)]
    pub check: bool,
}

#[derive(clap::Args)]
pub struct CheckpointsOpts {
    /// Checkpoint state file
    #[arg(long, short = 's')]
    pub state: PathBuf,

    /// Print the raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct ProbeOpts {
    /// WebSocket URL, e.g. ws://127.0.0.1:9000/stream
    #[arg(long)]
    pub url: String,

    /// Sub-protocol to negotiate and open
    #[arg(long)]
    pub protocol: String,

    /// Read/write timeout in milliseconds (0 = wait forever)
    #[arg(long, default_value = "5000", allow_negative_numbers = true)]
    pub timeout_ms: i64,

    /// JSON payload to send before waiting for a reply
    #[arg(long)]
    pub message: Option<String>,
}
