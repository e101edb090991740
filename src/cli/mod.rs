// CLI module for pullsub
/// Command execution handlers
pub mod commands;
/// Output formatting utilities
pub mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Command-line interface for pullsub
#[derive(Parser)]
#[command(name = "pullsub")]
#[command(author, version, about = "Streaming pull subscriber engine with an in-memory simulator", long_about = None)]
pub struct Cli {
    /// Log level (trace | debug | info | warn | error), or a full filter directive
    #[arg(long, global = true, env = "PULLSUB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text | json)
    #[arg(long, global = true, env = "PULLSUB_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a subscriber against an in-memory service and report what happened
    Simulate(SimulateArgs),

    /// Show the effective subscriber configuration
    Config {
        /// TOML configuration file
        #[arg(long, short, alias = "file", env = "PULLSUB_CONFIG")]
        config: Option<PathBuf>,

        /// Subscription name, used when no configuration file is given
        #[arg(long, env = "PULLSUB_SUBSCRIPTION", default_value = "projects/local/subscriptions/simulated")]
        subscription: String,
    },

    /// Print the metrics registry in Prometheus text format
    Metrics,
}

/// Arguments of the simulate command
#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// TOML configuration file; flags below override it
    #[arg(long, short, env = "PULLSUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subscription name, used when no configuration file is given
    #[arg(long, env = "PULLSUB_SUBSCRIPTION", default_value = "projects/local/subscriptions/simulated")]
    pub subscription: String,

    /// Number of messages to publish
    #[arg(long, short = 'n', default_value = "100")]
    pub messages: usize,

    /// Simulated processing time per message, in milliseconds
    #[arg(long, default_value = "10")]
    pub process_ms: u64,

    /// Nack the first delivery of every Nth message (0 disables)
    #[arg(long, default_value = "0")]
    pub nack_every: usize,

    /// Number of streaming connections
    #[arg(long)]
    pub parallel_pull_count: Option<usize>,

    /// Maximum outstanding messages
    #[arg(long)]
    pub max_outstanding_messages: Option<u64>,

    /// Shutdown mode (wait | nack)
    #[arg(long)]
    pub shutdown_mode: Option<String>,

    /// Shutdown timeout in milliseconds; negative waits indefinitely
    #[arg(long, allow_negative_numbers = true)]
    pub shutdown_timeout_ms: Option<i64>,

    /// Enable exactly once delivery on the simulated subscription
    #[arg(long)]
    pub exactly_once: bool,

    /// Report delivery attempts, as a subscription with a dead letter policy does
    #[arg(long)]
    pub dead_letter_policy: bool,

    /// Give up and stop after this many seconds
    #[arg(long, default_value = "60")]
    pub max_runtime_secs: u64,

    /// Output format (table | json)
    #[arg(long, short, default_value = "table")]
    pub format: String,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
