//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Credential rotation and OAuth callback core for posting automation
#[derive(Parser, Debug)]
#[command(name = "postflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "POSTFLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "POSTFLOW_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "POSTFLOW_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "POSTFLOW_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "POSTFLOW_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default)
    Serve,

    /// Print a fresh authorization URL for a provider
    AuthorizeUrl {
        /// Provider (facebook, instagram)
        provider: String,
    },

    /// Run one request through a key pool
    Call {
        /// Pool name from the config
        pool: String,

        /// Target URL (or URL template)
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Extra header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Show masked key pool diagnostics
    Keys {
        /// Pool name (all pools if omitted)
        pool: Option<String>,
    },

    /// OAuth state maintenance
    #[command(subcommand)]
    States(StatesCommand),
}

/// OAuth state subcommands
#[derive(Subcommand, Debug)]
pub enum StatesCommand {
    /// Delete expired and consumed states
    Sweep,

    /// Delete every state and used-code record
    Clear,
}
