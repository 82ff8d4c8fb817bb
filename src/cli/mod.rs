//! CLI module for home-agent.

pub mod commands;
mod output;

pub use output::Output;

use clap::{Parser, Subcommand};

/// home-agent - Tool gateway for a conversational home-automation agent
///
/// Connects to the home-automation tool provider, keeps its tool catalog current
/// and invokes tools on behalf of the agent.
#[derive(Parser, Debug)]
#[command(name = "home-agent")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP API in front of the tool gateway
    Serve {
        /// Host to bind to (defaults to server.host)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (defaults to server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Connect to the provider and list its tools
    Tools {
        /// Print function-calling definitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Invoke a single tool
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object (empty means no arguments)
        #[arg(default_value = "")]
        args: String,

        /// Conversation id to record the trace under
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Inspect stored execution traces
    Traces {
        /// Trace id whose spans to show
        trace_id: Option<String>,

        /// Show every trace of a conversation instead
        #[arg(short, long, conflicts_with = "trace_id")]
        group: Option<String>,

        /// With --group, also show the previous and next conversation
        #[arg(long, requires = "group")]
        neighbors: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration (token redacted)
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Check the configuration for errors
    Check,

    /// Show configuration file path
    Path,
}
