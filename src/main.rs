//! home-agent CLI entry point.

use anyhow::Result;
use clap::Parser;
use home_agent::cli::{commands, Cli, Commands};
use home_agent::config::Settings;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.as_ref().map(PathBuf::from);
    let settings = Settings::load_from(config_path.as_ref())?;

    // Initialize logging; -v flags win over general.log_level
    let log_level = match cli.verbose {
        0 => settings.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("home_agent={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Execute command
    match &cli.command {
        Commands::Serve { host, port } => {
            commands::run_serve(host.as_deref(), *port, settings).await?;
        }

        Commands::Tools { json } => {
            commands::run_tools(*json, settings).await?;
        }

        Commands::Call { tool, args, group } => {
            commands::run_call(tool, args, group.clone(), settings).await?;
        }

        Commands::Traces {
            trace_id,
            group,
            neighbors,
        } => {
            commands::run_traces(trace_id.as_deref(), group.as_deref(), *neighbors, settings)?;
        }

        Commands::Config { action } => {
            commands::run_config(action, settings, config_path)?;
        }
    }

    Ok(())
}
