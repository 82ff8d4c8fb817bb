//! CLI command implementations.

mod call;
mod config;
mod serve;
mod tools;
mod traces;

pub use call::run_call;
pub use config::run_config;
pub use serve::run_serve;
pub use tools::run_tools;
pub use traces::run_traces;

use crate::cli::Output;
use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::traces::{SqliteTraceStore, TraceExporter};
use anyhow::Result;
use std::sync::Arc;

/// Validate settings and connect to the provider behind a spinner.
pub(crate) async fn connect(settings: &Settings) -> Result<Arc<ConnectionManager>> {
    settings.validate()?;
    let manager = ConnectionManager::from_settings(settings)?;

    let spinner = Output::spinner(&format!("Connecting to {}...", settings.provider.url));
    let result = manager.connect().await;
    spinner.finish_and_clear();

    if let Err(e) = result {
        Output::error(&format!("Failed to connect: {}", e));
        return Err(e.into());
    }
    Ok(manager)
}

/// Open the trace store and start its exporter, unless traces are disabled.
pub(crate) fn start_exporter(settings: &Settings) -> Result<Option<Arc<TraceExporter>>> {
    if !settings.traces.enabled {
        return Ok(None);
    }
    let store = Arc::new(SqliteTraceStore::new(&settings.traces_path())?);
    Ok(Some(TraceExporter::start(store, settings.traces.queue_capacity)))
}
