//! Call command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::gateway::InvocationGateway;
use crate::traces::{NoTraceSink, RunContext, TraceSink};
use anyhow::Result;
use std::sync::Arc;

/// Run the call command.
pub async fn run_call(tool: &str, args: &str, group: Option<String>, settings: Settings) -> Result<()> {
    let exporter = super::start_exporter(&settings)?;
    let manager = super::connect(&settings).await?;
    let gateway = InvocationGateway::new(manager.clone());

    let sink: Arc<dyn TraceSink> = match &exporter {
        Some(exporter) => Arc::clone(exporter) as Arc<dyn TraceSink>,
        None => Arc::new(NoTraceSink),
    };
    let ctx = RunContext::start(sink, "CLI tool invocation", group);
    let trace_id = ctx.trace_id().to_string();

    let spinner = Output::spinner(&format!("Running {}...", tool));
    let result = gateway.invoke_in(&ctx, tool, args).await;
    spinner.finish_and_clear();
    ctx.finish();

    manager.teardown().await;
    if let Some(exporter) = &exporter {
        exporter.shutdown().await;
    }

    match result {
        Ok(output) => {
            println!("{}", output);
            if exporter.is_some() {
                Output::kv("Trace", &trace_id);
            }
            Ok(())
        }
        Err(e) => {
            Output::error(&e.to_string());
            Err(e.into())
        }
    }
}
