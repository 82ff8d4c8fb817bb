//! Tools command implementation.

use crate::cli::Output;
use crate::config::Settings;
use crate::gateway::InvocationGateway;
use anyhow::Result;

/// Run the tools command.
pub async fn run_tools(json: bool, settings: Settings) -> Result<()> {
    let manager = super::connect(&settings).await?;
    let gateway = InvocationGateway::new(manager.clone());

    if json {
        let definitions = gateway.tool_definitions();
        println!("{}", serde_json::to_string_pretty(&definitions)?);
    } else {
        let tools = gateway.list_tools();
        if tools.is_empty() {
            Output::info("The provider offers no tools.");
        } else {
            Output::header(&format!("Tools ({})", tools.len()));
            println!();
            for tool in &tools {
                let params = if tool.has_parameters() { "" } else { " (no parameters)" };
                Output::tool_info(&tool.name, &tool.description, params);
            }
        }
    }

    manager.teardown().await;
    Ok(())
}
