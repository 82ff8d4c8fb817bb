//! Invocation gateway: the tool surface handed to the agent.
//!
//! Turns `(tool name, raw JSON arguments)` into a validated provider call. Every
//! recoverable failure comes back as text the model can read and act on; only a
//! broken tool schema escapes as an error.

use crate::catalog::Tool;
use crate::connection::ConnectionManager;
use crate::error::{GatewayError, Result};
use crate::schema;
use crate::traces::{RunContext, SpanHandle};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

pub const NOT_CONNECTED_MESSAGE: &str = "No active connection to the tool provider is configured.";

pub struct InvocationGateway {
    manager: Arc<ConnectionManager>,
}

impl InvocationGateway {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Tools currently offered by the provider.
    pub fn list_tools(&self) -> Vec<Arc<Tool>> {
        self.manager.list_tools()
    }

    /// Function-calling definitions for the current catalog.
    ///
    /// Tools without parameters get an empty object schema.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.list_tools()
            .iter()
            .map(|tool| {
                let parameters = if tool.has_parameters() {
                    tool.parameter_schema.clone()
                } else {
                    json!({"type": "object", "properties": {}})
                };
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }

    /// Invoke a tool outside any traced run.
    pub async fn invoke(&self, tool_name: &str, raw_args: &str) -> Result<String> {
        self.invoke_in(&RunContext::disabled(), tool_name, raw_args).await
    }

    /// Invoke a tool, recording a function span in `ctx`.
    ///
    /// Returns the tool output or a diagnostic message. Fails only with
    /// [`GatewayError::SchemaConfiguration`].
    #[instrument(skip(self, ctx, raw_args), fields(trace_id = %ctx.trace_id()))]
    pub async fn invoke_in(&self, ctx: &RunContext, tool_name: &str, raw_args: &str) -> Result<String> {
        let mut span = ctx.function_span(tool_name, raw_args);
        let outcome = self.dispatch(tool_name, raw_args, &mut span).await;

        match outcome {
            Ok(text) => {
                span.set_output(text.clone());
                Ok(text)
            }
            Err(e @ GatewayError::SchemaConfiguration { .. }) => {
                error!("{}", e);
                record_error(&mut span, tool_name, &e.to_string());
                Err(e)
            }
            Err(e) => {
                let message = diagnostic(tool_name, raw_args, &e);
                record_error(&mut span, tool_name, &e.to_string());
                span.set_output(message.clone());
                Ok(message)
            }
        }
    }

    async fn dispatch(&self, tool_name: &str, raw_args: &str, span: &mut SpanHandle<'_>) -> Result<String> {
        if !self.manager.state().accepts_calls() {
            return Err(GatewayError::NotConnected);
        }

        let args = parse_arguments(raw_args)?;

        let tool = self.manager.get_tool(tool_name).ok_or_else(|| GatewayError::ToolNotFound {
            name: tool_name.to_string(),
            available: self.manager.catalog().names().join(", "),
        })?;

        schema::validate(&tool.name, &tool.parameter_schema, &args)?;

        debug!("Calling tool '{}'", tool_name);
        let result = self.manager.call(tool_name, &args).await?;
        let text = result.to_text();

        if result.is_error {
            span.set("is_error", true);
            return Ok(format!("Tool '{}' reported an error: {}", tool_name, text));
        }
        Ok(text)
    }
}

/// Decode the raw argument string. Blank input means no arguments.
fn parse_arguments(raw_args: &str) -> Result<Value> {
    if raw_args.trim().is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_str(raw_args)?;
    if !value.is_object() {
        return Err(GatewayError::Validation(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }
    Ok(value)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn record_error(span: &mut SpanHandle<'_>, tool_name: &str, detail: &str) {
    span.set_error(
        "Error running tool",
        Some(json!({"tool_name": tool_name, "error": detail})),
    );
}

/// Model-readable text for a failed invocation.
fn diagnostic(tool_name: &str, raw_args: &str, err: &GatewayError) -> String {
    match err {
        GatewayError::NotConnected => NOT_CONNECTED_MESSAGE.to_string(),
        GatewayError::Json(e) => format!(
            "Invalid JSON input for tool '{}': {} ({}). Please provide the arguments as a valid JSON object.",
            tool_name, raw_args, e
        ),
        GatewayError::Validation(msg) if msg.starts_with("expected a JSON object") => format!(
            "Invalid JSON input for tool '{}': {}. Please provide the arguments as a valid JSON object.",
            tool_name, msg
        ),
        GatewayError::ToolNotFound { .. } => err.to_string(),
        GatewayError::Validation(msg) => {
            format!("Invalid arguments for tool '{}': {}", tool_name, msg)
        }
        other => {
            warn!("Tool '{}' failed: {}", tool_name, other);
            format!(
                "An error occurred while running the tool '{}'. Please try again.",
                tool_name
            )
        }
    }
}
