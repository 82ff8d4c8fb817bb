//! Protocol session on top of a [`Transport`]: handshake, tool listing and tool calls.

use crate::catalog::Tool;
use crate::error::{GatewayError, Result};
use crate::provider::protocol::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ToolsListResult,
};
use crate::provider::transport::Transport;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Upper bound on `tools/list` pages fetched in one listing.
const MAX_LIST_PAGES: usize = 100;

/// An initialized session with the tool provider.
pub struct ProviderSession {
    transport: Arc<dyn Transport>,
    server_info: Option<Implementation>,
    protocol_version: String,
}

impl ProviderSession {
    /// Perform the `initialize` handshake and send `notifications/initialized`.
    #[instrument(skip(transport))]
    pub async fn initialize(transport: Arc<dyn Transport>) -> Result<Self> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let raw = transport
            .request("initialize", Some(params))
            .await
            .map_err(handshake_error)?;

        let result: InitializeResult = serde_json::from_value(raw).map_err(|e| {
            GatewayError::Initialization(format!("Malformed initialize result: {}", e))
        })?;

        transport
            .notify("notifications/initialized", None)
            .await
            .map_err(handshake_error)?;

        match &result.server_info {
            Some(server) => info!(
                "Connected to {} {} (protocol {})",
                server.name, server.version, result.protocol_version
            ),
            None => info!("Connected (protocol {})", result.protocol_version),
        }

        Ok(Self {
            transport,
            server_info: result.server_info,
            protocol_version: result.protocol_version,
        })
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Fetch the full tool listing, following `nextCursor` pagination.
    #[instrument(skip(self))]
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let raw = self.transport.request("tools/list", params).await?;
            let page: ToolsListResult = serde_json::from_value(raw)?;

            tools.extend(page.tools.into_iter().map(Tool::from));

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if !seen_cursors.insert(next.clone()) {
                        warn!("Provider repeated cursor '{}', stopping pagination", next);
                        break;
                    }
                    cursor = Some(next);
                }
                _ => {
                    debug!("Listed {} tools", tools.len());
                    return Ok(tools);
                }
            }
        }

        warn!("Tool listing truncated after {} pages", MAX_LIST_PAGES);
        Ok(tools)
    }

    /// Invoke a tool by name.
    #[instrument(skip(self, arguments))]
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> Result<CallToolResult> {
        let params = serde_json::to_value(CallToolParams { name, arguments })?;
        let raw = self
            .transport
            .request("tools/call", Some(params))
            .await
            .map_err(|e| match e {
                GatewayError::Rpc { code, message } => {
                    GatewayError::ToolCall(format!("provider error {}: {}", code, message))
                }
                other => other,
            })?;
        serde_json::from_value(raw)
            .map_err(|e| GatewayError::ToolCall(format!("Malformed tool result: {}", e)))
    }

    /// Close the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }
}

fn handshake_error(err: GatewayError) -> GatewayError {
    match err {
        GatewayError::Rpc { code, message } => {
            GatewayError::Initialization(format!("Provider rejected handshake ({}): {}", code, message))
        }
        other => other,
    }
}
