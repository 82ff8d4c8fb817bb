//! HTTP API over the gateway and the trace store.

use crate::catalog::Tool;
use crate::error::GatewayError;
use crate::gateway::InvocationGateway;
use crate::provider::Implementation;
use crate::traces::{NoTraceSink, RunContext, SqliteTraceStore, TraceExporter, TraceSink};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

/// Workflow name recorded on traces of API-initiated invocations.
const API_WORKFLOW: &str = "HTTP tool invocation";

/// Shared application state.
pub struct AppState {
    pub gateway: InvocationGateway,
    pub exporter: Option<Arc<TraceExporter>>,
}

impl AppState {
    pub fn new(gateway: InvocationGateway, exporter: Option<Arc<TraceExporter>>) -> Arc<Self> {
        Arc::new(Self { gateway, exporter })
    }

    fn trace_store(&self) -> Option<Arc<SqliteTraceStore>> {
        self.exporter.as_ref().map(|e| Arc::clone(e.store()))
    }

    fn sink(&self) -> Arc<dyn TraceSink> {
        match &self.exporter {
            Some(exporter) => Arc::clone(exporter) as Arc<dyn TraceSink>,
            None => Arc::new(NoTraceSink),
        }
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/refresh", post(refresh_tools))
        .route("/api/tools/{name}", get(get_tool))
        .route("/api/tools/{name}/invoke", post(invoke_tool))
        .route("/api/traces/{trace_id}/spans", get(trace_spans))
        .route("/api/conversations/{group_id}/traces", get(conversation_traces))
        .route("/api/conversations/{group_id}/neighbors", get(conversation_neighbors))
        .layer(cors)
        .with_state(state)
}

// === Request/Response Types ===

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connection: String,
    tools: usize,
    catalog_generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_refreshed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<Implementation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol_version: Option<String>,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<Tool>,
    total: usize,
}

#[derive(Deserialize)]
struct InvokeRequest {
    /// Either a JSON object or the raw JSON text the model produced.
    #[serde(default)]
    arguments: Option<Value>,
    /// Conversation the invocation belongs to.
    #[serde(default)]
    group_id: Option<String>,
}

#[derive(Serialize)]
struct InvokeResponse {
    tool: String,
    output: String,
    trace_id: String,
}

#[derive(Serialize)]
struct RefreshResponse {
    tools: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn traces_disabled() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Trace capture is disabled")
}

// === Handlers ===

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.gateway.manager();
    let catalog = manager.catalog().snapshot();
    Json(HealthResponse {
        status: "ok",
        connection: manager.state().to_string(),
        tools: catalog.len(),
        catalog_generation: catalog.generation(),
        last_refreshed: catalog.last_refreshed().map(|ts| ts.to_rfc3339()),
        provider: manager.server_info(),
        protocol_version: manager.protocol_version(),
    })
}

async fn list_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools: Vec<Tool> = state
        .gateway
        .list_tools()
        .iter()
        .map(|t| Tool::clone(t))
        .collect();
    Json(ToolListResponse {
        total: tools.len(),
        tools,
    })
}

async fn get_tool(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.gateway.manager().get_tool(&name) {
        Some(tool) => Json(Tool::clone(&tool)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Tool '{}' not found", name)),
    }
}

async fn refresh_tools(State(state): State<Arc<AppState>>) -> Response {
    match state.gateway.manager().refresh().await {
        Ok(tools) => Json(RefreshResponse { tools }).into_response(),
        Err(GatewayError::NotConnected) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Not connected to the tool provider")
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<InvokeRequest>,
) -> Response {
    let raw_args = match req.arguments {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(raw)) => raw,
        Some(other) => other.to_string(),
    };

    let ctx = RunContext::start(state.sink(), API_WORKFLOW, req.group_id);
    let trace_id = ctx.trace_id().to_string();
    let result = state.gateway.invoke_in(&ctx, &name, &raw_args).await;
    ctx.finish();

    match result {
        Ok(output) => Json(InvokeResponse {
            tool: name,
            output,
            trace_id,
        })
        .into_response(),
        Err(e) => {
            warn!("Invocation of '{}' failed: {}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn trace_spans(State(state): State<Arc<AppState>>, Path(trace_id): Path<String>) -> Response {
    let Some(store) = state.trace_store() else {
        return traces_disabled();
    };
    let result = tokio::task::spawn_blocking(move || store.spans_for_trace(&trace_id)).await;
    match result {
        Ok(Ok(spans)) => Json(spans).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn conversation_traces(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Response {
    let Some(store) = state.trace_store() else {
        return traces_disabled();
    };
    let result = tokio::task::spawn_blocking(move || store.traces_for_group(&group_id)).await;
    match result {
        Ok(Ok(traces)) => Json(traces).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn conversation_neighbors(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Response {
    let Some(store) = state.trace_store() else {
        return traces_disabled();
    };
    let result = tokio::task::spawn_blocking(move || store.conversation_neighbors(&group_id)).await;
    match result {
        Ok(Ok(neighbors)) => Json(neighbors).into_response(),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
