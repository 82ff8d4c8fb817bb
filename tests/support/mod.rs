//! In-process tool provider speaking JSON-RPC over HTTP + SSE.

#![allow(dead_code)]

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub const TOKEN: &str = "test-token";

#[derive(Default)]
pub struct ProviderState {
    stream: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    tools: Mutex<Vec<Value>>,
    pub connects: AtomicU32,
    pub calls: AtomicU32,
}

pub struct FakeProvider {
    addr: SocketAddr,
    state: Arc<ProviderState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeProvider {
    pub async fn start() -> Self {
        let state = Arc::new(ProviderState::default());
        state.tools.lock().unwrap().extend(default_tools());

        let app = Router::new()
            .route("/sse", get(open_stream))
            .route("/messages", post(receive_message))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn sse_url(&self) -> String {
        format!("http://{}/sse", self.addr)
    }

    pub fn state(&self) -> &Arc<ProviderState> {
        &self.state
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.state.tools.lock().unwrap() = tools;
    }

    /// End the current event stream, as a restarting provider would.
    pub fn drop_stream(&self) {
        self.state.stream.lock().unwrap().take();
    }

    pub fn connects(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.drop_stream();
    }
}

pub fn default_tools() -> Vec<Value> {
    vec![
        json!({
            "name": "turn_on_light",
            "description": "Turn on a light",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "brightness": {"type": "integer", "minimum": 0, "maximum": 100}
                },
                "required": ["name"]
            }
        }),
        json!({
            "name": "get_temperature",
            "description": "Read the indoor temperature",
            "inputSchema": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "unlock_door",
            "description": "Unlock a door",
            "inputSchema": {
                "type": "object",
                "properties": {"door": {"type": "string"}},
                "required": ["door"]
            }
        }),
    ]
}

async fn open_stream(State(state): State<Arc<ProviderState>>, headers: HeaderMap) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", TOKEN))
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let n = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = tx.send(
        Event::default()
            .event("endpoint")
            .data(format!("/messages?session_id={}", n)),
    );
    *state.stream.lock().unwrap() = Some(tx);

    Sse::new(event_stream(rx)).into_response()
}

fn event_stream(rx: mpsc::UnboundedReceiver<Event>) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    })
}

async fn receive_message(State(state): State<Arc<ProviderState>>, Json(message): Json<Value>) -> StatusCode {
    let sender = state.stream.lock().unwrap().clone();
    let Some(sender) = sender else {
        return StatusCode::GONE;
    };

    // Notifications get no response
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    let method = message["method"].as_str().unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or(Value::Null);

    let response = match method {
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": "fake-home", "version": "1.0.0"}
            }
        }),
        "tools/list" => list_page(&state, id, &params),
        "tools/call" => {
            state.calls.fetch_add(1, Ordering::SeqCst);
            call_tool(id, &params)
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {}", other)}
        }),
    };

    let _ = sender.send(Event::default().event("message").data(response.to_string()));
    StatusCode::ACCEPTED
}

/// Two tools per page.
fn list_page(state: &ProviderState, id: Value, params: &Value) -> Value {
    let tools = state.tools.lock().unwrap().clone();
    let start: usize = params
        .get("cursor")
        .and_then(|c| c.as_str())
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = (start + 2).min(tools.len());
    let page: Vec<Value> = tools.get(start..end).map(|s| s.to_vec()).unwrap_or_default();

    let mut result = json!({"tools": page});
    if end < tools.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn call_tool(id: Value, params: &Value) -> Value {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];

    let result = match name {
        "turn_on_light" => json!({
            "content": [{"type": "text", "text": format!("Turned on {}", args["name"].as_str().unwrap_or("?"))}],
            "isError": false
        }),
        "get_temperature" => json!({
            "content": [{"type": "text", "text": "21.5"}]
        }),
        _ => json!({
            "content": [{"type": "text", "text": "door is jammed"}],
            "isError": true
        }),
    };
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}
