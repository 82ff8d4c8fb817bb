//! In-process provider used by unit tests.

use crate::error::{GatewayError, Result};
use crate::provider::transport::{Connector, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state and counters for every session a [`MockConnector`] opens.
#[derive(Default)]
pub(crate) struct MockProvider {
    pub tools: Mutex<Vec<Value>>,
    /// Number of upcoming `connect` calls that fail.
    pub fail_connects: AtomicU32,
    /// Number of upcoming `initialize` requests that fail.
    pub fail_initialize: AtomicU32,
    pub fail_list: AtomicBool,
    /// Catalog listings never answer while set.
    pub hang_list: AtomicBool,
    /// Tool calls never answer while set.
    pub hang_calls: AtomicBool,
    /// Tool calls report a closed transport while set.
    pub break_calls: AtomicBool,
    pub connects: AtomicU32,
    pub closes: AtomicU32,
    pub list_requests: AtomicU32,
    pub tool_calls: AtomicU32,
    pub last_call: Mutex<Option<(String, Value)>>,
}

impl MockProvider {
    pub fn with_tools(tools: Vec<Value>) -> Arc<Self> {
        let provider = Self::default();
        *provider.tools.lock().unwrap() = tools;
        Arc::new(provider)
    }

    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// `turn_on_light(name: string)`, the canonical test tool.
pub(crate) fn light_tool() -> Value {
    json!({
        "name": "turn_on_light",
        "description": "Turn on a light by name",
        "inputSchema": {
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        }
    })
}

pub(crate) fn tool_without_params(name: &str) -> Value {
    json!({"name": name, "description": format!("{} tool", name)})
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub(crate) struct MockConnector {
    pub provider: Arc<MockProvider>,
}

impl MockConnector {
    pub fn new(provider: Arc<MockProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        self.provider.connects.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.provider.fail_connects) {
            return Err(GatewayError::Connection("connection refused".into()));
        }
        Ok(Arc::new(MockTransport {
            provider: Arc::clone(&self.provider),
            closed: AtomicBool::new(false),
        }))
    }
}

pub(crate) struct MockTransport {
    provider: Arc<MockProvider>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GatewayError::TransportClosed);
        }
        let provider = &self.provider;

        match method {
            "initialize" => {
                if take_one(&provider.fail_initialize) {
                    return Err(GatewayError::Rpc {
                        code: -32603,
                        message: "not ready".into(),
                    });
                }
                Ok(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {"listChanged": false}},
                    "serverInfo": {"name": "mock", "version": "0"}
                }))
            }
            "tools/list" => {
                provider.list_requests.fetch_add(1, Ordering::SeqCst);
                if provider.hang_list.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                if provider.fail_list.load(Ordering::SeqCst) {
                    return Err(GatewayError::Rpc {
                        code: -32603,
                        message: "listing failed".into(),
                    });
                }
                let tools = provider.tools.lock().unwrap().clone();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                provider.tool_calls.fetch_add(1, Ordering::SeqCst);
                let params = params.unwrap_or(Value::Null);
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let args = params["arguments"].clone();
                *provider.last_call.lock().unwrap() = Some((name.clone(), args.clone()));

                if provider.break_calls.load(Ordering::SeqCst) {
                    return Err(GatewayError::TransportClosed);
                }
                if provider.hang_calls.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                match name.as_str() {
                    "fail_tool" => Ok(json!({
                        "content": [{"type": "text", "text": "device unavailable"}],
                        "isError": true
                    })),
                    "rpc_error_tool" => Err(GatewayError::Rpc {
                        code: -32000,
                        message: "internal provider failure".into(),
                    }),
                    _ => Ok(json!({"content": [{"type": "text", "text": "ok"}], "isError": false})),
                }
            }
            other => Err(GatewayError::Rpc {
                code: -32601,
                message: format!("Method not found: {}", other),
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.provider.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
