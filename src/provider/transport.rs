//! HTTP+SSE transport to the tool provider.
//!
//! The provider streams JSON-RPC messages over one long-lived `text/event-stream`
//! response and accepts requests as POSTs to the URL announced in the first
//! `endpoint` event. A single background reader task owns the stream and routes
//! responses to waiting callers by request id, so any number of requests may be
//! in flight at once.

use crate::error::{GatewayError, Result};
use crate::provider::protocol::{
    classify_message, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageKind,
};
use crate::provider::sse::{SseEvent, SseParser};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

/// A live, initialized-or-not session channel to the provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response's `result`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// Send a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Opens new transport sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// POST side of the session.
struct Outbound {
    client: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
}

impl Outbound {
    async fn post(&self, body: &Value) -> Result<()> {
        let mut req = self.client.post(self.endpoint.clone()).json(body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Connection(format!("Failed to send message: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Connection(format!(
                "Provider rejected message with status {}",
                status
            )));
        }
        Ok(())
    }
}

/// Removes a pending entry when the waiting caller goes away (timeout, cancellation).
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

/// Park a caller's response slot, unless the reader has already ended.
///
/// The closed flag is read under the map lock, so an entry is either refused here
/// or cleared by the reader on its way out.
fn register_pending(
    pending: &PendingMap,
    closed: &AtomicBool,
    id: u64,
    tx: oneshot::Sender<JsonRpcResponse>,
) -> Result<()> {
    let mut map = pending
        .lock()
        .map_err(|e| GatewayError::Connection(format!("Failed to acquire lock: {}", e)))?;
    if closed.load(Ordering::SeqCst) {
        return Err(GatewayError::TransportClosed);
    }
    map.insert(id, tx);
    Ok(())
}

/// MCP transport over HTTP+SSE.
pub struct SseTransport {
    outbound: Arc<Outbound>,
    next_id: AtomicU64,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the provider to announce its message endpoint.
    #[instrument(skip(url, token), fields(url = %url))]
    pub async fn connect(url: &Url, token: Option<&str>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        let mut req = client.get(url.clone()).header(ACCEPT, "text/event-stream");
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Connection(format!("Failed to open event stream: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::Connection(format!(
                "Provider refused the access token ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(GatewayError::Connection(format!(
                "Provider returned status {}",
                status
            )));
        }

        let mut stream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        let endpoint = wait_for_endpoint(&mut stream, &mut parser).await?;
        let endpoint = url.join(endpoint.trim()).map_err(|e| {
            GatewayError::Connection(format!("Invalid endpoint '{}': {}", endpoint, e))
        })?;
        info!("Provider message endpoint: {}", endpoint);

        let outbound = Arc::new(Outbound {
            client,
            endpoint,
            token: token.map(str::to_string),
        });
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            stream,
            parser,
            Arc::clone(&outbound),
            Arc::clone(&pending),
            Arc::clone(&closed),
            cancel.clone(),
        ));

        Ok(Self {
            outbound,
            next_id: AtomicU64::new(1),
            pending,
            closed,
            cancel,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Whether the event stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        register_pending(&self.pending, &self.closed, id, tx)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        trace!("-> {}", body);
        self.outbound.post(&body).await?;

        // Sender dropped means the reader task ended
        let response = rx.await.map_err(|_| GatewayError::TransportClosed)?;
        response.into_result()
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::TransportClosed);
        }
        let body = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.outbound.post(&body).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let handle = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!("Reader task ended abnormally: {}", e);
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn wait_for_endpoint<S, B>(stream: &mut S, parser: &mut SseParser) -> Result<String>
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        while let Some(event) = parser.next_event() {
            if event.event == "endpoint" {
                return Ok(event.data);
            }
            debug!("Ignoring '{}' event before endpoint", event.event);
        }

        match stream.next().await {
            Some(Ok(chunk)) => parser.push(chunk.as_ref()),
            Some(Err(e)) => {
                return Err(GatewayError::Connection(format!(
                    "Event stream failed before endpoint: {}",
                    e
                )))
            }
            None => {
                return Err(GatewayError::Connection(
                    "Event stream closed before endpoint was announced".to_string(),
                ))
            }
        }
    }
}

async fn read_loop<S, B>(
    mut stream: S,
    mut parser: SseParser,
    outbound: Arc<Outbound>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        while let Some(event) = parser.next_event() {
            handle_event(event, &outbound, &pending).await;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Reader task cancelled");
                break;
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => parser.push(bytes.as_ref()),
                Some(Err(e)) => {
                    warn!("Event stream error: {}", e);
                    break;
                }
                None => {
                    info!("Event stream closed by provider");
                    break;
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller with TransportClosed
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}

async fn handle_event(event: SseEvent, outbound: &Outbound, pending: &PendingMap) {
    if event.event != "message" {
        debug!("Ignoring '{}' event", event.event);
        return;
    }

    let json: Value = match serde_json::from_str(&event.data) {
        Ok(json) => json,
        Err(e) => {
            warn!("Discarding malformed message: {}", e);
            return;
        }
    };
    trace!("<- {}", json);

    match classify_message(&json) {
        MessageKind::Response(id) => {
            let sender = pending.lock().ok().and_then(|mut p| p.remove(&id));
            match (sender, serde_json::from_value::<JsonRpcResponse>(json)) {
                (Some(tx), Ok(response)) => {
                    let _ = tx.send(response);
                }
                (None, _) => debug!("No caller waiting for response {}", id),
                (Some(_), Err(e)) => warn!("Malformed response {}: {}", id, e),
            }
        }
        MessageKind::IncomingRequest => {
            let id = json.get("id").cloned().unwrap_or(Value::Null);
            let method = json.get("method").and_then(Value::as_str).unwrap_or_default();
            let reply = if method == "ping" {
                serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
            } else {
                debug!("Unsupported provider request: {}", method);
                serde_json::to_value(JsonRpcResponse::failure(id, -32601, "Method not found"))
                    .unwrap_or(Value::Null)
            };
            if let Err(e) = outbound.post(&reply).await {
                warn!("Failed to answer provider request '{}': {}", method, e);
            }
        }
        MessageKind::Notification => {
            let method = json.get("method").and_then(Value::as_str).unwrap_or_default();
            debug!("Provider notification: {}", method);
        }
        MessageKind::Unknown => debug!("Unrecognised message: {}", json),
    }
}

/// Opens [`SseTransport`] sessions against a configured provider URL.
pub struct SseConnector {
    url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl SseConnector {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| GatewayError::Config(format!("Invalid provider URL '{}': {}", url, e)))?;
        Ok(Self {
            url,
            token,
            timeout,
        })
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let transport = tokio::time::timeout(
            self.timeout,
            SseTransport::connect(&self.url, self.token.as_deref(), self.timeout),
        )
        .await
        .map_err(|_| {
            GatewayError::Connection(format!(
                "Timed out after {:?} opening event stream",
                self.timeout
            ))
        })??;
        Ok(Arc::new(transport))
    }
}
