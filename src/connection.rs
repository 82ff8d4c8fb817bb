//! Connection manager for the tool provider.
//!
//! Owns the single provider session and the tool catalog. Connecting runs the
//! handshake and the initial catalog load under a bounded retry loop with
//! exponential backoff. Once connected, a background task refreshes the catalog
//! periodically and re-establishes the session when it breaks.

use crate::catalog::{CatalogHandle, Tool};
use crate::config::{RetrySettings, Settings};
use crate::error::{GatewayError, Result};
use crate::provider::{CallToolResult, Connector, Implementation, ProviderSession, SseConnector};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle state of the provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Catalog fetch in progress; calls are still accepted.
    Refreshing,
    /// Session broken, a new one is being established; calls fail fast.
    Reconnecting,
    /// Retry bound exhausted.
    Failed,
}

impl ConnectionState {
    /// Whether tool calls are accepted in this state.
    pub fn accepts_calls(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Refreshing)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Refreshing => "refreshing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait before `attempt` (1-based). The first attempt runs immediately,
    /// the second after `initial_delay`, and each later one after twice the previous
    /// delay, capped at `max_delay`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// Tunables for [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub refresh_interval: Duration,
    pub refresh_cooldown: Duration,
    /// Consecutive call timeouts after which the session is re-established.
    pub max_consecutive_timeouts: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ManagerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            retry: RetryPolicy::from(&settings.retry),
            connect_timeout: settings.connect_timeout(),
            call_timeout: settings.call_timeout(),
            refresh_interval: Duration::from_secs(settings.catalog.refresh_interval_secs),
            refresh_cooldown: Duration::from_secs(settings.catalog.refresh_cooldown_secs),
            max_consecutive_timeouts: settings.provider.max_consecutive_timeouts.max(1),
        }
    }
}

/// Owns the provider session, its catalog and the background refresh task.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ManagerOptions,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Arc<ProviderSession>>>,
    catalog: Arc<CatalogHandle>,
    shutdown: Mutex<CancellationToken>,
    background: Mutex<Option<JoinHandle<()>>>,
    reconnect_signal: Arc<Notify>,
    consecutive_timeouts: AtomicU32,
    connect_lock: tokio::sync::Mutex<()>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ManagerOptions) -> Arc<Self> {
        Arc::new(Self {
            connector,
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            catalog: Arc::new(CatalogHandle::new()),
            shutdown: Mutex::new(CancellationToken::new()),
            background: Mutex::new(None),
            reconnect_signal: Arc::new(Notify::new()),
            consecutive_timeouts: AtomicU32::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build a manager for the SSE provider named in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Arc<Self>> {
        let connector = SseConnector::new(
            &settings.provider.url,
            settings.provider.token.clone(),
            settings.connect_timeout(),
        )?;
        Ok(Self::new(Arc::new(connector), ManagerOptions::from(settings)))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Read-only view of the tool catalog.
    pub fn catalog(&self) -> &Arc<CatalogHandle> {
        &self.catalog
    }

    pub fn list_tools(&self) -> Vec<Arc<Tool>> {
        self.catalog.list()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<Tool>> {
        self.catalog.get(name)
    }

    /// Name and version the provider announced, while a session is open.
    pub fn server_info(&self) -> Option<Implementation> {
        self.current_session()
            .ok()
            .and_then(|session| session.server_info().cloned())
    }

    /// Protocol version negotiated for the open session.
    pub fn protocol_version(&self) -> Option<String> {
        self.current_session()
            .ok()
            .map(|session| session.protocol_version().to_string())
    }

    /// Establish the session, load the catalog and start the background task.
    ///
    /// Returns immediately if already connected. Fails with the last attempt's
    /// error once the retry bound is exhausted, or with [`GatewayError::Cancelled`]
    /// if [`teardown`](Self::teardown) runs meanwhile.
    #[instrument(skip(self))]
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        // A broken session is already being re-established by the background task
        if self.state().accepts_calls() || self.state() == ConnectionState::Reconnecting {
            return Ok(());
        }

        let cancel = self.shutdown_token();
        self.set_state(ConnectionState::Connecting);

        match self.establish(&cancel).await {
            Ok((session, tools)) => {
                if let Err(session) = self.install(session, tools, &cancel) {
                    close_quietly(&session).await;
                    self.set_state(ConnectionState::Disconnected);
                    return Err(GatewayError::Cancelled);
                }
                self.spawn_background(cancel);
                Ok(())
            }
            Err(GatewayError::Cancelled) => {
                self.set_state(ConnectionState::Disconnected);
                Err(GatewayError::Cancelled)
            }
            Err(e) => {
                error!("Giving up on tool provider: {}", e);
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    /// Re-fetch the catalog now and swap it in.
    ///
    /// Returns the number of tools in the new catalog.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize> {
        let session = self.current_session()?;
        let _guard = self.refresh_lock.lock().await;

        self.transition(&[ConnectionState::Connected], ConnectionState::Refreshing);
        let timeout = self.options.call_timeout;
        let result = tokio::time::timeout(timeout, session.list_tools())
            .await
            .unwrap_or(Err(GatewayError::Timeout(timeout)));
        self.transition(&[ConnectionState::Refreshing], ConnectionState::Connected);

        match result {
            Ok(tools) => {
                let catalog = self.catalog.replace(tools);
                info!(
                    "Catalog refreshed: {} tools (generation {})",
                    catalog.len(),
                    catalog.generation()
                );
                Ok(catalog.len())
            }
            Err(e) => {
                if e.is_session_broken() {
                    self.request_reconnect();
                }
                Err(e)
            }
        }
    }

    /// Call a tool on the provider.
    ///
    /// Fails locally, without any I/O, when not connected or when `name` is not
    /// in the current catalog.
    #[instrument(skip(self, arguments))]
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<CallToolResult> {
        if !self.state().accepts_calls() {
            return Err(GatewayError::NotConnected);
        }
        let session = self.current_session()?;

        let catalog = self.catalog.snapshot();
        if !catalog.contains(name) {
            return Err(GatewayError::ToolNotFound {
                name: name.to_string(),
                available: catalog.names().join(", "),
            });
        }

        let cancel = self.shutdown_token();
        let timeout = self.options.call_timeout;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = tokio::time::timeout(timeout, session.call_tool(name, arguments)) => r,
        };

        match outcome {
            Ok(Ok(result)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                Ok(result)
            }
            Ok(Err(e)) => {
                if e.is_session_broken() {
                    warn!("Provider session closed during call to '{}'", name);
                    self.request_reconnect();
                }
                Err(e)
            }
            Err(_) => {
                let count = self.consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!("Call to '{}' timed out ({} in a row)", name, count);
                if count >= self.options.max_consecutive_timeouts {
                    self.request_reconnect();
                }
                Err(GatewayError::Timeout(timeout))
            }
        }
    }

    /// Stop the background task, close the session and clear the catalog.
    ///
    /// Never fails and may be called any number of times. Afterwards the manager is
    /// Disconnected with an empty catalog and may be connected again.
    #[instrument(skip(self))]
    pub async fn teardown(&self) {
        let cancel = self.shutdown_token();
        cancel.cancel();

        let background = self.background.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = background {
            match handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Background task ended abnormally: {}", e),
            }
        }

        let session = self.session.lock().ok().and_then(|mut slot| slot.take());
        if let Some(session) = session {
            close_quietly(&session).await;
        }

        self.set_state(ConnectionState::Disconnected);
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        if let Ok(mut slot) = self.shutdown.lock() {
            if slot.is_cancelled() {
                *slot = CancellationToken::new();
            }
        }
        self.catalog.clear();
        debug!("Teardown complete");
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn current_session(&self) -> Result<Arc<ProviderSession>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(GatewayError::NotConnected)
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            debug!("Connection state: {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Move to `next` only from one of `from`. Returns whether the move happened.
    fn transition(&self, from: &[ConnectionState], next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if from.contains(&*state) {
            debug!("Connection state: {} -> {}", *state, next);
            *state = next;
            true
        } else {
            false
        }
    }

    /// Publish a fresh session and its catalog.
    ///
    /// Hands the session back if `cancel` has fired. The check and the publish
    /// happen under the session lock, which teardown takes after cancelling, so a
    /// session is either refused here or closed by teardown.
    fn install(
        &self,
        session: ProviderSession,
        tools: Vec<Tool>,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), ProviderSession> {
        let mut slot = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if cancel.is_cancelled() {
            return Err(session);
        }
        let catalog = self.catalog.replace(tools);
        *slot = Some(Arc::new(session));
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        drop(slot);

        info!("Tool provider connected with {} tools", catalog.len());
        Ok(())
    }

    fn request_reconnect(&self) {
        let moved = self.transition(
            &[ConnectionState::Connected, ConnectionState::Refreshing],
            ConnectionState::Reconnecting,
        );
        if moved {
            warn!("Provider session considered broken, reconnecting");
            self.reconnect_signal.notify_one();
        }
    }

    /// Run the retry loop until a session with a loaded catalog is obtained.
    async fn establish(&self, cancel: &CancellationToken) -> Result<(ProviderSession, Vec<Tool>)> {
        let policy = &self.options.retry;
        let mut last_error = GatewayError::Connection("no connection attempt made".to_string());

        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before attempt {}", delay, attempt);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.attempt(cancel).await {
                Ok(established) => {
                    if attempt > 1 {
                        info!("Connected on attempt {}", attempt);
                    }
                    return Ok(established);
                }
                Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "Connection attempt {}/{} failed: {}",
                        attempt, policy.max_attempts, e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// One attempt: open a transport, handshake, load the catalog.
    ///
    /// The transport is closed on every failure path, cancellation included.
    async fn attempt(&self, cancel: &CancellationToken) -> Result<(ProviderSession, Vec<Tool>)> {
        let transport = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            r = self.connector.connect() => r?,
        };

        let timeout = self.options.connect_timeout;
        let setup = async {
            let session = ProviderSession::initialize(Arc::clone(&transport)).await?;
            let tools = session.list_tools().await?;
            Ok::<_, GatewayError>((session, tools))
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            r = tokio::time::timeout(timeout, setup) => {
                r.unwrap_or(Err(GatewayError::Timeout(timeout)))
            }
        };

        if result.is_err() {
            if let Err(e) = transport.close().await {
                debug!("Failed to close transport after failed attempt: {}", e);
            }
        }
        result
    }

    /// Close the broken session and run the retry loop again.
    async fn reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let old = self.session.lock().ok().and_then(|mut slot| slot.take());
        if let Some(old) = old {
            close_quietly(&old).await;
        }
        self.consecutive_timeouts.store(0, Ordering::SeqCst);

        match self.establish(cancel).await {
            Ok((session, tools)) => {
                if let Err(session) = self.install(session, tools, cancel) {
                    close_quietly(&session).await;
                    self.set_state(ConnectionState::Disconnected);
                    return Err(GatewayError::Cancelled);
                }
                Ok(())
            }
            Err(GatewayError::Cancelled) => Err(GatewayError::Cancelled),
            Err(e) => {
                error!("Reconnect failed: {}", e);
                self.catalog.clear();
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) {
        let task = tokio::spawn(supervise(
            Arc::downgrade(self),
            Arc::clone(&self.reconnect_signal),
            cancel,
            self.options.refresh_interval,
            self.options.refresh_cooldown,
        ));
        if let Ok(mut slot) = self.background.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(token) = self.shutdown.lock() {
            token.cancel();
        }
    }
}

async fn close_quietly(session: &ProviderSession) {
    if let Err(e) = session.close().await {
        warn!("Failed to close provider session: {}", e);
    }
}

/// Background loop: periodic catalog refresh plus reconnect on demand.
///
/// Holds only a weak reference so that dropping the manager ends the task.
async fn supervise(
    manager: Weak<ConnectionManager>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
    interval: Duration,
    cooldown: Duration,
) {
    let mut wait = interval;

    loop {
        let reconnect_requested = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => false,
            _ = reconnect.notified() => true,
        };

        let Some(this) = manager.upgrade() else {
            return;
        };

        if reconnect_requested {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                r = this.reconnect(&cancel) => r,
            };
            match result {
                Ok(()) => wait = interval,
                Err(_) => return,
            }
            continue;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            r = this.refresh() => r,
        };
        wait = match result {
            Ok(_) => interval,
            Err(e) => {
                warn!("Catalog refresh failed, retrying in {:?}: {}", cooldown, e);
                cooldown
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::{light_tool, tool_without_params, MockConnector, MockProvider};
    use serde_json::json;
    use std::time::Instant;
    use tokio_test::{assert_err, assert_ok};

    fn fast_options() -> ManagerOptions {
        ManagerOptions {
            retry: RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(200),
            },
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(3600),
            refresh_cooldown: Duration::from_millis(50),
            max_consecutive_timeouts: 2,
        }
    }

    fn manager_with(provider: &Arc<MockProvider>, options: ManagerOptions) -> Arc<ConnectionManager> {
        ConnectionManager::new(MockConnector::new(Arc::clone(provider)), options)
    }

    async fn wait_for_state(manager: &ConnectionManager, wanted: ConnectionState) {
        for _ in 0..200 {
            if manager.state() == wanted {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("state stayed {} instead of {}", manager.state(), wanted);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 8,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        let delays: Vec<u128> = (1..=6).map(|a| policy.delay_before(a).as_millis()).collect();
        assert_eq!(delays, vec![0, 500, 1000, 2000, 3000, 3000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.delay_before(60), Duration::from_secs(3));
    }

    #[test]
    fn test_options_from_settings() {
        let options = ManagerOptions::default();
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.refresh_interval, Duration::from_secs(1800));
        assert_eq!(options.refresh_cooldown, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_loads_catalog() {
        let provider = MockProvider::with_tools(vec![light_tool(), tool_without_params("get_time")]);
        let manager = manager_with(&provider, fast_options());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_ok!(manager.connect().await);

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.catalog().names(), vec!["turn_on_light", "get_time"]);
        assert_eq!(manager.catalog().generation(), 1);

        // Already connected: no second session
        assert_ok!(manager.connect().await);
        assert_eq!(MockProvider::count(&provider.connects), 1);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        provider.fail_connects.store(2, Ordering::SeqCst);
        let manager = manager_with(&provider, fast_options());

        let start = Instant::now();
        assert_ok!(manager.connect().await);

        // 20ms before attempt 2, 40ms before attempt 3
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(MockProvider::count(&provider.connects), 3);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_retry_bound_is_fatal() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        provider.fail_connects.store(5, Ordering::SeqCst);
        let manager = manager_with(&provider, fast_options());

        let err = assert_err!(manager.connect().await);
        assert!(matches!(err, GatewayError::Connection(_)));
        assert_eq!(MockProvider::count(&provider.connects), 5);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_transport() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        provider.fail_initialize.store(2, Ordering::SeqCst);
        let manager = manager_with(&provider, fast_options());

        assert_ok!(manager.connect().await);
        assert_eq!(MockProvider::count(&provider.connects), 3);
        assert_eq!(MockProvider::count(&provider.closes), 2);
        manager.teardown().await;
        assert_eq!(MockProvider::count(&provider.closes), 3);
    }

    #[tokio::test]
    async fn test_teardown_cancels_retry_sleep() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        provider.fail_connects.store(100, Ordering::SeqCst);
        let mut options = fast_options();
        options.retry.initial_delay = Duration::from_secs(3600);
        options.retry.max_delay = Duration::from_secs(3600);
        let manager = manager_with(&provider, options);

        let connecting = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.connect().await })
        };
        wait_for_state(&manager, ConnectionState::Connecting).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.teardown().await;
        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .expect("connect should observe cancellation promptly")
            .unwrap();

        assert!(matches!(result, Err(GatewayError::Cancelled)));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_teardown_clears_and_fails_fast() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        manager.teardown().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.list_tools().is_empty());

        let err = assert_err!(manager.call("turn_on_light", &json!({"name": "kitchen"})).await);
        assert!(matches!(err, GatewayError::NotConnected));
        assert_eq!(MockProvider::count(&provider.tool_calls), 0);

        // Idempotent
        manager.teardown().await;
        assert_eq!(MockProvider::count(&provider.closes), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_teardown() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);
        manager.teardown().await;

        assert_ok!(manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.catalog().len(), 1);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_unknown_tool_is_local_error() {
        let provider = MockProvider::with_tools(vec![light_tool(), tool_without_params("get_time")]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        let err = assert_err!(manager.call("open_garage", &json!({})).await);
        match err {
            GatewayError::ToolNotFound { name, available } => {
                assert_eq!(name, "open_garage");
                assert_eq!(available, "turn_on_light, get_time");
            }
            other => panic!("Expected ToolNotFound, got {:?}", other),
        }
        assert_eq!(MockProvider::count(&provider.tool_calls), 0);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_call_reaches_provider() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        let result = assert_ok!(manager.call("turn_on_light", &json!({"name": "kitchen"})).await);
        assert_eq!(result.to_text(), "ok");
        assert_eq!(
            provider.last_call.lock().unwrap().clone(),
            Some(("turn_on_light".to_string(), json!({"name": "kitchen"})))
        );
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_on_demand_refresh_replaces_catalog() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        provider.set_tools(vec![tool_without_params("get_time")]);
        assert_eq!(assert_ok!(manager.refresh().await), 1);

        assert_eq!(manager.catalog().names(), vec!["get_time"]);
        assert_eq!(manager.catalog().generation(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_periodic_refresh_and_cooldown() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let mut options = fast_options();
        options.refresh_interval = Duration::from_millis(100);
        options.refresh_cooldown = Duration::from_millis(20);
        let manager = manager_with(&provider, options);
        assert_ok!(manager.connect().await);

        // A failing refresh keeps the connection and the old catalog
        provider.fail_list.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.catalog().names(), vec!["turn_on_light"]);
        let failed_attempts = MockProvider::count(&provider.list_requests);
        assert!(failed_attempts >= 3, "cooldown retries expected, saw {}", failed_attempts);

        provider.set_tools(vec![light_tool(), tool_without_params("get_time")]);
        provider.fail_list.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.catalog().len(), 2);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_hung_refresh_times_out_and_session_recovers() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let mut options = fast_options();
        options.refresh_interval = Duration::from_millis(50);
        options.refresh_cooldown = Duration::from_millis(20);
        let manager = manager_with(&provider, options);
        assert_ok!(manager.connect().await);
        let listed = MockProvider::count(&provider.list_requests);

        // Each refresh gives up after the call timeout and is retried
        provider.hang_list.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.state().accepts_calls());
        assert_eq!(manager.catalog().names(), vec!["turn_on_light"]);
        let attempts = MockProvider::count(&provider.list_requests) - listed;
        assert!(attempts >= 2, "refresh retries expected, saw {}", attempts);

        // A broken session is still noticed and replaced
        provider.break_calls.store(true, Ordering::SeqCst);
        let err = assert_err!(manager.call("turn_on_light", &json!({"name": "hall"})).await);
        assert!(matches!(err, GatewayError::TransportClosed));
        provider.break_calls.store(false, Ordering::SeqCst);
        provider.hang_list.store(false, Ordering::SeqCst);

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(MockProvider::count(&provider.connects), 2);
        assert_ok!(manager.call("turn_on_light", &json!({"name": "hall"})).await);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_session_refused_after_teardown_signal() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let connector = MockConnector::new(Arc::clone(&provider));
        let manager = manager_with(&provider, fast_options());

        let transport = assert_ok!(connector.connect().await);
        let session = assert_ok!(ProviderSession::initialize(transport).await);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(manager.install(session, vec![], &cancel).is_err());

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.catalog().is_empty());
        assert!(matches!(manager.current_session(), Err(GatewayError::NotConnected)));
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_trigger_reconnect() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        provider.hang_calls.store(true, Ordering::SeqCst);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        let args = json!({"name": "kitchen"});
        let err = assert_err!(manager.call("turn_on_light", &args).await);
        assert!(matches!(err, GatewayError::Timeout(_)));
        assert_eq!(manager.state(), ConnectionState::Connected);

        assert_err!(manager.call("turn_on_light", &args).await);
        provider.hang_calls.store(false, Ordering::SeqCst);

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(MockProvider::count(&provider.connects), 2);
        assert!(MockProvider::count(&provider.closes) >= 1);

        assert_ok!(manager.call("turn_on_light", &args).await);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_closed_transport_triggers_reconnect() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let manager = manager_with(&provider, fast_options());
        assert_ok!(manager.connect().await);

        provider.break_calls.store(true, Ordering::SeqCst);
        let err = assert_err!(manager.call("turn_on_light", &json!({"name": "hall"})).await);
        assert!(matches!(err, GatewayError::TransportClosed));
        provider.break_calls.store(false, Ordering::SeqCst);

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert_eq!(MockProvider::count(&provider.connects), 2);
        manager.teardown().await;
    }

    #[tokio::test]
    async fn test_dropping_manager_stops_background_task() {
        let provider = MockProvider::with_tools(vec![light_tool()]);
        let mut options = fast_options();
        options.refresh_interval = Duration::from_millis(20);
        let manager = manager_with(&provider, options);
        assert_ok!(manager.connect().await);
        drop(manager);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = MockProvider::count(&provider.list_requests);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(MockProvider::count(&provider.list_requests), seen);
    }
}
