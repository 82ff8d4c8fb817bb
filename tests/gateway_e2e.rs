//! End-to-end tests against an in-process provider over real HTTP + SSE.

mod support;

use home_agent::config::Settings;
use home_agent::connection::{ConnectionManager, ConnectionState};
use home_agent::gateway::{InvocationGateway, NOT_CONNECTED_MESSAGE};
use home_agent::server::{router, AppState};
use home_agent::traces::{SqliteTraceStore, TraceExporter};
use home_agent::GatewayError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::{FakeProvider, TOKEN};
use tokio_test::{assert_err, assert_ok};

fn settings_for(provider: &FakeProvider) -> Settings {
    let mut settings = Settings::default();
    settings.provider.url = provider.sse_url();
    settings.provider.token = Some(TOKEN.to_string());
    settings.provider.connect_timeout_secs = 5;
    settings.provider.call_timeout_secs = 5;
    settings.retry.max_attempts = 3;
    settings.retry.initial_delay_ms = 10;
    settings.retry.max_delay_ms = 50;
    settings.traces.enabled = false;
    settings
}

async fn connected(provider: &FakeProvider) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::from_settings(&settings_for(provider)).unwrap();
    assert_ok!(manager.connect().await);
    manager
}

/// Poll until `check` holds or two seconds pass.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_connect_fetches_every_catalog_page() {
    let provider = FakeProvider::start().await;
    let manager = connected(&provider).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        manager.catalog().names(),
        vec!["turn_on_light", "get_temperature", "unlock_door"]
    );
    assert!(!manager.get_tool("get_temperature").unwrap().has_parameters());
    assert_eq!(provider.connects(), 1);

    manager.teardown().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.catalog().is_empty());
}

#[tokio::test]
async fn test_invocations_and_diagnostics() {
    let provider = FakeProvider::start().await;
    let manager = connected(&provider).await;
    let gateway = InvocationGateway::new(manager.clone());

    let output = gateway
        .invoke("turn_on_light", r#"{"name": "kitchen", "brightness": 80}"#)
        .await
        .unwrap();
    assert_eq!(output, "Turned on kitchen");

    assert_eq!(gateway.invoke("get_temperature", "").await.unwrap(), "21.5");

    let reported = gateway.invoke("unlock_door", r#"{"door": "front"}"#).await.unwrap();
    assert_eq!(reported, "Tool 'unlock_door' reported an error: door is jammed");

    // Rejected locally: none of these reach the provider
    let missing = gateway.invoke("turn_on_light", "{}").await.unwrap();
    assert!(missing.starts_with("Invalid arguments for tool 'turn_on_light'"));

    let extra = gateway
        .invoke("turn_on_light", r#"{"name": "hall", "colour": "red"}"#)
        .await
        .unwrap();
    assert!(extra.starts_with("Invalid arguments for tool 'turn_on_light'"));

    let garbled = gateway.invoke("turn_on_light", "{name: kitchen").await.unwrap();
    assert!(garbled.starts_with("Invalid JSON input for tool 'turn_on_light'"));

    let unknown = gateway.invoke("open_garage", "{}").await.unwrap();
    assert!(unknown.contains("not found"));
    assert!(unknown.contains("turn_on_light"));

    assert_eq!(provider.state().calls.load(std::sync::atomic::Ordering::SeqCst), 3);

    manager.teardown().await;
    assert_eq!(gateway.invoke("get_temperature", "").await.unwrap(), NOT_CONNECTED_MESSAGE);
}

#[tokio::test]
async fn test_rejected_token_exhausts_retries() {
    let provider = FakeProvider::start().await;
    let mut settings = settings_for(&provider);
    settings.provider.token = Some("wrong".to_string());
    settings.retry.max_attempts = 2;

    let manager = ConnectionManager::from_settings(&settings).unwrap();
    let err = assert_err!(manager.connect().await);
    assert!(matches!(err, GatewayError::Connection(_)));
    assert_eq!(manager.state(), ConnectionState::Failed);
    assert_eq!(provider.connects(), 0);
}

#[tokio::test]
async fn test_refresh_picks_up_catalog_changes() {
    let provider = FakeProvider::start().await;
    let manager = connected(&provider).await;
    let generation = manager.catalog().generation();

    provider.set_tools(vec![json!({
        "name": "play_music",
        "description": "Play a playlist",
        "inputSchema": {"type": "object", "properties": {"playlist": {"type": "string"}}}
    })]);

    assert_eq!(manager.refresh().await.unwrap(), 1);
    assert_eq!(manager.catalog().names(), vec!["play_music"]);
    assert!(manager.catalog().generation() > generation);
    assert!(manager.get_tool("turn_on_light").is_none());

    manager.teardown().await;
}

#[tokio::test]
async fn test_reconnects_after_provider_drops_stream() {
    let provider = FakeProvider::start().await;
    let manager = connected(&provider).await;
    let gateway = InvocationGateway::new(manager.clone());

    provider.drop_stream();
    // Give the reader task time to see the end of the stream
    tokio::time::sleep(Duration::from_millis(200)).await;

    let failed = gateway.invoke("get_temperature", "").await.unwrap();
    assert_eq!(
        failed,
        "An error occurred while running the tool 'get_temperature'. Please try again."
    );

    assert!(eventually(|| manager.state() == ConnectionState::Connected).await);
    assert_eq!(provider.connects(), 2);
    assert_eq!(gateway.invoke("get_temperature", "").await.unwrap(), "21.5");

    manager.teardown().await;
}

#[tokio::test]
async fn test_http_api_records_traces() {
    let provider = FakeProvider::start().await;
    let manager = connected(&provider).await;

    let store = Arc::new(SqliteTraceStore::in_memory().unwrap());
    let exporter = TraceExporter::start(Arc::clone(&store), 16);
    let state = AppState::new(InvocationGateway::new(manager.clone()), Some(exporter.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/api/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["connection"], "connected");
    assert_eq!(health["tools"], 3);
    assert_eq!(health["provider"]["name"], "fake-home");
    assert_eq!(health["protocol_version"], "2024-11-05");

    let response = client
        .post(format!("{}/api/tools/turn_on_light/invoke", base))
        .json(&json!({"arguments": {"name": "hall"}, "group_id": "conv_1"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let invoked: Value = response.json().await.unwrap();
    assert_eq!(invoked["output"], "Turned on hall");
    let trace_id = invoked["trace_id"].as_str().unwrap().to_string();

    // Raw argument text is passed through to the gateway unchanged
    let raw: Value = client
        .post(format!("{}/api/tools/turn_on_light/invoke", base))
        .json(&json!({"arguments": "{not json"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(raw["output"].as_str().unwrap().starts_with("Invalid JSON input"));

    let missing = client
        .get(format!("{}/api/tools/open_garage", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    // Drain the export queue before reading back
    exporter.shutdown().await;

    let spans: Value = client
        .get(format!("{}/api/traces/{}/spans", base, trace_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let spans = spans.as_array().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0]["span_type"], "function");
    assert_eq!(spans[0]["span_data"]["output"], "Turned on hall");

    let traces: Value = client
        .get(format!("{}/api/conversations/conv_1/traces", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(traces.as_array().unwrap().len(), 1);
    assert_eq!(traces[0]["trace_id"], trace_id.as_str());

    manager.teardown().await;
}
