//! HTTP API server for the agent runtime.
//!
//! Connects to the tool provider, then exposes the catalog, tool invocation and
//! stored traces over REST until Ctrl+C.

use crate::cli::Output;
use crate::config::Settings;
use crate::gateway::InvocationGateway;
use crate::server::{router, AppState};
use tracing::info;

/// Run the HTTP API server.
pub async fn run_serve(host: Option<&str>, port: Option<u16>, settings: Settings) -> anyhow::Result<()> {
    let host = host.unwrap_or(&settings.server.host).to_string();
    let port = port.unwrap_or(settings.server.port);

    let exporter = super::start_exporter(&settings)?;
    let manager = super::connect(&settings).await?;
    let state = AppState::new(InvocationGateway::new(manager.clone()), exporter.clone());
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("home-agent API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    Output::kv("Provider", &settings.provider.url);
    Output::kv("Tools", &manager.catalog().len().to_string());
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /api/health");
    Output::kv("List Tools", "GET  /api/tools");
    Output::kv("Refresh Tools", "POST /api/tools/refresh");
    Output::kv("Get Tool", "GET  /api/tools/:name");
    Output::kv("Invoke Tool", "POST /api/tools/:name/invoke");
    Output::kv("Trace Spans", "GET  /api/traces/:trace_id/spans");
    Output::kv("Conversation", "GET  /api/conversations/:group_id/traces");
    Output::kv("Neighbors", "GET  /api/conversations/:group_id/neighbors");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down");
    manager.teardown().await;
    if let Some(exporter) = &exporter {
        exporter.shutdown().await;
    }

    Ok(())
}
