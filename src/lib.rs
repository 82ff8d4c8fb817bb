//! home-agent - Tool connection and invocation gateway
//!
//! The tool-facing half of a conversational home-automation agent.
//!
//! # Overview
//!
//! home-agent:
//! - Connects to a remote tool provider (MCP over HTTP + SSE) with bounded retries
//! - Keeps a catalog of the provider's tools, refreshed periodically and on demand
//! - Validates and invokes tool calls, turning failures into text the model can act on
//! - Records execution traces of agent runs into a local SQLite store
//!
//! # Architecture
//!
//! - `config` - Configuration management
//! - `provider` - Wire protocol, SSE transport and provider session
//! - `catalog` - Tool catalog snapshots
//! - `connection` - Connection lifecycle, retries and background refresh
//! - `schema` - Argument validation against tool schemas
//! - `gateway` - The tool surface handed to the agent
//! - `traces` - Span recording, export queue and trace store
//! - `server` - HTTP API
//!
//! # Example
//!
//! ```rust,no_run
//! use home_agent::config::Settings;
//! use home_agent::connection::ConnectionManager;
//! use home_agent::gateway::InvocationGateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let manager = ConnectionManager::from_settings(&settings)?;
//!     manager.connect().await?;
//!
//!     let gateway = InvocationGateway::new(manager.clone());
//!     let output = gateway.invoke("turn_on_light", r#"{"name": "kitchen"}"#).await?;
//!     println!("{}", output);
//!
//!     manager.teardown().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod schema;
pub mod server;
pub mod traces;

pub use error::{GatewayError, Result};
