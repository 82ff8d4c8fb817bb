//! Configuration module for home-agent.
//!
//! Handles loading settings from the TOML config file and `HOME_AGENT_*` environment overrides.

mod settings;

pub use settings::{
    CatalogSettings, GeneralSettings, ProviderSettings, RetrySettings, ServerSettings, Settings,
    TraceSettings, ENV_PREFIX,
};
