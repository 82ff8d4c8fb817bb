//! Config command implementation.

use crate::cli::{ConfigAction, Output};
use crate::config::Settings;
use anyhow::Result;
use std::path::PathBuf;

/// Run the config command.
pub fn run_config(action: &ConfigAction, settings: Settings, config_path: Option<PathBuf>) -> Result<()> {
    let config_path = config_path.unwrap_or_else(Settings::default_config_path);

    match action {
        ConfigAction::Show => {
            let mut shown = settings;
            if shown.provider.token.is_some() {
                shown.provider.token = Some("********".to_string());
            }
            let toml_str = toml::to_string_pretty(&shown)
                .map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))?;
            println!("{}", toml_str);
        }

        ConfigAction::Init { force } => {
            if config_path.exists() && !force {
                Output::warning(&format!("Config already exists at {:?}", config_path));
                Output::info("Use --force to overwrite it.");
                return Ok(());
            }
            Settings::default().save_to(&config_path)?;
            Output::success(&format!("Created default config at {:?}", config_path));
            Output::info("Set provider.url (and provider.token) before connecting.");
        }

        ConfigAction::Check => match settings.validate() {
            Ok(()) => {
                Output::success("Configuration is valid.");
                Output::kv("Provider", &settings.provider.url);
                Output::kv(
                    "Token",
                    if settings.provider.token.is_some() { "set" } else { "not set" },
                );
                Output::kv(
                    "Traces",
                    &if settings.traces.enabled {
                        settings.traces_path().display().to_string()
                    } else {
                        "disabled".to_string()
                    },
                );
            }
            Err(e) => {
                Output::error(&e.to_string());
                return Err(e.into());
            }
        },

        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }

    Ok(())
}
