//! Configuration module for the orchestrator
//!
//! Provides `OrchestratorConfig`/`PortalConfig` with a fluent builder,
//! getter accessors, and TOML file loading for the binary.

pub mod builder;
pub mod getters;
pub mod types;

pub use builder::PortalConfigBuilder;
pub use types::{OrchestratorConfig, PortalConfig, PortalSelectors, Tunables};

use std::path::Path;

use anyhow::Context;

/// Load the orchestrator configuration from a TOML file.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<OrchestratorConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: OrchestratorConfig = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    if config.portals.is_empty() {
        anyhow::bail!("Config {} declares no portals", path.display());
    }
    for portal in &config.portals {
        url::Url::parse(portal.entry_url())
            .with_context(|| format!("Portal {} has an invalid entry_url", portal.name()))?;
        url::Url::parse(portal.dashboard_url())
            .with_context(|| format!("Portal {} has an invalid dashboard_url", portal.name()))?;
    }

    Ok(config)
}
