use std::path::Path;

use anyhow::{Context, Result};
use forge_protocol::ForgeConfig;

pub use forge_protocol::{AgentConfig, SandboxConfig, ServerConfig, SessionConfig};

/// Load configuration from a TOML file at the given path, then apply
/// environment-variable overrides. If the file doesn't exist, starts from
/// defaults.
pub fn load_config(path: &Path) -> Result<ForgeConfig> {
    let mut config = if !path.exists() {
        tracing::warn!("Config file not found at {}, using defaults", path.display());
        ForgeConfig {
            server: ServerConfig::default(),
            sandbox: SandboxConfig::default(),
            session: SessionConfig::default(),
            agent: AgentConfig::default(),
        }
    } else {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ForgeConfig = toml::from_str(&contents).context("Failed to parse config TOML")?;
        tracing::info!("Loaded config from {}", path.display());
        config
    };

    config.apply_env_overrides();
    Ok(config)
}
