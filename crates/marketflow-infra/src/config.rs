//! Engine configuration loader for MarketFlow.
//!
//! Reads `config.toml` from the data directory (`~/.marketflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or invalid.

use std::path::{Path, PathBuf};

use anyhow::{ensure, Context};
use marketflow_types::config::EngineConfig;

/// File name looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.toml";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file cannot be read, parsed or validated, logs a warning and
///   returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    match tokio::fs::try_exists(&config_path).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "cannot stat config.toml, using defaults");
            return EngineConfig::default();
        }
    }

    match read_engine_config(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                path = %config_path.display(),
                error = %format_args!("{err:#}"),
                "invalid engine config, using defaults"
            );
            EngineConfig::default()
        }
    }
}

/// Read and validate an engine configuration file, failing on any problem.
pub async fn read_engine_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: EngineConfig =
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    validate(&config).with_context(|| format!("invalid settings in {}", path.display()))?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> anyhow::Result<()> {
    ensure!(config.default_step_timeout_secs > 0, "default_step_timeout_secs must be positive");
    ensure!(config.max_concurrency > 0, "max_concurrency must be at least 1");
    ensure!(config.event_capacity > 0, "event_capacity must be at least 1");

    let budget = &config.budget;
    for (name, ceiling) in [
        ("cpu_ceiling", budget.cpu_ceiling),
        ("memory_ceiling", budget.memory_ceiling),
        ("network_ceiling", budget.network_ceiling),
    ] {
        ensure!(ceiling > 0.0 && ceiling <= 1.0, "budget.{name} must be in (0, 1], got {ceiling}");
    }

    for strategy in &config.recovery {
        ensure!(strategy.max_attempts >= 1, "recovery max_attempts must be at least 1");
    }
    Ok(())
}

/// Resolve the data directory.
///
/// Priority:
/// 1. `MARKETFLOW_DATA_DIR` environment variable
/// 2. `~/.marketflow`
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MARKETFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".marketflow");
    }
    PathBuf::from(".marketflow")
}
