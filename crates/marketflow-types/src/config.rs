//! Engine configuration loaded from `config.toml`.

use serde::{Deserialize, Serialize};

use crate::recovery::RecoveryStrategy;

/// Engine-wide settings.
///
/// Every field has a default, so an empty `config.toml` is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout for steps that declare none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Upper bound on concurrently running group members.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub limiter_scope: LimiterScope,

    #[serde(default)]
    pub budget: ResourceBudget,

    /// Recovery strategies. Empty means the built-in table.
    #[serde(default)]
    pub recovery: Vec<RecoveryStrategy>,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            event_capacity: default_event_capacity(),
            max_concurrency: default_max_concurrency(),
            limiter_scope: LimiterScope::default(),
            budget: ResourceBudget::default(),
            recovery: Vec::new(),
        }
    }
}

/// Whether the concurrency bound applies per group or across the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterScope {
    #[default]
    PerGroup,
    EngineWide,
}

/// Ceilings on the summed weights of concurrently running steps, as
/// fractions of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default = "default_ceiling")]
    pub cpu_ceiling: f64,
    #[serde(default = "default_ceiling")]
    pub memory_ceiling: f64,
    #[serde(default = "default_ceiling")]
    pub network_ceiling: f64,
}

fn default_ceiling() -> f64 {
    1.0
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self {
            cpu_ceiling: default_ceiling(),
            memory_ceiling: default_ceiling(),
            network_ceiling: default_ceiling(),
        }
    }
}
