//! Runtime configuration sourced from the environment.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Checkpoint durability policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// `save` completes before the executor proceeds to the next node.
    Strict,
    /// Saves go through a bounded flush queue drained in the background.
    #[default]
    Async,
    /// No persistence.
    Off,
}

impl FromStr for CheckpointMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "async" => Ok(Self::Async),
            "off" => Ok(Self::Off),
            other => Err(format!("unknown checkpoint mode '{other}'")),
        }
    }
}

/// Knobs affecting core behaviour, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Graph-wide step budget (`MAX_STEPS`).
    pub max_steps: usize,
    /// Per-node invocation timeout (`DEFAULT_NODE_TIMEOUT`, seconds).
    pub node_timeout: Duration,
    /// Checkpoint durability (`CHECKPOINT_MODE`).
    pub checkpoint_mode: CheckpointMode,
    /// Session expiry (`SESSION_TTL`, seconds).
    pub session_ttl: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            node_timeout: Duration::from_secs(30),
            checkpoint_mode: CheckpointMode::Async,
            session_ttl: Duration::from_secs(1800),
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the process environment. Invalid values fall
    /// back to defaults with a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_steps: parse_var("MAX_STEPS", defaults.max_steps),
            node_timeout: Duration::from_secs(parse_var(
                "DEFAULT_NODE_TIMEOUT",
                defaults.node_timeout.as_secs(),
            )),
            checkpoint_mode: parse_var("CHECKPOINT_MODE", defaults.checkpoint_mode),
            session_ttl: Duration::from_secs(parse_var(
                "SESSION_TTL",
                defaults.session_ttl.as_secs(),
            )),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
