use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::resolver::ConflictStrategy;
use crate::{llog_debug, Error, Result};

fn default_concurrency_limit() -> usize {
    2
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_history_limit() -> usize {
    30
}

fn default_stream_capacity() -> usize {
    256
}

/// Engine configuration, loaded from `~/.lattice/lattice.toml`.
///
/// Every field has a default so a missing or partial file works. The
/// conflict strategy is a deployment-level setting, not a per-call one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks the orchestrator will have dispatched at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// How a remote record update is reconciled against the local one.
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Interval between stream keep-alive messages.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long `stop` waits for in-flight tasks to acknowledge cancellation
    /// before forcing the transition to idle.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Undo/redo stack bound (oldest entries evicted beyond this).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Broadcast channel capacity per project stream.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            conflict_strategy: ConflictStrategy::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            history_limit: default_history_limit(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn lattice_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".lattice"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::lattice_dir()?.join("lattice.toml"))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        llog_debug!("EngineConfig::load path={}", path.display());
        if !path.exists() {
            llog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        if config.concurrency_limit == 0 {
            return Err(Error::Validation(
                "concurrency_limit must be a positive integer".to_string(),
            ));
        }
        llog_debug!(
            "Config loaded: concurrency_limit={}, strategy={:?}",
            config.concurrency_limit,
            config.conflict_strategy
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::lattice_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        llog_debug!("Config saved to {}", path.display());
        Ok(())
    }
}
