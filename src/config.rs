//! Supervisor configuration, loadable from a TOML file.
//!
//! ```toml
//! heartbeat_interval_ms = 500
//! log_dir = "/var/log/process-supervisor"
//! restart_base_delay_ms = 1000
//! mod_dir = "/etc/process-supervisor/mods"
//!
//! [mods.TaskDirLoader]
//! task_dir = "/etc/process-supervisor/tasks"
//!
//! [mods.HookTrigger]
//! enable = false
//! ```

use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::Result, plugin::ModConfig, SupervisorError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pause between two `HEARTBEAT` events.
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Root of the per-task stdout/stderr log files.
    pub log_dir: PathBuf,
    /// First auto-restart delay; doubled on each further attempt.
    #[serde(rename = "restart_base_delay_ms", with = "duration_ms")]
    pub restart_base_delay: Duration,
    /// Directory of plugin manifests loaded at build time, if any.
    pub mod_dir: Option<PathBuf>,
    /// Per-plugin configuration keyed by plugin name.
    pub mods: HashMap<String, ModConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            log_dir: PathBuf::from("logs"),
            restart_base_delay: Duration::from_secs(1),
            mod_dir: None,
            mods: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .map_err(|e| SupervisorError::Config(e.to_string()).logged())?;
        if config.heartbeat_interval.is_zero() {
            return Err(
                SupervisorError::Config("heartbeat_interval_ms must be positive".into()).logged(),
            );
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SupervisorError::Config(format!("couldn't read {}: {e}", path.display())).logged()
        })?;
        tracing::info!("read config from {}", path.display());
        Self::from_toml_str(&raw)
    }

    /// The configuration of plugin `name`, enabled with no options when absent.
    pub fn mod_config(&self, name: &str) -> ModConfig {
        self.mods.get(name).cloned().unwrap_or_default()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
