//! Project configuration types (`elflow.yaml`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use elflow_state::StateStoreSettings;
use elflow_types::job::{StaleThresholds, HEARTBEATLESS_JOB_VALID, HEARTBEAT_VALID};
use serde::{Deserialize, Serialize};

use crate::block::BlockRole;

/// Top-level project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    #[serde(default = "default_version")]
    pub version: String,
    /// Prefix for generated state ids (`<environment>:<extractor>-to-<loader>`).
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub state_backend: StateStoreSettings,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub task_sets: Vec<TaskSetConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_environment() -> String {
    "dev".to_string()
}

impl ProjectConfig {
    #[must_use]
    pub fn plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn task_set(&self, name: &str) -> Option<&TaskSetConfig> {
        self.task_sets.iter().find(|t| t.name == name)
    }
}

/// One executable plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    pub name: String,
    pub role: BlockRole,
    /// Program to run; defaults to `name` (looked up on `PATH`).
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Written to a scratch JSON file and passed with `--config`.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl PluginConfig {
    #[must_use]
    pub fn executable(&self) -> &str {
        self.executable.as_deref().unwrap_or(&self.name)
    }
}

/// Named, reusable list of tasks with shared environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSetConfig {
    pub name: String,
    /// Plugin or task-set names. An entry may hold several names separated
    /// by whitespace (`"tap-csv target-jsonl"`).
    pub tasks: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Job tracking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// `SQLite` file holding the `runs` table.
    #[serde(default = "default_system_db")]
    pub system_db: PathBuf,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeatless_secs")]
    pub heartbeatless_secs: u64,
    #[serde(default = "default_heartbeat_validity_secs")]
    pub heartbeat_validity_secs: u64,
}

fn default_system_db() -> PathBuf {
    PathBuf::from(".elflow/system.db")
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_heartbeatless_secs() -> u64 {
    HEARTBEATLESS_JOB_VALID.as_secs()
}

fn default_heartbeat_validity_secs() -> u64 {
    HEARTBEAT_VALID.as_secs()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            system_db: default_system_db(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeatless_secs: default_heartbeatless_secs(),
            heartbeat_validity_secs: default_heartbeat_validity_secs(),
        }
    }
}

impl JobConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn stale_thresholds(&self) -> StaleThresholds {
        StaleThresholds {
            heartbeatless: Duration::from_secs(self.heartbeatless_secs),
            heartbeat_validity: Duration::from_secs(self.heartbeat_validity_secs),
        }
    }
}
