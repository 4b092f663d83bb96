//! Blocks: one plugin process each, wired stdout-to-stdin into a pipeline.

pub mod invoker;
pub mod sink;
pub mod subprocess;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::types::PluginConfig;
use crate::signals::CancelReason;

pub use invoker::{ExecutableInvoker, Invocation, InvocationContext, PluginInvoker};
pub use sink::{LineSink, OutputStream, StateCapture, TracingSink};
pub use subprocess::{SubprocessBlock, GRACEFUL_STOP_TIMEOUT};

/// What a plugin does in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockRole {
    Extractor,
    Mapper,
    Loader,
    Utility,
}

impl BlockRole {
    /// Writes protocol messages to stdout for the next block.
    #[must_use]
    pub fn is_producer(self) -> bool {
        matches!(self, Self::Extractor | Self::Mapper)
    }

    /// Reads protocol messages from stdin.
    #[must_use]
    pub fn is_consumer(self) -> bool {
        matches!(self, Self::Mapper | Self::Loader)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extractor => "extractor",
            Self::Mapper => "mapper",
            Self::Loader => "loader",
            Self::Utility => "utility",
        }
    }
}

impl std::fmt::Display for BlockRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin resolved for one position in a run, with the environment
/// overrides of the task set(s) it was expanded from.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub plugin: PluginConfig,
    pub env: BTreeMap<String, String>,
}

impl BlockSpec {
    #[must_use]
    pub fn new(plugin: PluginConfig) -> Self {
        Self {
            plugin,
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    #[must_use]
    pub fn role(&self) -> BlockRole {
        self.plugin.role
    }
}

/// Errors from preparing, running, or stopping blocks.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("invalid block set: {0}")]
    InvalidBlockSet(String),

    #[error("failed to prepare block '{block}': {source}")]
    Prepare {
        block: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start block '{block}': {source}")]
    Spawn {
        block: String,
        #[source]
        source: std::io::Error,
    },

    #[error("block '{block}' is not running")]
    NotStarted { block: String },

    #[error("I/O error on block '{block}': {source}")]
    Io {
        block: String,
        #[source]
        source: std::io::Error,
    },

    #[error("block '{block}' {}", describe_exit(*code))]
    BlockFailed { block: String, code: Option<i32> },

    #[error("run cancelled ({0})")]
    Cancelled(CancelReason),

    #[error("block supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to serialize plugin input: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was killed by a signal".to_string(),
    }
}
