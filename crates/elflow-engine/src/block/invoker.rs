//! Turning a [`BlockSpec`] into a ready-to-spawn command.

use std::io::Write;

use elflow_types::state::StateMap;
use tempfile::{NamedTempFile, TempPath};
use tokio::process::Command;

use super::{BlockError, BlockRole, BlockSpec};

/// Env var holding the path of the plugin config scratch file.
pub const CONFIG_PATH_ENV: &str = "ELFLOW_CONFIG_PATH";
/// Env var holding the path of the incoming state scratch file.
pub const STATE_PATH_ENV: &str = "ELFLOW_STATE_PATH";

/// Per-run inputs to a block beyond its static spec.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    /// Bookmarks to resume from; only passed to extractors.
    pub incoming_state: Option<StateMap>,
    /// Extra variables applied after the block's own environment.
    pub env: Vec<(String, String)>,
}

/// A prepared command plus the scratch files it references.
///
/// The scratch files are deleted when the block that took them over has
/// exited, or when the invocation is dropped unused.
#[derive(Debug)]
pub struct Invocation {
    pub command: Command,
    pub scratch: Vec<TempPath>,
}

/// Builds the process for a block.
pub trait PluginInvoker: Send + Sync {
    /// # Errors
    ///
    /// Returns [`BlockError`] if scratch inputs cannot be written.
    fn prepare(&self, spec: &BlockSpec, ctx: &InvocationContext) -> Result<Invocation, BlockError>;
}

/// Runs the plugin's configured executable directly.
///
/// Environment precedence, lowest first: inherited process env, plugin
/// `env`, task-set overrides, context env. Plugin `config` is written to a
/// scratch JSON file passed as `--config <path>` and `ELFLOW_CONFIG_PATH`;
/// incoming state likewise as `--state <path>` and `ELFLOW_STATE_PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutableInvoker;

impl ExecutableInvoker {
    fn scratch_json(
        spec: &BlockSpec,
        prefix: &str,
        value: &impl serde::Serialize,
    ) -> Result<TempPath, BlockError> {
        let prepare_err = |source| BlockError::Prepare {
            block: spec.name().to_string(),
            source,
        };
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".json")
            .tempfile()
            .map_err(prepare_err)?;
        serde_json::to_writer(&mut file, value)?;
        file.flush().map_err(prepare_err)?;
        Ok(NamedTempFile::into_temp_path(file))
    }
}

impl PluginInvoker for ExecutableInvoker {
    fn prepare(&self, spec: &BlockSpec, ctx: &InvocationContext) -> Result<Invocation, BlockError> {
        let plugin = &spec.plugin;
        let mut command = Command::new(plugin.executable());
        command
            .args(&plugin.args)
            .envs(&plugin.env)
            .envs(&spec.env)
            .envs(ctx.env.iter().map(|(k, v)| (k, v)));

        let mut scratch = Vec::new();

        if let Some(config) = &plugin.config {
            let path = Self::scratch_json(spec, "elflow-config-", config)?;
            command
                .arg("--config")
                .arg(path.as_os_str())
                .env(CONFIG_PATH_ENV, path.as_os_str());
            scratch.push(path);
        }

        if spec.role() == BlockRole::Extractor {
            if let Some(state) = &ctx.incoming_state {
                let path = Self::scratch_json(spec, "elflow-state-", state)?;
                command
                    .arg("--state")
                    .arg(path.as_os_str())
                    .env(STATE_PATH_ENV, path.as_os_str());
                scratch.push(path);
            }
        }

        tracing::debug!(
            block = spec.name(),
            executable = plugin.executable(),
            scratch_files = scratch.len(),
            "Prepared block invocation"
        );

        Ok(Invocation { command, scratch })
    }
}
