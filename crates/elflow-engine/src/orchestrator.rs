//! Run orchestration: expand tasks, track the run as a job, execute block
//! sets in order, and persist captured state.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use elflow_state::{JobStore, SqliteJobStore, StateStore, StateStoreRegistry};
use elflow_types::state::{StateId, StateMap, StateRecord};
use serde_json::Value;

use crate::block::{BlockError, ExecutableInvoker, PluginInvoker};
use crate::config::types::ProjectConfig;
use crate::errors::PipelineError;
use crate::job::{fail_stale_jobs, Job, PayloadHandle};
use crate::pipeline::{run_utility, BlockParser, BlockSet, ExtractLoadBlocks, ExtractLoadSet, StateIdOptions};
use crate::signals::Shutdown;

/// Env var naming what triggered a run; recorded on the job.
pub const TRIGGER_ENV: &str = "ELFLOW_JOB_TRIGGER";

/// Per-invocation options that are not part of the project file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Job name to record the run under. Defaults to the state id of the
    /// single extract-load set, or `<environment>:<tasks>`.
    pub job_name: Option<String>,
    /// Ignore stored state and start extractors from scratch.
    pub full_refresh: bool,
    pub state_id: Option<String>,
    pub state_id_suffix: Option<String>,
    /// Save state captured before a failure as partial state.
    pub persist_partial_on_failure: bool,
    pub trigger: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            job_name: None,
            full_refresh: false,
            state_id: None,
            state_id_suffix: None,
            persist_partial_on_failure: true,
            trigger: std::env::var(TRIGGER_ENV).unwrap_or_else(|_| "cli".to_string()),
        }
    }
}

/// Collaborators a run needs.
#[derive(Clone)]
pub struct RunContext {
    pub state_store: Arc<dyn StateStore>,
    pub job_store: Arc<dyn JobStore>,
    pub invoker: Arc<dyn PluginInvoker>,
    pub shutdown: Shutdown,
}

impl RunContext {
    /// Open the project's state backend and job database, with the default
    /// executable invoker.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be opened.
    pub fn from_project(project: &ProjectConfig, shutdown: Shutdown) -> anyhow::Result<Self> {
        let state_store = StateStoreRegistry::with_defaults()
            .open(&project.state_backend)
            .with_context(|| {
                format!("Failed to open state backend '{}'", project.state_backend.uri)
            })?;
        let job_store = SqliteJobStore::open(&project.job.system_db).with_context(|| {
            format!("Failed to open job database {}", project.job.system_db.display())
        })?;
        Ok(Self {
            state_store,
            job_store: Arc::new(job_store),
            invoker: Arc::new(ExecutableInvoker),
            shutdown,
        })
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("state_store", &self.state_store.kind())
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// What happened to one extract-load set.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractLoadSummary {
    pub state_id: StateId,
    pub blocks: Vec<String>,
    /// Whether the loader reported state that was saved as complete.
    pub state_saved: bool,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub job_name: String,
    pub run_id: uuid::Uuid,
    pub extract_loads: Vec<ExtractLoadSummary>,
    pub utilities: usize,
    pub duration_secs: f64,
}

/// Run `tasks` from `project` as one job.
///
/// # Errors
///
/// Returns [`PipelineError`] if the task list is invalid, a block fails, the
/// run is cancelled, or the state or job store fails.
pub async fn run_tasks(
    project: &ProjectConfig,
    tasks: &[String],
    options: &RunOptions,
    ctx: &RunContext,
) -> Result<RunSummary, PipelineError> {
    let started = Instant::now();
    let ids = StateIdOptions {
        state_id: options.state_id.clone(),
        suffix: options.state_id_suffix.clone(),
    };
    let sets = BlockParser::new(project).parse(tasks, &ids)?;
    let job_name = job_name_for(project, tasks, &sets, options);

    sweep_stale(project, &job_name, ctx).await?;

    let mut job = Job::new(job_name.clone(), Arc::clone(&ctx.job_store))
        .with_trigger(options.trigger.clone())
        .with_heartbeat_interval(project.job.heartbeat_interval());

    let (extract_loads, utilities) = job
        .run(|payload| async move {
            let mut extract_loads = Vec::new();
            let mut utilities = 0usize;
            for set in &sets {
                if let Some(reason) = ctx.shutdown.reason() {
                    return Err(BlockError::Cancelled(reason).into());
                }
                match set {
                    BlockSet::ExtractLoad(el) => {
                        extract_loads.push(run_extract_load(el, options, ctx, &payload).await?);
                    }
                    BlockSet::Single(spec) => {
                        run_utility(spec, ctx.invoker.as_ref(), &ctx.shutdown).await?;
                        utilities += 1;
                    }
                }
            }
            Ok::<_, PipelineError>((extract_loads, utilities))
        })
        .await?;

    let summary = RunSummary {
        job_name,
        run_id: job.run_id(),
        extract_loads,
        utilities,
        duration_secs: started.elapsed().as_secs_f64(),
    };
    tracing::info!(
        job = %summary.job_name,
        run_id = %summary.run_id,
        extract_loads = summary.extract_loads.len(),
        utilities = summary.utilities,
        duration_secs = summary.duration_secs,
        "Run completed"
    );
    Ok(summary)
}

fn job_name_for(
    project: &ProjectConfig,
    tasks: &[String],
    sets: &[BlockSet],
    options: &RunOptions,
) -> String {
    if let Some(name) = &options.job_name {
        return name.clone();
    }
    let mut el_sets = sets.iter().filter_map(|s| match s {
        BlockSet::ExtractLoad(el) => Some(el),
        BlockSet::Single(_) => None,
    });
    if let (Some(only), None) = (el_sets.next(), el_sets.next()) {
        return only.state_id.to_string();
    }
    let names: Vec<&str> = tasks.iter().flat_map(|t| t.split_whitespace()).collect();
    format!("{}:{}", project.environment, names.join(" "))
}

async fn sweep_stale(
    project: &ProjectConfig,
    job_name: &str,
    ctx: &RunContext,
) -> Result<(), PipelineError> {
    let store = Arc::clone(&ctx.job_store);
    let thresholds = project.job.stale_thresholds();
    let name = job_name.to_string();
    let swept = tokio::task::spawn_blocking(move || {
        fail_stale_jobs(store.as_ref(), Some(&name), &thresholds, Utc::now())
    })
    .await??;
    if !swept.is_empty() {
        tracing::warn!(job = job_name, count = swept.len(), "Failed stale runs before starting");
    }
    Ok(())
}

async fn run_extract_load(
    el: &ExtractLoadSet,
    options: &RunOptions,
    ctx: &RunContext,
    payload: &PayloadHandle,
) -> Result<ExtractLoadSummary, PipelineError> {
    let incoming = if options.full_refresh {
        tracing::info!(state_id = %el.state_id, "Full refresh, ignoring stored state");
        None
    } else {
        load_state(ctx, &el.state_id).await?
    };
    tracing::info!(
        state_id = %el.state_id,
        blocks = el.blocks.len(),
        resuming = incoming.is_some(),
        "Starting extract-load"
    );

    let blocks = ExtractLoadBlocks::new(el.blocks.clone(), Arc::clone(&ctx.invoker))?
        .with_incoming_state(incoming);

    match blocks.run(&ctx.shutdown).await {
        Ok(outcome) => {
            let state_saved = match outcome.captured_state {
                Some(state) => {
                    save_state(ctx, StateRecord::complete(el.state_id.clone(), state.clone())).await?;
                    payload.set_state(Value::Object(state), true);
                    true
                }
                None => {
                    tracing::warn!(state_id = %el.state_id, "Loader emitted no state; nothing saved");
                    false
                }
            };
            Ok(ExtractLoadSummary {
                state_id: el.state_id.clone(),
                blocks: el.blocks.iter().map(|b| b.name().to_string()).collect(),
                state_saved,
            })
        }
        Err(err) => {
            if options.persist_partial_on_failure {
                if let Some(state) = blocks.captured_state().filter(|s| !s.is_empty()) {
                    let record = StateRecord::partial(el.state_id.clone(), state.clone());
                    match save_state(ctx, record).await {
                        Ok(()) => {
                            tracing::info!(state_id = %el.state_id, "Saved partial state of failed run");
                            payload.set_state(Value::Object(state), false);
                        }
                        Err(save_err) => tracing::warn!(
                            state_id = %el.state_id,
                            "Failed to save partial state: {save_err}"
                        ),
                    }
                }
            }
            Err(err.into())
        }
    }
}

async fn load_state(ctx: &RunContext, state_id: &StateId) -> Result<Option<StateMap>, PipelineError> {
    let store = Arc::clone(&ctx.state_store);
    let id = state_id.clone();
    let record = tokio::task::spawn_blocking(move || store.get(&id)).await??;
    Ok(record.map(|r| r.merged()).filter(|state| !state.is_empty()))
}

async fn save_state(ctx: &RunContext, record: StateRecord) -> Result<(), PipelineError> {
    let store = Arc::clone(&ctx.state_store);
    tokio::task::spawn_blocking(move || store.set(&record)).await??;
    Ok(())
}
