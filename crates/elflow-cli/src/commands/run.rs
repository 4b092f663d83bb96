use std::path::Path;

use anyhow::Result;
use elflow_engine::{run_tasks, signals, RunContext, RunOptions, Shutdown};
use elflow_state::StateStore;

pub struct RunArgs {
    pub tasks: Vec<String>,
    pub job_name: Option<String>,
    pub full_refresh: bool,
    pub state_id: Option<String>,
    pub state_id_suffix: Option<String>,
    pub persist_partial_on_failure: bool,
}

/// Execute the `run` command: load the project, then run the tasks as one job.
pub async fn execute(project_path: &Path, args: RunArgs) -> Result<()> {
    let project = super::load_project(project_path)?;

    let shutdown = Shutdown::new();
    let signal_handler = signals::install(shutdown.clone());
    let ctx = RunContext::from_project(&project, shutdown)?;

    tracing::info!(
        environment = project.environment,
        state_backend = ctx.state_store.kind(),
        tasks = args.tasks.join(" "),
        "Project loaded"
    );

    let options = RunOptions {
        job_name: args.job_name,
        full_refresh: args.full_refresh,
        state_id: args.state_id,
        state_id_suffix: args.state_id_suffix,
        persist_partial_on_failure: args.persist_partial_on_failure,
        ..RunOptions::default()
    };

    let result = run_tasks(&project, &args.tasks, &options, &ctx).await;

    signal_handler.abort();

    let summary = result?;

    println!("Job '{}' completed successfully.", summary.job_name);
    println!("  Run id:          {}", summary.run_id);
    for el in &summary.extract_loads {
        println!(
            "  {:<16} {} ({})",
            el.state_id.as_str(),
            el.blocks.join(" -> "),
            if el.state_saved { "state saved" } else { "no state" }
        );
    }
    if summary.utilities > 0 {
        println!("  Utilities run:   {}", summary.utilities);
    }
    println!("  Duration:        {:.2}s", summary.duration_secs);

    Ok(())
}
