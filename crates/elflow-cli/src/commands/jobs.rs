use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Subcommand;
use elflow_engine::fail_stale_jobs;
use elflow_state::{JobStore, SqliteJobStore};
use elflow_types::job::JobRecord;

#[derive(Subcommand)]
pub enum JobsCommand {
    /// Show recent runs, newest first
    List {
        /// Only runs of this job
        #[arg(long)]
        job_name: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only runs still marked RUNNING
        #[arg(long)]
        running: bool,
    },
    /// Mark RUNNING jobs with expired heartbeats as failed
    Sweep {
        #[arg(long)]
        job_name: Option<String>,
    },
}

/// Execute a `jobs` subcommand against the project's job database.
pub fn execute(project_path: &Path, command: JobsCommand) -> Result<()> {
    let project = super::load_project(project_path)?;
    let store = SqliteJobStore::open(&project.job.system_db).with_context(|| {
        format!("Failed to open job database {}", project.job.system_db.display())
    })?;

    match command {
        JobsCommand::List {
            job_name,
            limit,
            running,
        } => {
            let records = if running {
                store.running(job_name.as_deref())?
            } else {
                store.history(job_name.as_deref(), limit)?
            };
            if records.is_empty() {
                println!("No runs recorded.");
            }
            for record in &records {
                print_record(record);
            }
        }
        JobsCommand::Sweep { job_name } => {
            let failed = fail_stale_jobs(
                &store,
                job_name.as_deref(),
                &project.job.stale_thresholds(),
                Utc::now(),
            )?;
            println!("Marked {} stale run(s) as failed.", failed.len());
            for record in &failed {
                print_record(record);
            }
        }
    }

    Ok(())
}

fn print_record(record: &JobRecord) {
    let started = record
        .started_at
        .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string());
    let duration = match (record.started_at, record.ended_at) {
        (Some(start), Some(end)) => {
            format!("{:.1}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => "-".to_string(),
    };
    println!(
        "{}  {:<8} {:<30} {}  {:>8}  {}",
        record.run_id,
        record.state.as_str(),
        record.job_name,
        started,
        duration,
        record.trigger
    );
    if let Some(error) = record.error() {
        println!("    error: {error}");
    }
}
