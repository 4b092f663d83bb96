use std::path::Path;

use anyhow::{Context, Result};
use elflow_state::{SqliteJobStore, StateStore, StateStoreRegistry};

/// Execute the `check` command: validate the project and open both stores.
pub fn execute(project_path: &Path) -> Result<()> {
    let project = super::load_project(project_path)?;
    println!("Project structure: OK");
    println!(
        "  {} plugin(s), {} task set(s), environment '{}'",
        project.plugins.len(),
        project.task_sets.len(),
        project.environment
    );

    let store = StateStoreRegistry::with_defaults()
        .open(&project.state_backend)
        .with_context(|| format!("Failed to open state backend '{}'", project.state_backend.uri))?;
    let ids = store.get_state_ids(None)?;
    println!("State backend:     OK ({}, {} state id(s))", store.kind(), ids.len());

    SqliteJobStore::open(&project.job.system_db).with_context(|| {
        format!("Failed to open job database {}", project.job.system_db.display())
    })?;
    println!("Job database:      OK ({})", project.job.system_db.display());

    println!("\nAll checks passed.");
    Ok(())
}
