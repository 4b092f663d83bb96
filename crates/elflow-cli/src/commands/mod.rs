pub mod check;
pub mod jobs;
pub mod run;
pub mod state;

use std::path::Path;

use anyhow::{Context, Result};
use elflow_engine::config::types::ProjectConfig;
use elflow_engine::config::{parser, validator};

/// Parse and validate the project file.
pub fn load_project(path: &Path) -> Result<ProjectConfig> {
    let project = parser::parse_project(path)
        .with_context(|| format!("Failed to load project: {}", path.display()))?;
    validator::validate_project(&project)?;
    Ok(project)
}
