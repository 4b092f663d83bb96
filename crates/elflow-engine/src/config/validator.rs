//! Semantic validation for parsed project configuration values.

use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::config::types::ProjectConfig;

/// Validate a parsed project configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the project config.
pub fn validate_project(config: &ProjectConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported project version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.environment.trim().is_empty() {
        errors.push("environment must not be empty".to_string());
    }

    if !config.state_backend.uri.contains("://") {
        errors.push(format!(
            "state_backend.uri '{}' must look like <scheme>://<location>",
            config.state_backend.uri
        ));
    }
    if config.state_backend.lock.timeout.is_zero() {
        errors.push("state_backend.lock.timeout_secs must be > 0".to_string());
    }
    if config.state_backend.lock.initial_delay > config.state_backend.lock.max_delay {
        errors.push("state_backend.lock.initial_delay_ms must not exceed max_delay_ms".to_string());
    }

    if config.job.heartbeat_interval_ms == 0 {
        errors.push("job.heartbeat_interval_ms must be > 0".to_string());
    }
    if config.job.heartbeat_validity_secs == 0 || config.job.heartbeatless_secs == 0 {
        errors.push("job staleness windows must be > 0".to_string());
    }
    if config.job.heartbeat_interval_ms / 1_000 >= config.job.heartbeat_validity_secs {
        errors.push(
            "job.heartbeat_interval_ms must be shorter than job.heartbeat_validity_secs"
                .to_string(),
        );
    }

    let mut plugin_names = HashSet::new();
    for (i, plugin) in config.plugins.iter().enumerate() {
        if plugin.name.trim().is_empty() {
            errors.push(format!("Plugin {i} has an empty name"));
            continue;
        }
        if plugin.name.contains(char::is_whitespace) {
            errors.push(format!("Plugin name '{}' must not contain whitespace", plugin.name));
        }
        if !plugin_names.insert(plugin.name.as_str()) {
            errors.push(format!("Duplicate plugin name '{}'", plugin.name));
        }
        if plugin.executable().trim().is_empty() {
            errors.push(format!("Plugin '{}' has an empty executable", plugin.name));
        }
        if let Some(cfg) = &plugin.config {
            if !cfg.is_object() {
                errors.push(format!("Plugin '{}' config must be a mapping", plugin.name));
            }
        }
    }

    let mut task_set_names = HashSet::new();
    for task_set in &config.task_sets {
        if task_set.name.trim().is_empty() {
            errors.push("Task set with an empty name".to_string());
            continue;
        }
        if !task_set_names.insert(task_set.name.as_str()) {
            errors.push(format!("Duplicate task set name '{}'", task_set.name));
        }
        if plugin_names.contains(task_set.name.as_str()) {
            errors.push(format!(
                "Task set '{}' has the same name as a plugin",
                task_set.name
            ));
        }
        if task_set.tasks.is_empty() {
            errors.push(format!("Task set '{}' has no tasks", task_set.name));
        }
    }

    for task_set in &config.task_sets {
        for task in task_set.tasks.iter().flat_map(|t| t.split_whitespace()) {
            if !plugin_names.contains(task) && !task_set_names.contains(task) {
                errors.push(format!(
                    "Task set '{}' references unknown task '{task}'",
                    task_set.name
                ));
            }
        }
    }

    if !errors.is_empty() {
        bail!("Project validation failed:\n  - {}", errors.join("\n  - "));
    }

    Ok(())
}
