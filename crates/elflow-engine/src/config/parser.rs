//! Project YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::ProjectConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == &cap[1]) {
                missing.push(cap[1].to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(substituted.into_owned())
}

/// Parse a project YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_project_str(yaml_str: &str) -> Result<ProjectConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: ProjectConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse project YAML")?;
    Ok(config)
}

/// Parse a project YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_project(path: &Path) -> Result<ProjectConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    parse_project_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRole;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ELFLOW_TEST_HOST", "myhost.example.com");
        let input = "host: ${ELFLOW_TEST_HOST}\nport: 5432";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "host: myhost.example.com\nport: 5432");
        std::env::remove_var("ELFLOW_TEST_HOST");
    }

    #[test]
    fn test_value_containing_placeholder_is_not_expanded_twice() {
        std::env::set_var("ELFLOW_TEST_OUTER", "${ELFLOW_TEST_INNER}");
        let result = substitute_env_vars("v: ${ELFLOW_TEST_OUTER}").unwrap();
        assert_eq!(result, "v: ${ELFLOW_TEST_INNER}");
        std::env::remove_var("ELFLOW_TEST_OUTER");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "environment: dev\nplugins: []";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_multiple_missing_env_vars_all_reported() {
        let input = "${ELFLOW_MISSING_X} and ${ELFLOW_MISSING_Y} and ${ELFLOW_MISSING_X}";
        let err_msg = substitute_env_vars(input).unwrap_err().to_string();
        assert!(err_msg.contains("ELFLOW_MISSING_X, ELFLOW_MISSING_Y"), "{err_msg}");
    }

    #[test]
    fn test_parse_project_from_string() {
        std::env::set_var("ELFLOW_TEST_CSV_DIR", "/data/in");
        let yaml = r#"
environment: prod
state_backend:
  uri: "file:///var/lib/elflow/state"
  lock:
    timeout_secs: 30
plugins:
  - name: tap-csv
    role: extractor
    config:
      dir: ${ELFLOW_TEST_CSV_DIR}
  - name: target-jsonl
    role: loader
    executable: /usr/local/bin/target-jsonl
    args: ["--verbose"]
    env:
      TARGET_DIR: /data/out
task_sets:
  - name: daily
    tasks: ["tap-csv target-jsonl"]
    env:
      TAP_CSV_LIMIT: "100"
"#;
        let config = parse_project_str(yaml).unwrap();
        assert_eq!(config.environment, "prod");
        assert_eq!(config.version, "1.0");
        assert_eq!(config.state_backend.lock.timeout.as_secs(), 30);
        assert_eq!(config.plugins.len(), 2);
        let tap = config.plugin("tap-csv").unwrap();
        assert_eq!(tap.role, BlockRole::Extractor);
        assert_eq!(tap.executable(), "tap-csv");
        assert_eq!(tap.config.as_ref().unwrap()["dir"], "/data/in");
        let target = config.plugin("target-jsonl").unwrap();
        assert_eq!(target.executable(), "/usr/local/bin/target-jsonl");
        assert_eq!(target.env["TARGET_DIR"], "/data/out");
        assert_eq!(config.task_set("daily").unwrap().env["TAP_CSV_LIMIT"], "100");
        assert_eq!(config.job.heartbeat_interval_ms, 1_000);
        std::env::remove_var("ELFLOW_TEST_CSV_DIR");
    }

    #[test]
    fn test_unknown_role_fails_to_parse() {
        let yaml = "plugins:\n  - name: x\n    role: transformer\n";
        let err = format!("{:#}", parse_project_str(yaml).unwrap_err());
        assert!(err.contains("unknown variant"), "{err}");
    }

    #[test]
    fn test_parse_project_file_not_found() {
        let err_msg = parse_project(Path::new("/nonexistent/elflow.yaml"))
            .unwrap_err()
            .to_string();
        assert!(err_msg.contains("Failed to read project file"));
    }
}
