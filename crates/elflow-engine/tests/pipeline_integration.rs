//! Integration tests for project loading and end-to-end runs.
//!
//! The run tests use `/bin/sh` scripts as extractor, mapper, and loader
//! plugins, so they only run on unix.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use elflow_engine::block::{BlockError, BlockRole, ExecutableInvoker};
use elflow_engine::config::types::{PluginConfig, ProjectConfig, TaskSetConfig};
use elflow_engine::config::{parser, validator};
use elflow_engine::pipeline::StateIdOptions;
use elflow_engine::{run_tasks, BlockParser, BlockSet, CancelReason, RunContext, RunOptions, Shutdown};
use elflow_state::prelude::*;
use elflow_types::job::{JobState, PayloadFlags};
use serde_json::json;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

#[test]
fn test_parse_and_validate_fixture_project() {
    std::env::set_var("TEST_ELFLOW_PG_HOST", "db.internal");

    let project = parser::parse_project(&fixture("project.yaml")).expect("fixture should parse");

    assert_eq!(project.environment, "staging");
    assert_eq!(project.state_backend.uri, "sqlite://.elflow/state.db");
    assert_eq!(project.state_backend.lock.timeout, Duration::from_secs(5));
    assert_eq!(project.job.heartbeat_interval(), Duration::from_millis(500));
    assert_eq!(project.plugins.len(), 4);
    let tap = project.plugin("tap-postgres").unwrap();
    assert_eq!(tap.config.as_ref().unwrap()["host"], "db.internal");
    assert_eq!(project.plugin("map-pii").unwrap().executable(), "map-pii");

    validator::validate_project(&project).expect("fixture should validate");

    let sets = BlockParser::new(&project)
        .parse(&["nightly".to_string()], &StateIdOptions::default())
        .unwrap();
    assert_eq!(sets.len(), 2);
    let BlockSet::ExtractLoad(el) = &sets[0] else {
        panic!("expected an extract-load set first");
    };
    assert_eq!(el.state_id.as_str(), "staging:tap-postgres-to-target-jsonl");
    assert_eq!(el.blocks.len(), 3);
    let loader_env = &el.blocks[2].env;
    assert_eq!(loader_env.get("TARGET_BATCH_SIZE").map(String::as_str), Some("500"));
    assert_eq!(loader_env.get("DBT_TARGET").map(String::as_str), Some("prod"));
    assert!(matches!(&sets[1], BlockSet::Single(spec) if spec.name() == "dbt"));

    std::env::remove_var("TEST_ELFLOW_PG_HOST");
}

#[test]
fn test_invalid_fixture_reports_every_problem() {
    let project = parser::parse_project(&fixture("invalid_project.yaml")).expect("should parse");
    let err = validator::validate_project(&project).unwrap_err().to_string();
    for expected in [
        "environment must not be empty",
        "state_backend.uri 'not-a-uri'",
        "Duplicate plugin name 'tap-a'",
        "Plugin 'target-b' config must be a mapping",
        "Task set 'target-b' has the same name as a plugin",
        "Task set 'target-b' has no tasks",
        "references unknown task 'missing-plugin'",
    ] {
        assert!(err.contains(expected), "missing '{expected}' in:\n{err}");
    }
}

#[test]
fn test_missing_project_file() {
    let err = parser::parse_project(&fixture("does-not-exist.yaml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read project file"));
}

// ---------------------------------------------------------------------------
// End-to-end runs
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod runs {
    use super::*;

    const EXTRACTOR: &str = r#"
if [ -n "${ELFLOW_STATE_PATH:-}" ] && grep -q users "$ELFLOW_STATE_PATH"; then resumed=true; else resumed=false; fi
echo '{"type":"SCHEMA","stream":"users","schema":{}}'
echo '{"type":"RECORD","stream":"users","record":{"id":1}}'
echo '{"type":"RECORD","stream":"users","record":{"id":2}}'
echo "{\"type\":\"STATE\",\"value\":{\"bookmarks\":{\"users\":{\"id\":2}},\"resumed\":$resumed}}"
"#;

    /// Echoes STATE lines back, as a loader does once data is committed.
    const LOADER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"STATE"'*) echo "$line" ;;
  esac
done
"#;

    const FAILING_EXTRACTOR: &str = r#"
echo '{"type":"STATE","value":{"bookmarks":{"users":{"id":1}}}}'
sleep 0.5
echo 'connection reset' >&2
exit 1
"#;

    const EMPTY_STATE_THEN_FAIL: &str = r#"
echo '{"type":"STATE","value":{}}'
sleep 0.5
exit 1
"#;

    fn sh_plugin(name: &str, role: BlockRole, script: &str) -> PluginConfig {
        PluginConfig {
            name: name.into(),
            role,
            executable: Some("/bin/sh".into()),
            args: vec!["-c".into(), script.into(), name.into()],
            config: None,
            env: BTreeMap::new(),
        }
    }

    fn project(plugins: Vec<PluginConfig>) -> ProjectConfig {
        let mut project = parser::parse_project_str("environment: test").unwrap();
        project.job.heartbeat_interval_ms = 50;
        project.plugins = plugins;
        project
    }

    struct Harness {
        state: Arc<SqliteStateStore>,
        jobs: Arc<SqliteJobStore>,
        ctx: RunContext,
    }

    fn harness() -> Harness {
        let state = Arc::new(SqliteStateStore::in_memory().unwrap());
        let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
        let ctx = RunContext {
            state_store: state.clone(),
            job_store: jobs.clone(),
            invoker: Arc::new(ExecutableInvoker),
            shutdown: Shutdown::new(),
        };
        Harness { state, jobs, ctx }
    }

    fn tasks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_extract_load_persists_complete_state() {
        let project = project(vec![
            sh_plugin("tap-users", BlockRole::Extractor, EXTRACTOR),
            sh_plugin("map-noop", BlockRole::Mapper, "exec cat"),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
        ]);
        let h = harness();

        let summary = run_tasks(
            &project,
            &tasks(&["tap-users map-noop target-echo"]),
            &RunOptions::default(),
            &h.ctx,
        )
        .await
        .unwrap();

        assert_eq!(summary.job_name, "test:tap-users-to-target-echo");
        assert_eq!(summary.extract_loads.len(), 1);
        assert!(summary.extract_loads[0].state_saved);

        let id = StateId::new("test:tap-users-to-target-echo");
        let record = h.state.get(&id).unwrap().expect("state should be stored");
        assert!(record.is_complete());
        assert_eq!(
            serde_json::Value::Object(record.completed_state),
            json!({"bookmarks": {"users": {"id": 2}}, "resumed": false})
        );

        let job = h.jobs.get(summary.run_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Success);
        assert!(job.ended_at.is_some());
        assert!(job.payload_flags.contains(PayloadFlags::STATE));

        // The second run hands the stored bookmarks to the extractor.
        run_tasks(
            &project,
            &tasks(&["tap-users", "target-echo"]),
            &RunOptions::default(),
            &h.ctx,
        )
        .await
        .unwrap();
        let record = h.state.get(&id).unwrap().unwrap();
        assert_eq!(record.completed_state["resumed"], json!(true));

        // Full refresh ignores it again.
        let options = RunOptions {
            full_refresh: true,
            ..RunOptions::default()
        };
        run_tasks(&project, &tasks(&["tap-users", "target-echo"]), &options, &h.ctx)
            .await
            .unwrap();
        let record = h.state.get(&id).unwrap().unwrap();
        assert_eq!(record.completed_state["resumed"], json!(false));
    }

    #[tokio::test]
    async fn test_failed_extractor_fails_job_and_keeps_partial_state() {
        let project = project(vec![
            sh_plugin("tap-flaky", BlockRole::Extractor, FAILING_EXTRACTOR),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
        ]);
        let h = harness();

        let err = run_tasks(
            &project,
            &tasks(&["tap-flaky", "target-echo"]),
            &RunOptions::default(),
            &h.ctx,
        )
        .await
        .unwrap_err();

        assert!(!err.is_cancelled());
        assert_eq!(err.exit_code(), 1);
        match &err {
            elflow_engine::PipelineError::Block(BlockError::BlockFailed { block, code }) => {
                assert_eq!(block, "tap-flaky");
                assert_eq!(*code, Some(1));
            }
            other => panic!("unexpected error: {other}"),
        }

        let id = StateId::new("test:tap-flaky-to-target-echo");
        let record = h.state.get(&id).unwrap().expect("partial state should be stored");
        assert!(record.completed_state.is_empty());
        assert_eq!(
            serde_json::Value::Object(record.partial_state),
            json!({"bookmarks": {"users": {"id": 1}}})
        );

        let history = h.jobs.history(Some("test:tap-flaky-to-target-echo"), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, JobState::Fail);
        assert!(history[0].ended_at.is_some());
        assert!(history[0].error().unwrap().contains("tap-flaky"));
        assert!(history[0].payload_flags.contains(PayloadFlags::INCOMPLETE_STATE));
    }

    #[tokio::test]
    async fn test_failed_run_leaves_completed_state_untouched() {
        let project = project(vec![
            sh_plugin("tap-empty", BlockRole::Extractor, EMPTY_STATE_THEN_FAIL),
            sh_plugin("tap-flaky", BlockRole::Extractor, FAILING_EXTRACTOR),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
        ]);
        let h = harness();
        let previous = json!({"bookmarks": {"users": {"id": 9}}});

        // An empty STATE line before the failure saves nothing.
        let id = StateId::new("test:tap-empty-to-target-echo");
        h.state
            .set(&StateRecord::complete(id.clone(), previous.as_object().cloned().unwrap()))
            .unwrap();
        run_tasks(&project, &tasks(&["tap-empty", "target-echo"]), &RunOptions::default(), &h.ctx)
            .await
            .unwrap_err();
        let record = h.state.get(&id).unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(record.completed_state), previous);
        assert!(record.partial_state.is_empty());

        // Real bookmarks before the failure land in partial state only.
        let id = StateId::new("test:tap-flaky-to-target-echo");
        h.state
            .set(&StateRecord::complete(id.clone(), previous.as_object().cloned().unwrap()))
            .unwrap();
        run_tasks(&project, &tasks(&["tap-flaky", "target-echo"]), &RunOptions::default(), &h.ctx)
            .await
            .unwrap_err();
        let record = h.state.get(&id).unwrap().unwrap();
        assert_eq!(serde_json::Value::Object(record.completed_state.clone()), previous);
        assert_eq!(
            serde_json::Value::Object(record.partial_state.clone()),
            json!({"bookmarks": {"users": {"id": 1}}})
        );
        assert!(!record.is_complete());
    }

    #[tokio::test]
    async fn test_partial_state_can_be_disabled() {
        let project = project(vec![
            sh_plugin("tap-flaky", BlockRole::Extractor, FAILING_EXTRACTOR),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
        ]);
        let h = harness();
        let options = RunOptions {
            persist_partial_on_failure: false,
            ..RunOptions::default()
        };

        run_tasks(&project, &tasks(&["tap-flaky", "target-echo"]), &options, &h.ctx)
            .await
            .unwrap_err();

        let id = StateId::new("test:tap-flaky-to-target-echo");
        assert!(h.state.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_blocks_and_fails_job() {
        let project = project(vec![
            sh_plugin("tap-slow", BlockRole::Extractor, "exec sleep 30"),
            sh_plugin("target-sink", BlockRole::Loader, "exec cat"),
        ]);
        let h = harness();
        let shutdown = h.ctx.shutdown.clone();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            shutdown.cancel(CancelReason::Terminated);
        });

        let started = std::time::Instant::now();
        let err = run_tasks(
            &project,
            &tasks(&["tap-slow", "target-sink"]),
            &RunOptions::default(),
            &h.ctx,
        )
        .await
        .unwrap_err();
        canceller.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(err.cancel_reason(), Some(CancelReason::Terminated));
        assert_eq!(err.exit_code(), 143);

        let history = h.jobs.history(None, 10).unwrap();
        assert_eq!(history[0].state, JobState::Fail);
    }

    #[tokio::test]
    async fn test_utilities_and_task_sets_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("order.log");
        let marker_str = marker.display().to_string();

        let mut util = sh_plugin(
            "util-mark",
            BlockRole::Utility,
            r#"echo "$MARK" >> "$MARKER_FILE""#,
        );
        util.env.insert("MARKER_FILE".into(), marker_str);
        let mut project = project(vec![
            sh_plugin("tap-users", BlockRole::Extractor, EXTRACTOR),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
            util,
        ]);
        project.task_sets = vec![
            TaskSetConfig {
                name: "first".into(),
                tasks: vec!["util-mark".into()],
                env: BTreeMap::from([("MARK".into(), "first".into())]),
            },
            TaskSetConfig {
                name: "second".into(),
                tasks: vec!["util-mark".into()],
                env: BTreeMap::from([("MARK".into(), "second".into())]),
            },
        ];
        let h = harness();

        let summary = run_tasks(
            &project,
            &tasks(&["first", "tap-users target-echo", "second"]),
            &RunOptions::default(),
            &h.ctx,
        )
        .await
        .unwrap();

        assert_eq!(summary.utilities, 2);
        assert_eq!(summary.extract_loads.len(), 1);
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_stale_run_is_failed_before_next_run() {
        let project = project(vec![
            sh_plugin("tap-users", BlockRole::Extractor, EXTRACTOR),
            sh_plugin("target-echo", BlockRole::Loader, LOADER),
        ]);
        let h = harness();

        let mut abandoned = elflow_types::job::JobRecord::new("test:tap-users-to-target-echo");
        abandoned.transit(JobState::Running).unwrap();
        abandoned.started_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        abandoned.last_heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::minutes(11));
        h.jobs.save(&abandoned).unwrap();

        run_tasks(&project, &tasks(&["tap-users", "target-echo"]), &RunOptions::default(), &h.ctx)
            .await
            .unwrap();

        let swept = h.jobs.get(abandoned.run_id).unwrap().unwrap();
        assert_eq!(swept.state, JobState::Fail);
        assert!(swept.error().unwrap().contains("died"));
        assert!(h.jobs.running(None).unwrap().is_empty());
    }
}
