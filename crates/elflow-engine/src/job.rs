//! Job lifecycle: a persisted record of one run, kept alive by a heartbeat.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use elflow_state::{JobStore, StateError};
use elflow_types::job::{ImpossibleTransition, JobRecord, JobState, StaleThresholds};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::PipelineError;

/// Default time between heartbeats of a running job.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from job bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Transition(#[from] ImpossibleTransition),

    #[error("job store: {0}")]
    Store(#[from] StateError),

    #[error("job store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Lets the work running under a job record the state it observed.
///
/// The latest value is written into the job payload when the job ends.
#[derive(Debug, Clone, Default)]
pub struct PayloadHandle {
    pending: Arc<Mutex<Option<(Value, bool)>>>,
}

impl PayloadHandle {
    /// Record `state`; `complete` marks it as coming from a finished run.
    pub fn set_state(&self, state: Value, complete: bool) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some((state, complete));
        }
    }

    fn take(&self) -> Option<(Value, bool)> {
        self.pending.lock().ok().and_then(|mut p| p.take())
    }
}

/// One run attempt under a job name.
pub struct Job {
    record: JobRecord,
    store: Arc<dyn JobStore>,
    heartbeat_interval: Duration,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("record", &self.record)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl Job {
    #[must_use]
    pub fn new(job_name: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        Self {
            record: JobRecord::new(job_name),
            store,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Label describing what started the run (`cli`, `scheduler`, ...).
    #[must_use]
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.record.trigger = trigger.into();
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.record.run_id
    }

    /// Record state on the job payload directly, outside of [`Job::run`].
    pub fn set_state_payload(&mut self, state: Value, complete: bool) {
        self.record.set_state_payload(state, complete);
    }

    /// Run `work` as this job.
    ///
    /// The record is saved as RUNNING before `work` starts and heartbeats
    /// until it returns. On success the job ends as SUCCESS; on error as
    /// FAIL with the error text in the payload, and the error is returned.
    /// If `work` panics, or this future is dropped before `work` returns,
    /// FAIL is saved right away.
    ///
    /// # Errors
    ///
    /// Returns the error of `work`, or [`JobError`] if the record cannot be
    /// moved to RUNNING or saved.
    pub async fn run<T, F, Fut>(&mut self, work: F) -> Result<T, PipelineError>
    where
        F: FnOnce(PayloadHandle) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        self.record.transit(JobState::Running).map_err(JobError::from)?;
        self.record.started_at = Some(Utc::now());
        self.record.ended_at = None;
        self.save().await?;
        tracing::info!(
            job = %self.record.job_name,
            run_id = %self.record.run_id,
            trigger = %self.record.trigger,
            "Job started"
        );

        let abort_guard = AbortGuard::arm(Arc::clone(&self.store), self.record.clone());
        let payload = PayloadHandle::default();
        let heartbeat = Heartbeat::start(
            Arc::clone(&self.store),
            self.record.run_id,
            self.heartbeat_interval,
        );

        let result = work(payload.clone()).await;
        abort_guard.disarm();

        self.record.last_heartbeat_at = heartbeat.stop().or(self.record.last_heartbeat_at);
        if let Some((state, complete)) = payload.take() {
            self.record.set_state_payload(state, complete);
        }
        self.record.ended_at = Some(Utc::now());

        match result {
            Ok(value) => {
                self.record.transit(JobState::Success).map_err(JobError::from)?;
                self.save().await?;
                tracing::info!(job = %self.record.job_name, run_id = %self.record.run_id, "Job succeeded");
                Ok(value)
            }
            Err(err) => {
                self.record.transit(JobState::Fail).map_err(JobError::from)?;
                self.record.set_error(err.to_string());
                if let Err(save_err) = self.save().await {
                    tracing::warn!(
                        run_id = %self.record.run_id,
                        "Failed to record job failure: {save_err}"
                    );
                }
                tracing::error!(job = %self.record.job_name, run_id = %self.record.run_id, "Job failed: {err}");
                Err(err)
            }
        }
    }

    async fn save(&self) -> Result<(), JobError> {
        let store = Arc::clone(&self.store);
        let record = self.record.clone();
        tokio::task::spawn_blocking(move || store.save(&record)).await??;
        Ok(())
    }
}

/// Saves the run as FAIL if dropped while armed, which happens when the
/// work unwinds or the run future is dropped mid-flight.
struct AbortGuard {
    store: Arc<dyn JobStore>,
    record: Option<JobRecord>,
}

impl AbortGuard {
    fn arm(store: Arc<dyn JobStore>, record: JobRecord) -> Self {
        Self {
            store,
            record: Some(record),
        }
    }

    fn disarm(mut self) {
        self.record = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        let reason = if std::thread::panicking() {
            "job panicked before finishing"
        } else {
            "job was abandoned before finishing"
        };
        if record.transit(JobState::Fail).is_err() {
            return;
        }
        record.set_error(reason);
        record.ended_at = Some(Utc::now());
        if let Err(e) = self.store.save(&record) {
            tracing::warn!(run_id = %record.run_id, "Failed to record aborted job: {e}");
        }
        tracing::error!(job = %record.job_name, run_id = %record.run_id, "{reason}");
    }
}

/// Background task that refreshes `last_heartbeat_at`. Aborted on drop.
struct Heartbeat {
    handle: JoinHandle<()>,
    last: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl Heartbeat {
    fn start(store: Arc<dyn JobStore>, run_id: Uuid, interval: Duration) -> Self {
        let last = Arc::new(Mutex::new(None));
        let shared = Arc::clone(&last);
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let at = Utc::now();
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.heartbeat(run_id, at)).await {
                    Ok(Ok(())) => {
                        if let Ok(mut last) = shared.lock() {
                            *last = Some(at);
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(%run_id, "Failed to write heartbeat: {e}"),
                    Err(e) => tracing::warn!(%run_id, "Heartbeat task failed: {e}"),
                }
            }
        });
        Self { handle, last }
    }

    /// Stop beating and return the last heartbeat written.
    fn stop(self) -> Option<DateTime<Utc>> {
        self.handle.abort();
        self.last.lock().ok().and_then(|last| *last)
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Mark RUNNING jobs whose heartbeat evidence says they died as FAIL.
///
/// Returns the records that were updated.
///
/// # Errors
///
/// Returns [`StateError`] if the store cannot be read or written.
pub fn fail_stale_jobs(
    store: &dyn JobStore,
    job_name: Option<&str>,
    thresholds: &StaleThresholds,
    now: DateTime<Utc>,
) -> Result<Vec<JobRecord>, StateError> {
    let mut failed = Vec::new();
    for mut record in store.running(job_name)? {
        if !record.is_stale(now, thresholds) {
            continue;
        }
        let last_seen = record.last_heartbeat_at.or(record.started_at);
        if record.transit(JobState::Fail).is_err() {
            continue;
        }
        let seen = last_seen.map_or_else(|| "never".to_string(), |at| at.to_rfc3339());
        record.set_error(format!(
            "process appears to have died without reporting (last seen {seen})"
        ));
        record.ended_at = Some(now);
        store.save(&record)?;
        tracing::warn!(
            job = %record.job_name,
            run_id = %record.run_id,
            "Marked stale job as failed"
        );
        failed.push(record);
    }
    Ok(failed)
}
