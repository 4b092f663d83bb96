//! Job run model: lifecycle states, transition table, payload flags, and
//! staleness rules.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Default grace period for a RUNNING job that never recorded a heartbeat.
pub const HEARTBEATLESS_JOB_VALID: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time a heartbeat keeps a RUNNING job alive.
pub const HEARTBEAT_VALID: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Idle,
    Running,
    Success,
    Fail,
    Dead,
}

impl JobState {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Fail => "FAIL",
            Self::Dead => "DEAD",
        }
    }

    /// States reachable from `self`.
    #[must_use]
    pub fn transitions(self) -> &'static [JobState] {
        match self {
            Self::Idle => &[Self::Running],
            Self::Running => &[Self::Success, Self::Fail],
            Self::Fail => &[Self::Running],
            Self::Success | Self::Dead => &[],
        }
    }

    #[must_use]
    pub fn can_transit(self, to: JobState) -> bool {
        self.transitions().contains(&to)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.transitions().is_empty()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(Self::Idle),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAIL" => Ok(Self::Fail),
            "DEAD" => Ok(Self::Dead),
            other => Err(UnknownJobState(other.to_string())),
        }
    }
}

/// A stored job state string that is not one of the known states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state '{0}'")]
pub struct UnknownJobState(pub String);

/// A transition the lifecycle table forbids. Always a caller bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot transit job from {from} to {to}")]
pub struct ImpossibleTransition {
    pub from: JobState,
    pub to: JobState,
}

// ---------------------------------------------------------------------------
// Payload flags
// ---------------------------------------------------------------------------

/// Bit-set describing what the job payload carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadFlags(u8);

impl PayloadFlags {
    pub const NONE: Self = Self(0);
    /// Payload holds state from a completed run.
    pub const STATE: Self = Self(1);
    /// Payload holds state from a run that did not complete.
    pub const INCOMPLETE_STATE: Self = Self(1 << 1);

    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::STATE.0 | Self::INCOMPLETE_STATE.0))
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Windows after which a RUNNING job is presumed dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleThresholds {
    /// Allowed time since `started_at` for a job that never heartbeated.
    pub heartbeatless: Duration,
    /// Allowed time since the last heartbeat.
    pub heartbeat_validity: Duration,
}

impl Default for StaleThresholds {
    fn default() -> Self {
        Self {
            heartbeatless: HEARTBEATLESS_JOB_VALID,
            heartbeat_validity: HEARTBEAT_VALID,
        }
    }
}

fn elapsed_exceeds(since: DateTime<Utc>, now: DateTime<Utc>, window: Duration) -> bool {
    match chrono::Duration::from_std(window) {
        Ok(window) => now - since > window,
        Err(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One run attempt under a job name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_name: String,
    pub run_id: Uuid,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub payload: Value,
    pub payload_flags: PayloadFlags,
    #[serde(default)]
    pub trigger: String,
}

impl JobRecord {
    /// A fresh IDLE record with a newly minted `run_id`.
    #[must_use]
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            run_id: Uuid::new_v4(),
            state: JobState::Idle,
            started_at: None,
            ended_at: None,
            last_heartbeat_at: None,
            payload: Value::Object(serde_json::Map::new()),
            payload_flags: PayloadFlags::NONE,
            trigger: String::new(),
        }
    }

    /// Move to `to`, enforcing the lifecycle table.
    ///
    /// # Errors
    ///
    /// Returns [`ImpossibleTransition`] when the table forbids the move.
    pub fn transit(&mut self, to: JobState) -> Result<JobState, ImpossibleTransition> {
        if !self.state.can_transit(to) {
            return Err(ImpossibleTransition {
                from: self.state,
                to,
            });
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// Whether this job claims to be running but, by heartbeat evidence, is
    /// very likely dead.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, thresholds: &StaleThresholds) -> bool {
        if !self.is_running() {
            return false;
        }
        match (self.last_heartbeat_at, self.started_at) {
            (Some(heartbeat), _) => elapsed_exceeds(heartbeat, now, thresholds.heartbeat_validity),
            (None, Some(started)) => elapsed_exceeds(started, now, thresholds.heartbeatless),
            (None, None) => false,
        }
    }

    /// Record an error description in the payload.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.payload_object().insert("error".into(), Value::String(message.into()));
    }

    /// The recorded error description, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }

    /// Record the last observed state in the payload and flag whether it came
    /// from a completed run.
    pub fn set_state_payload(&mut self, state: Value, complete: bool) {
        self.payload_object().insert("state".into(), state);
        if complete {
            self.payload_flags.remove(PayloadFlags::INCOMPLETE_STATE);
            self.payload_flags.insert(PayloadFlags::STATE);
        } else {
            self.payload_flags.insert(PayloadFlags::INCOMPLETE_STATE);
        }
    }

    fn payload_object(&mut self) -> &mut serde_json::Map<String, Value> {
        if !self.payload.is_object() {
            self.payload = Value::Object(serde_json::Map::new());
        }
        match &mut self.payload {
            Value::Object(map) => map,
            _ => unreachable!("payload normalised to an object above"),
        }
    }
}
