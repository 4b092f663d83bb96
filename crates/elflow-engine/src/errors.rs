//! Run-level error model.

use elflow_state::StateError;

use crate::block::BlockError;
use crate::job::JobError;
use crate::pipeline::ParseError;
use crate::signals::CancelReason;

/// Exit code for a failed run that was not cancelled.
pub const FAILURE_EXIT_CODE: i32 = 1;

/// Categorized error for a run.
///
/// `Block` covers process failures and cancellation of a block set.
/// `Infrastructure` wraps opaque host-side errors (project loading, a
/// panicked blocking task) that have no typed home.
#[derive(Debug)]
pub enum PipelineError {
    /// Task list could not be expanded into block sets.
    Parse(ParseError),
    /// A block failed, could not start, or the run was cancelled.
    Block(BlockError),
    /// State backend failure.
    State(StateError),
    /// Job bookkeeping failure.
    Job(JobError),
    /// Infrastructure error (configuration, task join, etc.)
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "invalid task list: {e}"),
            Self::Block(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "state backend: {e}"),
            Self::Job(e) => write!(f, "job: {e}"),
            Self::Infrastructure(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Block(e) => Some(e),
            Self::State(e) => Some(e),
            Self::Job(e) => Some(e),
            Self::Infrastructure(e) => Some(&**e),
        }
    }
}

impl From<ParseError> for PipelineError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<BlockError> for PipelineError {
    fn from(e: BlockError) -> Self {
        Self::Block(e)
    }
}

impl From<StateError> for PipelineError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<JobError> for PipelineError {
    fn from(e: JobError) -> Self {
        Self::Job(e)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Infrastructure(anyhow::Error::new(e).context("blocking task failed"))
    }
}

impl PipelineError {
    /// The reason, if this run stopped because it was cancelled.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self {
            Self::Block(BlockError::Cancelled(reason)) => Some(*reason),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_reason().is_some()
    }

    /// Process exit code for this error: `128 + signal` when cancelled,
    /// otherwise [`FAILURE_EXIT_CODE`].
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.cancel_reason()
            .map_or(FAILURE_EXIT_CODE, CancelReason::exit_code)
    }
}
