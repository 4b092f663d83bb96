//! Extract-load orchestration for elflow.
//!
//! Expands task names from the project file into block sets, runs each set
//! as a chain of plugin subprocesses, and records the run as a job with a
//! heartbeat while bookmark state flows back into the configured state store.

#![warn(clippy::pedantic)]

pub mod block;
pub mod config;
pub mod errors;
pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod signals;

// Re-export public API for convenience
pub use errors::PipelineError;
pub use job::{fail_stale_jobs, Job, JobError};
pub use orchestrator::{run_tasks, RunContext, RunOptions, RunSummary};
pub use pipeline::{BlockParser, BlockSet, ExtractLoadBlocks};
pub use signals::{CancelReason, Shutdown};
