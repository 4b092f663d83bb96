//! Log setup for the `elflow` binary.
//!
//! Logs go to stderr so that stdout stays clean for command output such as
//! `elflow state get`.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Env var holding a filter directive (`info`, `elflow_engine=debug`, ...).
pub const LOG_ENV: &str = "ELFLOW_LOG";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Pick the filter directive: `ELFLOW_LOG`, then `RUST_LOG`, then `--log-level`.
fn directive(elflow_log: Option<String>, rust_log: Option<String>, log_level: &str) -> String {
    let set = |d: &String| !d.trim().is_empty();
    elflow_log
        .filter(set)
        .or_else(|| rust_log.filter(set))
        .unwrap_or_else(|| log_level.to_string())
}

/// Install the global subscriber.
pub fn init(log_level: &str, format: LogFormat) {
    let directive = directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        log_level,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
        eprintln!("Ignoring invalid log filter '{directive}': {e}");
        EnvFilter::new(log_level)
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}
