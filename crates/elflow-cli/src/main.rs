mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use elflow_engine::PipelineError;

#[derive(Parser)]
#[command(
    name = "elflow",
    version,
    about = "Extract-load orchestrator for executable plugins"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace); `ELFLOW_LOG` overrides it
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format, written to stderr
    #[arg(long, value_enum, default_value_t = logging::LogFormat::Text, global = true)]
    log_format: logging::LogFormat,

    /// Path to the project YAML file
    #[arg(short, long, default_value = "elflow.yaml", global = true)]
    project: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run plugins and task sets as one job
    Run {
        /// Plugin or task-set names, in order
        #[arg(required = true)]
        tasks: Vec<String>,
        /// Record the run under this job name
        #[arg(long)]
        job_name: Option<String>,
        /// Ignore stored state and extract everything
        #[arg(long)]
        full_refresh: bool,
        /// Store bookmarks under this id (single extract-load set only)
        #[arg(long, conflicts_with = "state_id_suffix")]
        state_id: Option<String>,
        /// Append `:<suffix>` to generated state ids
        #[arg(long)]
        state_id_suffix: Option<String>,
        /// Do not save state captured before a failure
        #[arg(long)]
        no_partial_state: bool,
    },
    /// Validate the project file and open its stores
    Check,
    /// Inspect and edit stored bookmark state
    State {
        #[command(subcommand)]
        command: commands::state::StateCommand,
    },
    /// Inspect job runs
    Jobs {
        #[command(subcommand)]
        command: commands::jobs::JobsCommand,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format);

    let result = match cli.command {
        Commands::Run {
            tasks,
            job_name,
            full_refresh,
            state_id,
            state_id_suffix,
            no_partial_state,
        } => {
            let args = commands::run::RunArgs {
                tasks,
                job_name,
                full_refresh,
                state_id,
                state_id_suffix,
                persist_partial_on_failure: !no_partial_state,
            };
            commands::run::execute(&cli.project, args).await
        }
        Commands::Check => commands::check::execute(&cli.project),
        Commands::State { command } => commands::state::execute(&cli.project, command),
        Commands::Jobs { command } => commands::jobs::execute(&cli.project, command),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            let code = err
                .downcast_ref::<PipelineError>()
                .map_or(1, PipelineError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
