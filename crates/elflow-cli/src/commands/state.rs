use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use elflow_state::{StateService, StateStoreRegistry};
use elflow_types::state::StateId;

#[derive(Subcommand)]
pub enum StateCommand {
    /// List stored state ids
    List {
        /// Glob filter, e.g. `prod:*`
        pattern: Option<String>,
    },
    /// Print the effective state for an id
    Get { state_id: String },
    /// Replace (or with --partial, merge into) the state for an id
    Set {
        state_id: String,
        /// JSON object
        json: String,
        /// Write as partial state instead of replacing
        #[arg(long)]
        partial: bool,
    },
    /// Delete all state for an id
    Clear { state_id: String },
    /// Overwrite `dst` with the state of `src`
    Copy { src: String, dst: String },
    /// Merge the state of `src` into `dst`
    Merge { src: String, dst: String },
    /// Copy `src` to `dst`, then clear `src`
    Move { src: String, dst: String },
}

/// Execute a `state` subcommand against the project's state backend.
pub fn execute(project_path: &Path, command: StateCommand) -> Result<()> {
    let project = super::load_project(project_path)?;
    let store = StateStoreRegistry::with_defaults()
        .open(&project.state_backend)
        .with_context(|| format!("Failed to open state backend '{}'", project.state_backend.uri))?;
    let service = StateService::new(store);

    match command {
        StateCommand::List { pattern } => {
            for id in service.list(pattern.as_deref())? {
                println!("{id}");
            }
        }
        StateCommand::Get { state_id } => {
            let id = StateId::new(state_id);
            match service.get(&id)? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => anyhow::bail!("No state stored for '{id}'"),
            }
        }
        StateCommand::Set {
            state_id,
            json,
            partial,
        } => {
            let id = StateId::new(state_id);
            service.set_json(&id, &json, partial)?;
            println!("State for '{id}' {}.", if partial { "merged" } else { "set" });
        }
        StateCommand::Clear { state_id } => {
            let id = StateId::new(state_id);
            service.clear(&id)?;
            println!("State for '{id}' cleared.");
        }
        StateCommand::Copy { src, dst } => {
            let (src, dst) = (StateId::new(src), StateId::new(dst));
            service.copy_state(&src, &dst)?;
            println!("Copied state '{src}' to '{dst}'.");
        }
        StateCommand::Merge { src, dst } => {
            let (src, dst) = (StateId::new(src), StateId::new(dst));
            service.merge_state(&src, &dst)?;
            println!("Merged state '{src}' into '{dst}'.");
        }
        StateCommand::Move { src, dst } => {
            let (src, dst) = (StateId::new(src), StateId::new(dst));
            service.move_state(&src, &dst)?;
            println!("Moved state '{src}' to '{dst}'.");
        }
    }

    Ok(())
}
