//! Expanding a task list into runnable block sets.
//!
//! Task names are plugin names or task-set names. Task sets expand
//! recursively, each contributing its `env` to the blocks expanded from it
//! (outer sets first, inner sets override). The flat block list is then
//! grouped: an extractor opens an extract-load set, mappers join it, and a
//! loader closes it. Utilities run on their own.

use std::collections::BTreeMap;

use elflow_types::state::StateId;

use crate::block::{BlockRole, BlockSpec};
use crate::config::types::ProjectConfig;

/// Errors from task expansion and grouping.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no tasks given")]
    Empty,

    #[error("'{0}' is neither a plugin nor a task set")]
    UnknownTask(String),

    #[error("task set cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("{role} '{block}' has no preceding extractor")]
    MissingExtractor { block: String, role: BlockRole },

    #[error("extractor '{extractor}' is not followed by a loader")]
    MissingLoader { extractor: String },

    #[error("a state id override needs exactly one extract-load set, found {0}")]
    AmbiguousStateId(usize),
}

/// One extract-load chain plus the id its bookmarks are stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractLoadSet {
    pub blocks: Vec<BlockSpec>,
    pub state_id: StateId,
}

impl ExtractLoadSet {
    #[must_use]
    pub fn extractor(&self) -> &BlockSpec {
        &self.blocks[0]
    }

    #[must_use]
    pub fn loader(&self) -> &BlockSpec {
        &self.blocks[self.blocks.len() - 1]
    }
}

/// A unit of work in a run, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockSet {
    ExtractLoad(ExtractLoadSet),
    Single(BlockSpec),
}

/// State id options for [`BlockParser::parse`].
#[derive(Debug, Clone, Default)]
pub struct StateIdOptions {
    /// Use this id instead of the generated one.
    pub state_id: Option<String>,
    /// Appended to the generated id as `:<suffix>`.
    pub suffix: Option<String>,
}

/// Expands task names against a project.
#[derive(Debug, Clone, Copy)]
pub struct BlockParser<'a> {
    project: &'a ProjectConfig,
}

impl<'a> BlockParser<'a> {
    #[must_use]
    pub fn new(project: &'a ProjectConfig) -> Self {
        Self { project }
    }

    /// Expand `tasks` (whitespace-separated names allowed in each entry)
    /// into ordered block sets.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] for unknown names, task-set cycles, or a block
    /// order that cannot be grouped.
    pub fn parse(&self, tasks: &[String], ids: &StateIdOptions) -> Result<Vec<BlockSet>, ParseError> {
        let blocks = self.expand_all(tasks)?;
        if blocks.is_empty() {
            return Err(ParseError::Empty);
        }
        let mut sets = self.group(blocks)?;

        if let Some(state_id) = &ids.state_id {
            let el_count = sets
                .iter()
                .filter(|s| matches!(s, BlockSet::ExtractLoad(_)))
                .count();
            if el_count != 1 {
                return Err(ParseError::AmbiguousStateId(el_count));
            }
            for set in &mut sets {
                if let BlockSet::ExtractLoad(el) = set {
                    el.state_id = StateId::new(state_id.clone());
                }
            }
        } else if let Some(suffix) = &ids.suffix {
            for set in &mut sets {
                if let BlockSet::ExtractLoad(el) = set {
                    el.state_id = StateId::new(format!("{}:{suffix}", el.state_id));
                }
            }
        }

        Ok(sets)
    }

    /// Expand task names into a flat list of blocks.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnknownTask`] or [`ParseError::Cycle`].
    pub fn expand_all(&self, tasks: &[String]) -> Result<Vec<BlockSpec>, ParseError> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        for name in tasks.iter().flat_map(|t| t.split_whitespace()) {
            self.expand(name, &BTreeMap::new(), &mut path, &mut out)?;
        }
        Ok(out)
    }

    fn expand(
        &self,
        name: &str,
        env: &BTreeMap<String, String>,
        path: &mut Vec<String>,
        out: &mut Vec<BlockSpec>,
    ) -> Result<(), ParseError> {
        if let Some(task_set) = self.project.task_set(name) {
            if path.iter().any(|p| p == name) {
                let mut cycle = path.clone();
                cycle.push(name.to_string());
                return Err(ParseError::Cycle(cycle));
            }
            let mut layered = env.clone();
            layered.extend(task_set.env.iter().map(|(k, v)| (k.clone(), v.clone())));

            path.push(name.to_string());
            for task in task_set.tasks.iter().flat_map(|t| t.split_whitespace()) {
                self.expand(task, &layered, path, out)?;
            }
            path.pop();
            return Ok(());
        }

        let plugin = self
            .project
            .plugin(name)
            .ok_or_else(|| ParseError::UnknownTask(name.to_string()))?;
        out.push(BlockSpec {
            plugin: plugin.clone(),
            env: env.clone(),
        });
        Ok(())
    }

    fn group(&self, blocks: Vec<BlockSpec>) -> Result<Vec<BlockSet>, ParseError> {
        let mut sets = Vec::new();
        let mut open: Vec<BlockSpec> = Vec::new();

        for block in blocks {
            match block.role() {
                BlockRole::Extractor => {
                    if let Some(extractor) = open.first() {
                        return Err(ParseError::MissingLoader {
                            extractor: extractor.name().to_string(),
                        });
                    }
                    open.push(block);
                }
                BlockRole::Mapper => {
                    if open.is_empty() {
                        return Err(missing_extractor(&block));
                    }
                    open.push(block);
                }
                BlockRole::Loader => {
                    if open.is_empty() {
                        return Err(missing_extractor(&block));
                    }
                    open.push(block);
                    let blocks = std::mem::take(&mut open);
                    let state_id = self.default_state_id(&blocks[0], &blocks[blocks.len() - 1]);
                    sets.push(BlockSet::ExtractLoad(ExtractLoadSet { blocks, state_id }));
                }
                BlockRole::Utility => {
                    if let Some(extractor) = open.first() {
                        return Err(ParseError::MissingLoader {
                            extractor: extractor.name().to_string(),
                        });
                    }
                    sets.push(BlockSet::Single(block));
                }
            }
        }

        if let Some(extractor) = open.first() {
            return Err(ParseError::MissingLoader {
                extractor: extractor.name().to_string(),
            });
        }
        Ok(sets)
    }

    fn default_state_id(&self, extractor: &BlockSpec, loader: &BlockSpec) -> StateId {
        StateId::new(format!(
            "{}:{}-to-{}",
            self.project.environment,
            extractor.name(),
            loader.name()
        ))
    }
}

fn missing_extractor(block: &BlockSpec) -> ParseError {
    ParseError::MissingExtractor {
        block: block.name().to_string(),
        role: block.role(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_project_str;

    const PROJECT: &str = r"
environment: dev
plugins:
  - {name: tap-a, role: extractor}
  - {name: tap-b, role: extractor}
  - {name: map-x, role: mapper}
  - {name: target-z, role: loader}
  - {name: dbt, role: utility}
task_sets:
  - name: inner
    tasks: [map-x, target-z]
    env: {LEVEL: inner, INNER_ONLY: 'yes'}
  - name: outer
    tasks: ['tap-a inner']
    env: {LEVEL: outer, OUTER_ONLY: 'yes'}
  - name: sibling
    tasks: [tap-b, target-z]
    env: {SIBLING: 'yes'}
  - name: loop-a
    tasks: [loop-b]
  - name: loop-b
    tasks: [tap-a, loop-a]
";

    fn tasks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn parse(names: &[&str]) -> Result<Vec<BlockSet>, ParseError> {
        let project = parse_project_str(PROJECT).unwrap();
        BlockParser::new(&project).parse(&tasks(names), &StateIdOptions::default())
    }

    fn el(set: &BlockSet) -> &ExtractLoadSet {
        match set {
            BlockSet::ExtractLoad(el) => el,
            BlockSet::Single(spec) => panic!("expected extract-load set, got {}", spec.name()),
        }
    }

    #[test]
    fn groups_plain_plugin_names() {
        let sets = parse(&["tap-a", "map-x", "target-z", "dbt"]).unwrap();
        assert_eq!(sets.len(), 2);
        let first = el(&sets[0]);
        assert_eq!(first.blocks.len(), 3);
        assert_eq!(first.extractor().name(), "tap-a");
        assert_eq!(first.loader().name(), "target-z");
        assert_eq!(first.state_id.as_str(), "dev:tap-a-to-target-z");
        assert!(matches!(&sets[1], BlockSet::Single(s) if s.name() == "dbt"));
    }

    #[test]
    fn nested_task_sets_layer_env() {
        let sets = parse(&["outer", "sibling"]).unwrap();
        let first = el(&sets[0]);
        let tap = &first.blocks[0];
        assert_eq!(tap.env.get("LEVEL").map(String::as_str), Some("outer"));
        assert!(tap.env.get("INNER_ONLY").is_none());

        let target = first.loader();
        assert_eq!(target.env.get("LEVEL").map(String::as_str), Some("inner"));
        assert_eq!(target.env.get("OUTER_ONLY").map(String::as_str), Some("yes"));
        assert!(target.env.get("SIBLING").is_none());

        let second = el(&sets[1]);
        assert_eq!(second.state_id.as_str(), "dev:tap-b-to-target-z");
        assert_eq!(second.loader().env.get("SIBLING").map(String::as_str), Some("yes"));
        assert!(second.loader().env.get("LEVEL").is_none());
    }

    #[test]
    fn cycles_are_reported_with_path() {
        assert_eq!(
            parse(&["loop-a"]).unwrap_err(),
            ParseError::Cycle(tasks(&["loop-a", "loop-b", "loop-a"]))
        );
    }

    #[test]
    fn grouping_errors() {
        assert_eq!(parse(&["nope"]).unwrap_err(), ParseError::UnknownTask("nope".into()));
        assert_eq!(parse(&[]).unwrap_err(), ParseError::Empty);
        assert!(matches!(
            parse(&["target-z"]).unwrap_err(),
            ParseError::MissingExtractor { role: BlockRole::Loader, .. }
        ));
        assert!(matches!(
            parse(&["map-x", "target-z"]).unwrap_err(),
            ParseError::MissingExtractor { role: BlockRole::Mapper, .. }
        ));
        assert_eq!(
            parse(&["tap-a"]).unwrap_err(),
            ParseError::MissingLoader { extractor: "tap-a".into() }
        );
        assert_eq!(
            parse(&["tap-a", "tap-b", "target-z"]).unwrap_err(),
            ParseError::MissingLoader { extractor: "tap-a".into() }
        );
        assert_eq!(
            parse(&["tap-a", "dbt", "target-z"]).unwrap_err(),
            ParseError::MissingLoader { extractor: "tap-a".into() }
        );
    }

    #[test]
    fn state_id_override_and_suffix() {
        let project = parse_project_str(PROJECT).unwrap();
        let parser = BlockParser::new(&project);

        let ids = StateIdOptions {
            state_id: Some("custom".into()),
            suffix: None,
        };
        let sets = parser.parse(&tasks(&["tap-a target-z"]), &ids).unwrap();
        assert_eq!(el(&sets[0]).state_id.as_str(), "custom");

        let err = parser
            .parse(&tasks(&["tap-a", "target-z", "tap-b", "target-z"]), &ids)
            .unwrap_err();
        assert_eq!(err, ParseError::AmbiguousStateId(2));

        let ids = StateIdOptions {
            state_id: None,
            suffix: Some("backfill".into()),
        };
        let sets = parser.parse(&tasks(&["tap-a", "target-z"]), &ids).unwrap();
        assert_eq!(el(&sets[0]).state_id.as_str(), "dev:tap-a-to-target-z:backfill");
    }
}
