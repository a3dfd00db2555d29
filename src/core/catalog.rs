//! Definition catalog - processes, steps and sampling rule sets of a project
//!
//! The catalog is built once per command from the YAML definitions and is
//! read-only afterwards. Every released process is turned into a validated
//! [`ProcessGraph`] up front, so a malformed graph is reported before any part
//! is moved.

use std::collections::{BTreeMap, HashMap, HashSet};

use miette::Diagnostic;
use thiserror::Error;
use tracing::debug;

use crate::core::entity::Entity;
use crate::core::identity::{EntityId, EntityPrefix};
use crate::core::loader::{self, LoadError};
use crate::core::project::Project;
use crate::engine::error::ConfigurationError;
use crate::engine::graph::ProcessGraph;
use crate::entities::process::Process;
use crate::entities::sampling::SamplingRuleSet;
use crate::entities::step::Step;

/// Errors raised while building a catalog from a project
#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Validated set of definitions
#[derive(Debug, Default)]
pub struct Catalog {
    processes: BTreeMap<EntityId, Process>,
    steps: HashMap<EntityId, Step>,
    rulesets: BTreeMap<EntityId, SamplingRuleSet>,
    graphs: HashMap<EntityId, ProcessGraph>,
}

/// Drop definitions whose ID was already seen, recording each as an error
fn unique_definitions<T: Entity>(items: Vec<T>, errors: &mut Vec<ConfigurationError>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| {
            if seen.insert(item.id().clone()) {
                return true;
            }
            debug!(kind = T::PREFIX, id = %item.id(), title = item.title(), "duplicate definition");
            errors.push(ConfigurationError::DuplicateDefinition(item.id().clone()));
            false
        })
        .collect()
}

impl Catalog {
    /// Build a catalog, validating every definition
    pub fn new(
        processes: Vec<Process>,
        steps: Vec<Step>,
        rulesets: Vec<SamplingRuleSet>,
    ) -> Result<Self, ConfigurationError> {
        let mut errors = Vec::new();
        let mut catalog = Catalog::default();

        for step in unique_definitions(steps, &mut errors) {
            catalog.steps.insert(step.id.clone(), step);
        }

        let mut versions: HashSet<(String, u32)> = HashSet::new();
        for process in unique_definitions(processes, &mut errors) {
            if !versions.insert((process.part_type.clone(), process.version)) {
                errors.push(ConfigurationError::DuplicateProcessVersion {
                    part_type: process.part_type.clone(),
                    version: process.version,
                });
            }
            if process.is_published() {
                match ProcessGraph::build(&process, &catalog.steps) {
                    Ok(graph) => {
                        catalog.graphs.insert(process.id.clone(), graph);
                    }
                    Err(err) => errors.extend(err.into_list()),
                }
            }
            catalog.processes.insert(process.id.clone(), process);
        }

        for ruleset in unique_definitions(rulesets, &mut errors) {
            catalog.rulesets.insert(ruleset.id.clone(), ruleset);
        }
        errors.extend(catalog.check_rulesets());

        match ConfigurationError::from_list(errors) {
            Some(err) => Err(err),
            None => {
                debug!(
                    processes = catalog.processes.len(),
                    steps = catalog.steps.len(),
                    rulesets = catalog.rulesets.len(),
                    "catalog built"
                );
                Ok(catalog)
            }
        }
    }

    /// Load and validate all definitions of a project
    pub fn load(project: &Project) -> Result<Self, CatalogError> {
        let dir = |prefix: EntityPrefix| {
            project
                .root()
                .join(Project::entity_directory(prefix).unwrap_or_default())
        };
        let processes: Vec<Process> = loader::load_all(&dir(EntityPrefix::Proc))?;
        let steps: Vec<Step> = loader::load_all(&dir(EntityPrefix::Step))?;
        let rulesets: Vec<SamplingRuleSet> = loader::load_all(&dir(EntityPrefix::Srs))?;
        Ok(Self::new(processes, steps, rulesets)?)
    }

    fn check_rulesets(&self) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        let mut versions: HashSet<(String, EntityId, EntityId, u32, bool)> = HashSet::new();

        for set in self.rulesets.values() {
            let invalid = |message: String| ConfigurationError::InvalidRuleset {
                ruleset: set.id.clone(),
                message,
            };

            match self.processes.get(&set.process) {
                None => errors.push(invalid(format!("unknown process {}", set.process))),
                Some(process) => {
                    if process.part_type != set.part_type {
                        errors.push(invalid(format!(
                            "part type '{}' does not match process part type '{}'",
                            set.part_type, process.part_type
                        )));
                    }
                    if !process.steps.iter().any(|m| m.step == set.step) {
                        errors.push(invalid(format!(
                            "step {} is not part of process {}",
                            set.step, set.process
                        )));
                    }
                }
            }

            if !versions.insert((
                set.part_type.clone(),
                set.process.clone(),
                set.step.clone(),
                set.version,
                set.is_fallback,
            )) {
                errors.push(invalid(format!(
                    "another rule set for the same step already has version {}",
                    set.version
                )));
            }

            if set.is_fallback {
                if set.fallback.is_some() {
                    errors.push(invalid("a fallback rule set cannot have a fallback".into()));
                }
                continue;
            }

            let Some(fallback_id) = &set.fallback else {
                continue;
            };
            match self.rulesets.get(fallback_id) {
                None => errors.push(invalid(format!("unknown fallback rule set {}", fallback_id))),
                Some(fallback) => {
                    if !fallback.is_fallback {
                        errors.push(invalid(format!(
                            "fallback {} is not marked is_fallback",
                            fallback_id
                        )));
                    }
                    if !fallback.applies_to(&set.part_type, &set.process, &set.step) {
                        errors.push(invalid(format!(
                            "fallback {} is scoped to a different step",
                            fallback_id
                        )));
                    }
                }
            }
            if set.fallback_threshold.unwrap_or(0) == 0 {
                errors.push(invalid("fallback_threshold must be at least 1".into()));
            }
            if set.fallback_duration.unwrap_or(0) == 0 {
                errors.push(invalid("fallback_duration must be at least 1".into()));
            }
        }

        errors
    }

    pub fn process(&self, id: &EntityId) -> Option<&Process> {
        self.processes.get(id)
    }

    pub fn step(&self, id: &EntityId) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn ruleset(&self, id: &EntityId) -> Option<&SamplingRuleSet> {
        self.rulesets.get(id)
    }

    /// Validated graph of a released process
    pub fn graph(&self, process: &EntityId) -> Result<&ProcessGraph, ConfigurationError> {
        if let Some(graph) = self.graphs.get(process) {
            return Ok(graph);
        }
        if self.processes.contains_key(process) {
            Err(ConfigurationError::UnpublishedProcess(process.clone()))
        } else {
            Err(ConfigurationError::UnknownProcess(process.clone()))
        }
    }

    /// Processes sorted by part type, then version
    pub fn processes(&self) -> Vec<&Process> {
        let mut list: Vec<&Process> = self.processes.values().collect();
        list.sort_by(|a, b| {
            a.part_type
                .cmp(&b.part_type)
                .then(a.version.cmp(&b.version))
        });
        list
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.values()
    }

    pub fn rulesets(&self) -> impl Iterator<Item = &SamplingRuleSet> {
        self.rulesets.values()
    }

    /// Newest released process version for a part type
    pub fn latest_process(&self, part_type: &str) -> Option<&Process> {
        self.processes
            .values()
            .filter(|p| p.part_type == part_type && p.is_published())
            .max_by_key(|p| p.version)
    }

    /// Active primary rule set for (part type, process, step)
    ///
    /// The highest version with `active: true` wins; fallback sets are never
    /// selected here.
    pub fn active_ruleset(
        &self,
        part_type: &str,
        process: &EntityId,
        step: &EntityId,
    ) -> Option<&SamplingRuleSet> {
        self.rulesets
            .values()
            .filter(|s| s.active && !s.is_fallback && s.applies_to(part_type, process, step))
            .max_by_key(|s| s.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::Status;
    use crate::entities::process::EdgeType;
    use crate::entities::sampling::RuleType;
    use crate::entities::step::{StepKind, TerminalStatus};
    use tempfile::tempdir;

    fn simple_process(part_type: &str, version: u32) -> (Process, Vec<Step>) {
        let start = Step::new("Receive", StepKind::Start, "t");
        let end = Step::new(
            "Ship",
            StepKind::Terminal {
                terminal_status: TerminalStatus::Shipped,
            },
            "t",
        );
        let mut process = Process::new("Flow", part_type, "t");
        process.version = version;
        process.status = Status::Released;
        process.add_step(&start.id, 10, true);
        process.add_step(&end.id, 20, false);
        process.add_edge(&start.id, &end.id, EdgeType::Default);
        (process, vec![start, end])
    }

    #[test]
    fn test_latest_process_picks_highest_released() {
        let (v1, mut steps) = simple_process("PUMP-100", 1);
        let mut v2 = v1.new_revision("t");
        v2.status = Status::Released;
        let v3 = v2.new_revision("t");
        let (other, other_steps) = simple_process("VALVE-7", 1);
        steps.extend(other_steps);

        let catalog = Catalog::new(
            vec![v1, v2.clone(), v3.clone(), other],
            steps,
            vec![],
        )
        .unwrap();
        assert_eq!(catalog.latest_process("PUMP-100").unwrap().id, v2.id);
        assert!(matches!(
            catalog.graph(&v3.id),
            Err(ConfigurationError::UnpublishedProcess(_))
        ));
        assert!(catalog.latest_process("GEAR-1").is_none());
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let (a, steps) = simple_process("PUMP-100", 1);
        let mut b = a.clone();
        b.id = EntityId::new(EntityPrefix::Proc);
        let err = Catalog::new(vec![a, b], steps, vec![]).unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateProcessVersion { .. }));
    }

    #[test]
    fn test_active_ruleset_selection() {
        let (process, steps) = simple_process("PUMP-100", 1);
        let step = steps[0].id.clone();
        let v1 = SamplingRuleSet::new("v1", "PUMP-100", &process.id, &step, "t")
            .with_rule(RuleType::EveryNthPart, 2.0, 0);
        let mut v2 = SamplingRuleSet::new("v2", "PUMP-100", &process.id, &step, "t");
        v2.version = 2;
        let mut v3 = SamplingRuleSet::new("v3", "PUMP-100", &process.id, &step, "t");
        v3.version = 3;
        v3.active = false;
        let mut fallback = SamplingRuleSet::new("fb", "PUMP-100", &process.id, &step, "t");
        fallback.version = 9;
        fallback.is_fallback = true;

        let pid = process.id.clone();
        let catalog = Catalog::new(
            vec![process],
            steps,
            vec![v1, v2.clone(), v3, fallback],
        )
        .unwrap();
        assert_eq!(
            catalog.active_ruleset("PUMP-100", &pid, &step).unwrap().id,
            v2.id
        );
        assert!(catalog.active_ruleset("VALVE-7", &pid, &step).is_none());
    }

    #[test]
    fn test_ruleset_fallback_checks() {
        let (process, steps) = simple_process("PUMP-100", 1);
        let step = steps[0].id.clone();
        let not_fallback = SamplingRuleSet::new("x", "PUMP-100", &process.id, &step, "t");
        let mut primary = SamplingRuleSet::new("p", "PUMP-100", &process.id, &step, "t");
        primary.version = 2;
        primary.fallback = Some(not_fallback.id.clone());

        let errors = Catalog::new(vec![process], steps, vec![not_fallback, primary])
            .unwrap_err()
            .into_list();
        // not marked fallback, missing threshold, missing duration
        assert_eq!(errors.len(), 3);
        assert!(errors
            .iter()
            .all(|e| matches!(e, ConfigurationError::InvalidRuleset { .. })));
    }

    #[test]
    fn test_load_from_project() {
        let tmp = tempdir().unwrap();
        let project = Project::init(tmp.path()).unwrap();
        let (process, steps) = simple_process("PUMP-100", 1);
        for step in &steps {
            std::fs::write(
                project.root().join(format!("steps/{}.tflow.yaml", step.id)),
                serde_yml::to_string(step).unwrap(),
            )
            .unwrap();
        }
        std::fs::write(
            project.root().join("processes/flow.tflow.yaml"),
            serde_yml::to_string(&process).unwrap(),
        )
        .unwrap();

        let catalog = Catalog::load(&project).unwrap();
        assert!(catalog.graph(&process.id).is_ok());
        assert_eq!(catalog.processes().len(), 1);
    }

    #[test]
    fn test_load_reports_broken_graph() {
        let tmp = tempdir().unwrap();
        let project = Project::init(tmp.path()).unwrap();
        let (mut process, steps) = simple_process("PUMP-100", 1);
        process.edges.clear();
        for step in &steps {
            std::fs::write(
                project.root().join(format!("steps/{}.tflow.yaml", step.id)),
                serde_yml::to_string(step).unwrap(),
            )
            .unwrap();
        }
        std::fs::write(
            project.root().join("processes/flow.tflow.yaml"),
            serde_yml::to_string(&process).unwrap(),
        )
        .unwrap();

        let err = Catalog::load(&project).unwrap_err();
        assert!(matches!(err, CatalogError::Configuration(_)));
    }
}
