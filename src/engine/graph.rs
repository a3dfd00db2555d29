//! Process graph - validated, immutable view of one process version
//!
//! Steps are stored in an arena ordered by their `order` position; edges are
//! arena indices in a fixed table per node, so there are no back-pointers and
//! rework cycles need no special representation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::core::identity::EntityId;
use crate::engine::error::ConfigurationError;
use crate::entities::process::{EdgeType, Process};
use crate::entities::step::Step;

#[derive(Debug, Clone)]
struct Node {
    step: Step,
    order: u32,
    edges: [Option<usize>; 3],
}

/// Graph of one process version
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    process: EntityId,
    part_type: String,
    version: u32,
    nodes: Vec<Node>,
    index: HashMap<EntityId, usize>,
    entry: usize,
}

impl ProcessGraph {
    /// Build and validate the graph of a process
    ///
    /// Every problem found is reported; nothing is corrected.
    pub fn build(
        process: &Process,
        steps: &HashMap<EntityId, Step>,
    ) -> Result<Self, ConfigurationError> {
        let pid = &process.id;
        let mut errors = Vec::new();

        if process.steps.is_empty() {
            return Err(ConfigurationError::EmptyProcess {
                process: pid.clone(),
            });
        }

        // Nodes in order position
        let mut members: Vec<_> = process.steps.iter().collect();
        members.sort_by_key(|m| m.order);

        let mut nodes: Vec<Node> = Vec::with_capacity(members.len());
        let mut index: HashMap<EntityId, usize> = HashMap::new();
        let mut by_order: HashMap<u32, EntityId> = HashMap::new();
        let mut entry_points = Vec::new();

        for member in members {
            let Some(step) = steps.get(&member.step) else {
                errors.push(ConfigurationError::UndefinedStep {
                    process: pid.clone(),
                    step: member.step.clone(),
                });
                continue;
            };
            if index.contains_key(&member.step) {
                errors.push(ConfigurationError::DuplicateStep {
                    process: pid.clone(),
                    step: member.step.clone(),
                });
                continue;
            }
            if let Some(first) = by_order.get(&member.order) {
                errors.push(ConfigurationError::DuplicateOrder {
                    process: pid.clone(),
                    order: member.order,
                    first: first.clone(),
                    second: member.step.clone(),
                });
            } else {
                by_order.insert(member.order, member.step.clone());
            }
            if !(0.0..=1.0).contains(&step.pass_threshold) {
                errors.push(ConfigurationError::InvalidPassThreshold {
                    step: step.id.clone(),
                    value: step.pass_threshold,
                });
            }
            if member.is_entry_point {
                entry_points.push(nodes.len());
            }
            index.insert(member.step.clone(), nodes.len());
            nodes.push(Node {
                step: step.clone(),
                order: member.order,
                edges: [None; 3],
            });
        }

        if entry_points.len() > 1 {
            errors.push(ConfigurationError::MultipleEntryPoints {
                process: pid.clone(),
                count: entry_points.len(),
            });
        }

        for edge in &process.edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.from), index.get(&edge.to)) else {
                errors.push(ConfigurationError::ForeignEdge {
                    process: pid.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
                continue;
            };
            let slot = &mut nodes[from].edges[edge.edge_type.index()];
            if slot.is_some() {
                errors.push(ConfigurationError::DuplicateEdge {
                    process: pid.clone(),
                    step: edge.from.clone(),
                    edge_type: edge.edge_type,
                });
            } else {
                *slot = Some(to);
            }
        }

        for node in &nodes {
            let step_id = &node.step.id;
            let has = |t: EdgeType| node.edges[t.index()].is_some();
            if node.step.is_terminal() {
                if node.edges.iter().any(Option::is_some) {
                    errors.push(ConfigurationError::TerminalWithEdges {
                        process: pid.clone(),
                        step: step_id.clone(),
                    });
                }
                continue;
            }
            if !has(EdgeType::Default) {
                errors.push(ConfigurationError::MissingDefaultEdge {
                    process: pid.clone(),
                    step: step_id.clone(),
                });
            }
            if node.step.kind.decision_type().is_some() && !has(EdgeType::Alternate) {
                errors.push(ConfigurationError::MissingAlternateEdge {
                    process: pid.clone(),
                    step: step_id.clone(),
                });
            }
            if has(EdgeType::Escalation) && node.step.max_visits.is_none() {
                errors.push(ConfigurationError::EscalationWithoutLimit {
                    process: pid.clone(),
                    step: step_id.clone(),
                });
            }
        }

        // Lowest order wins when nobody is flagged
        let entry = entry_points.first().copied().unwrap_or(0);

        if !nodes.is_empty() {
            let mut seen = vec![false; nodes.len()];
            let mut queue = VecDeque::from([entry]);
            seen[entry] = true;
            while let Some(current) = queue.pop_front() {
                for next in nodes[current].edges.iter().flatten() {
                    if !seen[*next] {
                        seen[*next] = true;
                        queue.push_back(*next);
                    }
                }
            }
            for (node, reached) in nodes.iter().zip(&seen) {
                if !reached {
                    errors.push(ConfigurationError::UnreachableStep {
                        process: pid.clone(),
                        step: node.step.id.clone(),
                    });
                }
            }
        }

        if let Some(err) = ConfigurationError::from_list(errors) {
            return Err(err);
        }

        Ok(Self {
            process: pid.clone(),
            part_type: process.part_type.clone(),
            version: process.version,
            nodes,
            index,
            entry,
        })
    }

    pub fn process_id(&self) -> &EntityId {
        &self.process
    }

    pub fn part_type(&self) -> &str {
        &self.part_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Step new parts start at
    pub fn entry_step(&self) -> &Step {
        &self.nodes[self.entry].step
    }

    pub fn contains(&self, step: &EntityId) -> bool {
        self.index.contains_key(step)
    }

    pub fn step(&self, step: &EntityId) -> Option<&Step> {
        self.index.get(step).map(|&i| &self.nodes[i].step)
    }

    /// Step lookup that treats a foreign step as a configuration error
    pub fn require_step(&self, step: &EntityId) -> Result<&Step, ConfigurationError> {
        self.step(step)
            .ok_or_else(|| ConfigurationError::StepNotInProcess {
                process: self.process.clone(),
                step: step.clone(),
            })
    }

    /// Target of one typed edge out of a step
    pub fn edge(&self, step: &EntityId, edge_type: EdgeType) -> Option<&EntityId> {
        let &i = self.index.get(step)?;
        self.nodes[i].edges[edge_type.index()].map(|to| &self.nodes[to].step.id)
    }

    /// All typed edges out of a step
    pub fn outgoing(&self, step: &EntityId) -> BTreeMap<EdgeType, EntityId> {
        EdgeType::all()
            .iter()
            .filter_map(|t| self.edge(step, *t).map(|to| (*t, to.clone())))
            .collect()
    }

    /// Steps in order position
    pub fn steps(&self) -> impl Iterator<Item = (u32, &Step)> {
        self.nodes.iter().map(|n| (n.order, &n.step))
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::step::{DecisionType, StepKind, TerminalStatus};

    struct Fixture {
        process: Process,
        steps: HashMap<EntityId, Step>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                process: Process::new("Overhaul", "PUMP-100", "test"),
                steps: HashMap::new(),
            }
        }

        fn step(&mut self, title: &str, kind: StepKind, order: u32) -> EntityId {
            let step = Step::new(title, kind, "test");
            let id = step.id.clone();
            self.process.add_step(&id, order, false);
            self.steps.insert(id.clone(), step);
            id
        }

        fn edge(&mut self, from: &EntityId, to: &EntityId, edge_type: EdgeType) {
            self.process.add_edge(from, to, edge_type);
        }

        fn build(&self) -> Result<ProcessGraph, ConfigurationError> {
            ProcessGraph::build(&self.process, &self.steps)
        }
    }

    fn ship() -> StepKind {
        StepKind::Terminal {
            terminal_status: TerminalStatus::Shipped,
        }
    }

    fn inspect() -> StepKind {
        StepKind::Decision {
            decision_type: DecisionType::QaResult,
        }
    }

    #[test]
    fn test_linear_graph() {
        let mut f = Fixture::new();
        let receive = f.step("Receive", StepKind::Start, 10);
        let work = f.step("Work", StepKind::Task, 20);
        let done = f.step("Ship", ship(), 30);
        f.edge(&receive, &work, EdgeType::Default);
        f.edge(&work, &done, EdgeType::Default);

        let graph = f.build().unwrap();
        assert_eq!(graph.entry_step().id, receive);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge(&receive, EdgeType::Default), Some(&work));
        assert!(graph.outgoing(&done).is_empty());
        let out = graph.outgoing(&work);
        assert_eq!(out.len(), 1);
        assert_eq!(out[&EdgeType::Default], done);
    }

    #[test]
    fn test_entry_point_flag_wins_over_order() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Task, 10);
        let b = f.step("B", StepKind::Start, 20);
        let end = f.step("End", ship(), 30);
        f.process.steps[1].is_entry_point = true;
        f.edge(&b, &a, EdgeType::Default);
        f.edge(&a, &end, EdgeType::Default);

        let graph = f.build().unwrap();
        assert_eq!(graph.entry_step().id, b);
    }

    #[test]
    fn test_missing_default_edge() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let b = f.step("B", StepKind::Task, 20);
        let end = f.step("End", ship(), 30);
        f.edge(&a, &b, EdgeType::Default);
        f.edge(&b, &end, EdgeType::Alternate);

        let err = f.build().unwrap_err();
        assert!(err
            .into_list()
            .iter()
            .any(|e| matches!(e, ConfigurationError::MissingDefaultEdge { step, .. } if *step == b)));
    }

    #[test]
    fn test_duplicate_order() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let end = f.step("End", ship(), 10);
        f.edge(&a, &end, EdgeType::Default);

        let err = f.build().unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateOrder { order: 10, .. }));
    }

    #[test]
    fn test_decision_requires_alternate() {
        let mut f = Fixture::new();
        let a = f.step("Inspect", inspect(), 10);
        let end = f.step("End", ship(), 20);
        f.edge(&a, &end, EdgeType::Default);

        let err = f.build().unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingAlternateEdge { .. }));
    }

    #[test]
    fn test_escalation_needs_max_visits() {
        let mut f = Fixture::new();
        let a = f.step("Rework", StepKind::Rework, 10);
        let end = f.step("End", ship(), 20);
        let scrap = f.step(
            "Scrap",
            StepKind::Terminal {
                terminal_status: TerminalStatus::Scrapped,
            },
            30,
        );
        f.edge(&a, &end, EdgeType::Default);
        f.edge(&a, &scrap, EdgeType::Escalation);

        let err = f.build().unwrap_err();
        assert!(matches!(err, ConfigurationError::EscalationWithoutLimit { .. }));

        f.steps.get_mut(&a).unwrap().max_visits = Some(2);
        assert!(f.build().is_ok());
    }

    #[test]
    fn test_undefined_step_and_foreign_edge() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let ghost = EntityId::new(crate::core::identity::EntityPrefix::Step);
        f.process.add_step(&ghost, 20, false);
        f.edge(&a, &ghost, EdgeType::Default);

        let errors = f.build().unwrap_err().into_list();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigurationError::UndefinedStep { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigurationError::ForeignEdge { .. })));
    }

    #[test]
    fn test_unreachable_step() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let end = f.step("End", ship(), 20);
        let orphan = f.step("Orphan", StepKind::Task, 30);
        f.edge(&a, &end, EdgeType::Default);
        f.edge(&orphan, &end, EdgeType::Default);

        let err = f.build().unwrap_err();
        assert!(
            matches!(err, ConfigurationError::UnreachableStep { ref step, .. } if *step == orphan)
        );
    }

    #[test]
    fn test_terminal_with_edges_and_duplicate_edge() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let b = f.step("B", StepKind::Task, 20);
        let end = f.step("End", ship(), 30);
        f.edge(&a, &b, EdgeType::Default);
        f.edge(&a, &end, EdgeType::Default);
        f.edge(&b, &end, EdgeType::Default);
        f.edge(&end, &a, EdgeType::Default);

        let errors = f.build().unwrap_err().into_list();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigurationError::DuplicateEdge { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigurationError::TerminalWithEdges { .. })));
    }

    #[test]
    fn test_pass_threshold_range() {
        let mut f = Fixture::new();
        let a = f.step("A", StepKind::Start, 10);
        let end = f.step("End", ship(), 20);
        f.edge(&a, &end, EdgeType::Default);
        f.steps.get_mut(&a).unwrap().pass_threshold = 1.5;

        let err = f.build().unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidPassThreshold { .. }));
    }

    #[test]
    fn test_rework_cycle_is_valid() {
        let mut f = Fixture::new();
        let start = f.step("Receive", StepKind::Start, 10);
        let check = f.step("Inspect", inspect(), 20);
        let rework = f.step("Rework", StepKind::Rework, 30);
        let end = f.step("Ship", ship(), 40);
        f.edge(&start, &check, EdgeType::Default);
        f.edge(&check, &end, EdgeType::Default);
        f.edge(&check, &rework, EdgeType::Alternate);
        f.edge(&rework, &check, EdgeType::Default);

        let graph = f.build().unwrap();
        assert_eq!(graph.edge(&rework, EdgeType::Default), Some(&check));
        assert_eq!(graph.edge(&check, EdgeType::Alternate), Some(&rework));
    }
}
