//! Engine error types

use miette::Diagnostic;
use thiserror::Error;

use crate::core::identity::EntityId;
use crate::core::store::StoreError;
use crate::entities::part::PartStatus;
use crate::entities::process::EdgeType;

/// Malformed definitions; fatal and never auto-corrected
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigurationError {
    #[error("process {process} has no steps")]
    #[diagnostic(code(tflow::config::empty_process))]
    EmptyProcess { process: EntityId },

    #[error("process {process} references undefined step {step}")]
    #[diagnostic(
        code(tflow::config::undefined_step),
        help("add a steps/*.tflow.yaml file defining the step or remove it from the process")
    )]
    UndefinedStep { process: EntityId, step: EntityId },

    #[error("step {step} is listed more than once in process {process}")]
    #[diagnostic(code(tflow::config::duplicate_step))]
    DuplicateStep { process: EntityId, step: EntityId },

    #[error("steps {first} and {second} both claim order {order} in process {process}")]
    #[diagnostic(code(tflow::config::duplicate_order))]
    DuplicateOrder {
        process: EntityId,
        order: u32,
        first: EntityId,
        second: EntityId,
    },

    #[error("process {process} has {count} entry points; at most one step may set is_entry_point")]
    #[diagnostic(code(tflow::config::multiple_entry_points))]
    MultipleEntryPoints { process: EntityId, count: usize },

    #[error("non-terminal step {step} has no DEFAULT edge in process {process}")]
    #[diagnostic(
        code(tflow::config::missing_default_edge),
        help("every non-terminal step needs exactly one DEFAULT outgoing edge")
    )]
    MissingDefaultEdge { process: EntityId, step: EntityId },

    #[error("decision step {step} has no ALTERNATE edge in process {process}")]
    #[diagnostic(
        code(tflow::config::missing_alternate_edge),
        help("decision steps route FAIL results over an ALTERNATE edge")
    )]
    MissingAlternateEdge { process: EntityId, step: EntityId },

    #[error("step {step} has no {edge_type} edge in process {process}")]
    #[diagnostic(code(tflow::config::missing_edge))]
    MissingEdge {
        process: EntityId,
        step: EntityId,
        edge_type: EdgeType,
    },

    #[error("edge {from} -> {to} in process {process} leaves the process")]
    #[diagnostic(code(tflow::config::foreign_edge))]
    ForeignEdge {
        process: EntityId,
        from: EntityId,
        to: EntityId,
    },

    #[error("step {step} has more than one {edge_type} edge in process {process}")]
    #[diagnostic(code(tflow::config::duplicate_edge))]
    DuplicateEdge {
        process: EntityId,
        step: EntityId,
        edge_type: EdgeType,
    },

    #[error("terminal step {step} has outgoing edges in process {process}")]
    #[diagnostic(code(tflow::config::terminal_edges))]
    TerminalWithEdges { process: EntityId, step: EntityId },

    #[error("step {step} has an ESCALATION edge but no max_visits")]
    #[diagnostic(code(tflow::config::escalation_without_limit))]
    EscalationWithoutLimit { process: EntityId, step: EntityId },

    #[error("step {step} is unreachable from the entry step of process {process}")]
    #[diagnostic(code(tflow::config::unreachable_step))]
    UnreachableStep { process: EntityId, step: EntityId },

    #[error("step {step} has pass_threshold {value}; expected 0.0..=1.0")]
    #[diagnostic(code(tflow::config::pass_threshold))]
    InvalidPassThreshold { step: EntityId, value: f64 },

    #[error("step {step} is not part of process {process}")]
    #[diagnostic(code(tflow::config::step_not_in_process))]
    StepNotInProcess { process: EntityId, step: EntityId },

    #[error("unknown process {0}")]
    #[diagnostic(code(tflow::config::unknown_process))]
    UnknownProcess(EntityId),

    #[error("process {0} is not released")]
    #[diagnostic(
        code(tflow::config::unpublished_process),
        help("set `status: released` once the graph is final")
    )]
    UnpublishedProcess(EntityId),

    #[error("part type '{part_type}' has two processes with version {version}")]
    #[diagnostic(code(tflow::config::duplicate_version))]
    DuplicateProcessVersion { part_type: String, version: u32 },

    #[error("definition {0} is defined more than once")]
    #[diagnostic(code(tflow::config::duplicate_definition))]
    DuplicateDefinition(EntityId),

    #[error("sampling rule set {ruleset}: {message}")]
    #[diagnostic(code(tflow::config::ruleset))]
    InvalidRuleset { ruleset: EntityId, message: String },

    #[error("{count} configuration errors")]
    #[diagnostic(code(tflow::config::multiple))]
    Multiple {
        count: usize,
        #[related]
        errors: Vec<ConfigurationError>,
    },
}

impl ConfigurationError {
    /// Collapse a list of problems into one error (None when empty)
    pub fn from_list(mut errors: Vec<ConfigurationError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            count => Some(ConfigurationError::Multiple { count, errors }),
        }
    }

    /// Flatten into individual problems
    pub fn into_list(self) -> Vec<ConfigurationError> {
        match self {
            ConfigurationError::Multiple { errors, .. } => errors,
            other => vec![other],
        }
    }
}

/// Errors raised by the workflow engine
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("part {part} at step {step} has no resolvable decision: {reason}")]
    #[diagnostic(
        code(tflow::engine::invalid_decision),
        help("re-issue the request with an explicit decision (--decision pass|fail)")
    )]
    InvalidDecision {
        part: EntityId,
        step: EntityId,
        reason: String,
    },

    #[error("invalid part transition for {part}: {from} -> {to}")]
    #[diagnostic(code(tflow::engine::invalid_transition))]
    InvalidTransition {
        part: EntityId,
        from: PartStatus,
        to: PartStatus,
    },

    #[error("invalid request: {0}")]
    #[diagnostic(code(tflow::engine::invalid_request))]
    InvalidRequest(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether re-issuing the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::EntityPrefix;

    #[test]
    fn test_from_list() {
        assert!(ConfigurationError::from_list(vec![]).is_none());

        let process = EntityId::new(EntityPrefix::Proc);
        let single = ConfigurationError::from_list(vec![ConfigurationError::EmptyProcess {
            process: process.clone(),
        }])
        .unwrap();
        assert!(matches!(single, ConfigurationError::EmptyProcess { .. }));

        let multiple = ConfigurationError::from_list(vec![
            ConfigurationError::EmptyProcess {
                process: process.clone(),
            },
            ConfigurationError::UnknownProcess(process),
        ])
        .unwrap();
        assert!(matches!(multiple, ConfigurationError::Multiple { count: 2, .. }));
        assert_eq!(multiple.into_list().len(), 2);
    }

    #[test]
    fn test_retryable_only_for_store_conflicts() {
        let conflict = EngineError::Store(StoreError::Conflict {
            entity: "part",
            id: "PART-x".to_string(),
            expected: 0,
        });
        assert!(conflict.is_retryable());
        let invalid = EngineError::InvalidRequest("nope".to_string());
        assert!(!invalid.is_retryable());
    }
}
