//! Entity type definitions
//!
//! **Definitions** (YAML files in a project, immutable once released):
//! - [`Process`] - Versioned process graph for one part type
//! - [`Step`] - Graph node (task, decision, rework, terminal, ...)
//! - [`SamplingRuleSet`] - Versioned inspection policy for one step
//!
//! **Runtime records** (stored in the state database):
//! - [`WorkOrder`] - Cohort of parts advanced together
//! - [`Part`] - Traveler with status, current step and visit counters
//! - [`QualityReport`] / [`QaSignoff`] - Inspection outcomes and step releases
//! - [`SamplingTriggerState`] - Fallback feedback counters

pub mod part;
pub mod process;
pub mod quality;
pub mod sampling;
pub mod step;
pub mod trigger;
pub mod work_order;

pub use part::{Part, PartStatus};
pub use process::{EdgeType, Process, ProcessStep, StepEdge};
pub use quality::{DecisionResult, Measurement, QaSignoff, QualityReport, Verdict};
pub use sampling::{RuleType, SamplingDecision, SamplingRule, SamplingRuleSet};
pub use step::{DecisionType, Step, StepKind, TerminalStatus};
pub use trigger::{SamplingTriggerState, TriggerKey};
pub use work_order::WorkOrder;
