//! Workflow engine - graph traversal, batch gating and adaptive sampling

pub mod advancer;
pub mod error;
pub mod events;
pub mod fallback;
pub mod graph;
pub mod lifecycle;
pub mod sampling;

pub use advancer::{
    BatchAdvancer, GateBlock, PartMove, ReportResult, TransitionOutcome, TransitionRequest,
    TransitionResult, WaitReason,
};
pub use error::{ConfigurationError, EngineError, EngineResult};
pub use events::FlowEvent;
pub use fallback::{FallbackTriggerTracker, TriggerChange};
pub use graph::ProcessGraph;
pub use sampling::SamplingEngine;
