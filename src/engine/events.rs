//! Audit events for part and cohort state changes
//!
//! Every event is logged through `tracing` and appended to the store's event
//! table inside the transaction that made the change, so the log never
//! disagrees with the state it describes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::identity::EntityId;
use crate::core::store::{StoreError, StoreTx};
use crate::engine::error::EngineResult;
use crate::entities::part::PartStatus;
use crate::entities::process::EdgeType;
use crate::entities::quality::{DecisionResult, Verdict};
use crate::entities::sampling::RuleType;
use crate::entities::step::TerminalStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowEvent {
    WorkOrderCreated {
        number: String,
        process: EntityId,
        quantity: u32,
        entry_step: EntityId,
    },
    PartStarted {
        step: EntityId,
        status: PartStatus,
    },
    PartReady {
        step: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision: Option<DecisionResult>,
    },
    PartAwaitingQa {
        step: EntityId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule: Option<RuleType>,
    },
    PartMoved {
        from: EntityId,
        to: EntityId,
        edge_type: EdgeType,
        visits: u32,
    },
    PartCompleted {
        step: EntityId,
        terminal_status: TerminalStatus,
    },
    PartStatusChanged {
        step: EntityId,
        from: PartStatus,
        to: PartStatus,
    },
    CohortAdvanced {
        step: EntityId,
        moved: usize,
    },
    CohortBlocked {
        step: EntityId,
        reason: String,
    },
    QualityReported {
        report: EntityId,
        step: EntityId,
        verdict: Verdict,
    },
    QaSignedOff {
        step: EntityId,
        approver: String,
    },
    SamplingTriggerActivated {
        step: EntityId,
        primary: EntityId,
        fallback: EntityId,
        report: EntityId,
    },
    SamplingTriggerReverted {
        step: EntityId,
        primary: EntityId,
        fallback: EntityId,
        report: EntityId,
    },
    DuplicateTriggerStates {
        step: EntityId,
        kept: EntityId,
        deactivated: Vec<EntityId>,
    },
}

impl FlowEvent {
    /// Stable event name, matching the serialized `kind` tag
    pub fn kind(&self) -> &'static str {
        match self {
            FlowEvent::WorkOrderCreated { .. } => "work_order_created",
            FlowEvent::PartStarted { .. } => "part_started",
            FlowEvent::PartReady { .. } => "part_ready",
            FlowEvent::PartAwaitingQa { .. } => "part_awaiting_qa",
            FlowEvent::PartMoved { .. } => "part_moved",
            FlowEvent::PartCompleted { .. } => "part_completed",
            FlowEvent::PartStatusChanged { .. } => "part_status_changed",
            FlowEvent::CohortAdvanced { .. } => "cohort_advanced",
            FlowEvent::CohortBlocked { .. } => "cohort_blocked",
            FlowEvent::QualityReported { .. } => "quality_reported",
            FlowEvent::QaSignedOff { .. } => "qa_signed_off",
            FlowEvent::SamplingTriggerActivated { .. } => "sampling_trigger_activated",
            FlowEvent::SamplingTriggerReverted { .. } => "sampling_trigger_reverted",
            FlowEvent::DuplicateTriggerStates { .. } => "duplicate_trigger_states",
        }
    }
}

/// Log an event and append it to the audit table
pub fn emit(
    tx: &StoreTx<'_>,
    work_order: &EntityId,
    part: Option<&EntityId>,
    event: &FlowEvent,
    now: DateTime<Utc>,
) -> EngineResult<i64> {
    let payload = serde_json::to_value(event).map_err(StoreError::from)?;
    let seq = tx.append_event(Some(work_order), part, event.kind(), &payload, &now)?;
    info!(
        seq,
        event = event.kind(),
        work_order = %work_order,
        part = part.map(|p| p.to_string()).unwrap_or_default(),
        "{}",
        payload
    );
    Ok(seq)
}
