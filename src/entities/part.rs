//! PART record type - the unit traveling through a process graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::identity::{EntityId, EntityPrefix};
use crate::entities::quality::DecisionResult;
use crate::entities::sampling::SamplingDecision;
use crate::entities::step::TerminalStatus;
use crate::entities::work_order::WorkOrder;

/// Part lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum PartStatus {
    #[default]
    Pending,
    InProgress,
    AwaitingQa,
    ReadyForNextStep,
    Completed,
    Quarantined,
    ReworkNeeded,
    ReworkInProgress,
    Scrapped,
    Cancelled,
}

impl PartStatus {
    pub fn all() -> &'static [PartStatus] {
        &[
            PartStatus::Pending,
            PartStatus::InProgress,
            PartStatus::AwaitingQa,
            PartStatus::ReadyForNextStep,
            PartStatus::Completed,
            PartStatus::Quarantined,
            PartStatus::ReworkNeeded,
            PartStatus::ReworkInProgress,
            PartStatus::Scrapped,
            PartStatus::Cancelled,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Pending => "pending",
            PartStatus::InProgress => "in_progress",
            PartStatus::AwaitingQa => "awaiting_qa",
            PartStatus::ReadyForNextStep => "ready_for_next_step",
            PartStatus::Completed => "completed",
            PartStatus::Quarantined => "quarantined",
            PartStatus::ReworkNeeded => "rework_needed",
            PartStatus::ReworkInProgress => "rework_in_progress",
            PartStatus::Scrapped => "scrapped",
            PartStatus::Cancelled => "cancelled",
        }
    }

    /// No further traversal happens from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PartStatus::Completed | PartStatus::Scrapped | PartStatus::Cancelled
        )
    }

    /// Finished with the current step as far as the cohort barrier is concerned
    pub fn is_settled(&self) -> bool {
        matches!(self, PartStatus::ReadyForNextStep | PartStatus::Quarantined)
    }
}

impl std::fmt::Display for PartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PartStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_lowercase().replace('-', "_");
        PartStatus::all()
            .iter()
            .find(|status| status.as_str() == normalized)
            .copied()
            .ok_or_else(|| format!("Invalid part status: {}", s))
    }
}

/// A part of a work order and its position in the process graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Unique identifier (PART-xxx)
    pub id: EntityId,

    /// Work order (cohort) this part belongs to
    pub work_order: EntityId,

    /// Part type being manufactured
    pub part_type: String,

    /// Process version the part travels through
    pub process: EntityId,

    /// Current step
    pub step: EntityId,

    /// 1-based position in the work order's creation order
    pub ordinal: u32,

    /// Lifecycle status
    #[serde(default)]
    pub status: PartStatus,

    /// Completed visits per step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub visits: BTreeMap<EntityId, u32>,

    /// Decision recorded when the part was marked ready at a decision step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionResult>,

    /// Final disposition once a terminal step was reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<TerminalStatus>,

    /// Cached sampling decision for the current step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingDecision>,

    /// When the part entered its current step
    pub step_entered: DateTime<Utc>,

    /// Optimistic concurrency revision
    #[serde(default)]
    pub revision: u32,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Last update timestamp
    pub updated: DateTime<Utc>,
}

impl Part {
    /// Create a new pending part of a work order at the given step
    pub fn new(work_order: &WorkOrder, ordinal: u32, step: &EntityId) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(EntityPrefix::Part),
            work_order: work_order.id.clone(),
            part_type: work_order.part_type.clone(),
            process: work_order.process.clone(),
            step: step.clone(),
            ordinal,
            status: PartStatus::Pending,
            visits: BTreeMap::new(),
            decision: None,
            terminal_status: None,
            sampling: None,
            step_entered: now,
            revision: 0,
            created: now,
            updated: now,
        }
    }

    /// Completed visits recorded for a step
    pub fn visits_at(&self, step: &EntityId) -> u32 {
        self.visits.get(step).copied().unwrap_or(0)
    }

    /// Record one more completed visit of a step
    pub fn record_visit(&mut self, step: &EntityId) -> u32 {
        let count = self.visits.entry(step.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Move the part onto a new step, clearing per-step state
    pub fn enter_step(&mut self, step: &EntityId, status: PartStatus, now: DateTime<Utc>) {
        self.step = step.clone();
        self.status = status;
        self.decision = None;
        self.sampling = None;
        self.step_entered = now;
        self.updated = now;
    }

    /// Whether the cached sampling decision asks for inspection at the current step
    pub fn requires_sampling(&self) -> bool {
        self.sampling
            .as_ref()
            .is_some_and(|s| s.step == self.step && s.requires_sampling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_order() -> WorkOrder {
        WorkOrder::new(
            "WO-1001",
            "PUMP-100",
            EntityId::new(EntityPrefix::Proc),
            2,
            "planner",
        )
    }

    #[test]
    fn test_part_creation() {
        let wo = work_order();
        let step = EntityId::new(EntityPrefix::Step);
        let part = Part::new(&wo, 1, &step);
        assert!(part.id.to_string().starts_with("PART-"));
        assert_eq!(part.status, PartStatus::Pending);
        assert_eq!(part.work_order, wo.id);
        assert_eq!(part.visits_at(&step), 0);
    }

    #[test]
    fn test_record_visit_counts_per_step() {
        let wo = work_order();
        let a = EntityId::new(EntityPrefix::Step);
        let b = EntityId::new(EntityPrefix::Step);
        let mut part = Part::new(&wo, 1, &a);
        assert_eq!(part.record_visit(&a), 1);
        assert_eq!(part.record_visit(&a), 2);
        assert_eq!(part.record_visit(&b), 1);
        assert_eq!(part.visits_at(&a), 2);
    }

    #[test]
    fn test_enter_step_clears_step_state() {
        let wo = work_order();
        let a = EntityId::new(EntityPrefix::Step);
        let b = EntityId::new(EntityPrefix::Step);
        let mut part = Part::new(&wo, 1, &a);
        part.decision = Some(DecisionResult::Fail);
        part.enter_step(&b, PartStatus::InProgress, Utc::now());
        assert_eq!(part.step, b);
        assert_eq!(part.status, PartStatus::InProgress);
        assert!(part.decision.is_none());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(
            "ready_for_next_step".parse::<PartStatus>().unwrap(),
            PartStatus::ReadyForNextStep
        );
        assert_eq!(
            "awaiting-qa".parse::<PartStatus>().unwrap(),
            PartStatus::AwaitingQa
        );
        assert!("limbo".parse::<PartStatus>().is_err());
    }

    #[test]
    fn test_settled_and_terminal() {
        assert!(PartStatus::ReadyForNextStep.is_settled());
        assert!(PartStatus::Quarantined.is_settled());
        assert!(!PartStatus::InProgress.is_settled());
        assert!(PartStatus::Scrapped.is_terminal());
        assert!(!PartStatus::Quarantined.is_terminal());
    }

    #[test]
    fn test_part_json_roundtrip_keeps_visits() {
        let wo = work_order();
        let a = EntityId::new(EntityPrefix::Step);
        let mut part = Part::new(&wo, 3, &a);
        part.record_visit(&a);
        let json = serde_json::to_string(&part).unwrap();
        let back: Part = serde_json::from_str(&json).unwrap();
        assert_eq!(back.visits_at(&a), 1);
        assert_eq!(back.ordinal, 3);
    }
}
