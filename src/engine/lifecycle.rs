//! Part lifecycle transition table

use crate::core::identity::EntityId;
use crate::engine::error::{EngineError, EngineResult};
use crate::entities::part::PartStatus;

/// Statuses reachable from `current`
pub fn allowed_transitions(current: PartStatus) -> Vec<PartStatus> {
    use PartStatus::*;
    match current {
        Pending => vec![InProgress, Scrapped, Cancelled],
        InProgress => vec![
            AwaitingQa,
            ReadyForNextStep,
            Quarantined,
            ReworkNeeded,
            Completed,
            Scrapped,
            Cancelled,
        ],
        AwaitingQa => vec![ReadyForNextStep, Quarantined, Scrapped, Cancelled],
        // Leaving a step lands in progress at the target or directly on a terminal mapping
        ReadyForNextStep => vec![InProgress, Quarantined, Completed, Scrapped, Cancelled],
        Quarantined => vec![ReadyForNextStep, ReworkNeeded, Scrapped, Cancelled],
        ReworkNeeded => vec![ReworkInProgress, Scrapped, Cancelled],
        ReworkInProgress => vec![
            AwaitingQa,
            ReadyForNextStep,
            Quarantined,
            Scrapped,
            Cancelled,
        ],
        Completed | Scrapped | Cancelled => vec![],
    }
}

/// Check if a part status transition is valid
pub fn is_valid_transition(from: PartStatus, to: PartStatus) -> bool {
    allowed_transitions(from).contains(&to)
}

/// Fail with `InvalidTransition` unless `from -> to` is in the table
pub fn check_transition(part: &EntityId, from: PartStatus, to: PartStatus) -> EngineResult<()> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            part: part.clone(),
            from,
            to,
        })
    }
}
