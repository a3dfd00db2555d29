//! Sampling trigger state - feedback counters of the fallback loop

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::identity::{EntityId, EntityPrefix};

/// Explicit key of one feedback loop instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TriggerKey {
    pub ruleset: EntityId,
    pub work_order: EntityId,
    pub step: EntityId,
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.ruleset, self.work_order, self.step)
    }
}

/// Per-(ruleset, work order, step) streak counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingTriggerState {
    /// Unique identifier (TRIG-xxx)
    pub id: EntityId,

    /// Rule set this state counts for (primary or fallback)
    pub ruleset: EntityId,

    /// Primary rule set of the family
    pub primary: EntityId,

    pub work_order: EntityId,

    pub step: EntityId,

    pub active: bool,

    /// Consecutive PASS reports
    #[serde(default)]
    pub success_count: u32,

    /// Consecutive FAIL reports
    #[serde(default)]
    pub fail_count: u32,

    /// Parts already counted by this state
    #[serde(default)]
    pub inspected_parts: BTreeSet<EntityId>,

    /// When this state became active
    pub triggered_at: DateTime<Utc>,

    /// Quality report that caused the state to become active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<EntityId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl SamplingTriggerState {
    /// Create an active state with zeroed counters
    pub fn new(
        ruleset: &EntityId,
        primary: &EntityId,
        work_order: &EntityId,
        step: &EntityId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Trig),
            ruleset: ruleset.clone(),
            primary: primary.clone(),
            work_order: work_order.clone(),
            step: step.clone(),
            active: true,
            success_count: 0,
            fail_count: 0,
            inspected_parts: BTreeSet::new(),
            triggered_at: now,
            triggered_by: None,
            deactivated_at: None,
        }
    }

    pub fn key(&self) -> TriggerKey {
        TriggerKey {
            ruleset: self.ruleset.clone(),
            work_order: self.work_order.clone(),
            step: self.step.clone(),
        }
    }

    /// Whether this state counts for the fallback rule set of its family
    pub fn is_fallback(&self) -> bool {
        self.ruleset != self.primary
    }

    pub fn deactivate(&mut self, now: DateTime<Utc>) {
        self.active = false;
        self.deactivated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_vs_fallback_state() {
        let primary = EntityId::new(EntityPrefix::Srs);
        let fallback = EntityId::new(EntityPrefix::Srs);
        let wo = EntityId::new(EntityPrefix::Wo);
        let step = EntityId::new(EntityPrefix::Step);

        let armed = SamplingTriggerState::new(&primary, &primary, &wo, &step, Utc::now());
        assert!(!armed.is_fallback());
        assert!(armed.active);

        let mut flipped = SamplingTriggerState::new(&fallback, &primary, &wo, &step, Utc::now());
        assert!(flipped.is_fallback());
        assert_eq!(flipped.key().ruleset, fallback);

        flipped.deactivate(Utc::now());
        assert!(!flipped.active);
        assert!(flipped.deactivated_at.is_some());
    }
}
