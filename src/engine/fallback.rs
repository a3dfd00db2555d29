//! Fallback trigger tracker - the feedback loop between inspection results
//! and the sampling rule set in force
//!
//! Each (rule set family, work order, step) carries at most one active
//! [`SamplingTriggerState`]. While the state counts for the primary rule set,
//! a streak of FAIL reports flips the family to its fallback; while it counts
//! for the fallback, a streak of PASS reports reverts to the primary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::core::catalog::Catalog;
use crate::core::identity::EntityId;
use crate::core::store::StoreTx;
use crate::engine::error::EngineResult;
use crate::engine::events::{emit, FlowEvent};
use crate::entities::part::Part;
use crate::entities::quality::{QualityReport, Verdict};
use crate::entities::sampling::SamplingRuleSet;
use crate::entities::trigger::SamplingTriggerState;

/// Fallback settings of a primary rule set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub fallback: EntityId,
    /// Consecutive FAILs that switch to the fallback
    pub threshold: u32,
    /// Consecutive PASSes that switch back
    pub duration: u32,
}

impl TriggerPolicy {
    /// Policy of a primary rule set (None without a fallback)
    pub fn of(primary: &SamplingRuleSet) -> Option<Self> {
        if !primary.has_fallback() {
            return None;
        }
        Some(Self {
            fallback: primary.fallback.clone()?,
            threshold: primary.fallback_threshold.unwrap_or(1).max(1),
            duration: primary.fallback_duration.unwrap_or(1).max(1),
        })
    }
}

/// What a single report did to a trigger state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Part was already counted by this state
    AlreadyInspected,
    Counted,
    /// Primary state reached its fail threshold
    Flip,
    /// Fallback state reached its success duration
    Revert,
}

/// A flip or revert caused by a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TriggerChange {
    Activated { primary: EntityId, fallback: EntityId },
    Reverted { primary: EntityId, fallback: EntityId },
}

/// Count one report against a state
pub fn apply_report(
    state: &mut SamplingTriggerState,
    policy: &TriggerPolicy,
    part: &EntityId,
    verdict: Verdict,
) -> TriggerOutcome {
    if !state.inspected_parts.insert(part.clone()) {
        return TriggerOutcome::AlreadyInspected;
    }

    match verdict {
        Verdict::Pass => {
            state.success_count += 1;
            state.fail_count = 0;
        }
        Verdict::Fail => {
            state.fail_count += 1;
            state.success_count = 0;
        }
    }

    if state.is_fallback() {
        if state.success_count >= policy.duration {
            return TriggerOutcome::Revert;
        }
    } else if state.fail_count >= policy.threshold {
        return TriggerOutcome::Flip;
    }
    TriggerOutcome::Counted
}

/// Split active states of one family into the survivor and the extras
///
/// The most recently triggered state survives; ties go to the highest id.
pub fn resolve_duplicates(
    mut states: Vec<SamplingTriggerState>,
) -> (Option<SamplingTriggerState>, Vec<SamplingTriggerState>) {
    states.sort_by(|a, b| {
        b.triggered_at
            .cmp(&a.triggered_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    let mut iter = states.into_iter();
    let keep = iter.next();
    (keep, iter.collect())
}

/// Tracks trigger states against the rule sets of a catalog
pub struct FallbackTriggerTracker<'a> {
    catalog: &'a Catalog,
}

impl<'a> FallbackTriggerTracker<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Arm the primary rule set for a cohort entering a step
    ///
    /// Does nothing when the set has no fallback or a state of the family is
    /// already active.
    pub fn arm(
        &self,
        tx: &StoreTx<'_>,
        primary: &SamplingRuleSet,
        work_order: &EntityId,
        step: &EntityId,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SamplingTriggerState>> {
        if !primary.has_fallback() {
            return Ok(None);
        }
        if self.current(tx, &primary.id, work_order, step, now)?.is_some() {
            return Ok(None);
        }
        let state = SamplingTriggerState::new(&primary.id, &primary.id, work_order, step, now);
        tx.insert_trigger_state(&state)?;
        debug!(
            ruleset = %primary.id,
            work_order = %work_order,
            step = %step,
            "armed sampling trigger"
        );
        Ok(Some(state))
    }

    /// Fallback rule set currently substituting `primary`, if any
    pub fn active_fallback(
        &self,
        tx: &StoreTx<'_>,
        primary: &SamplingRuleSet,
        work_order: &EntityId,
        step: &EntityId,
    ) -> EngineResult<Option<&'a SamplingRuleSet>> {
        if !primary.has_fallback() {
            return Ok(None);
        }
        let state = self.current(tx, &primary.id, work_order, step, Utc::now())?;
        Ok(state
            .filter(SamplingTriggerState::is_fallback)
            .and_then(|s| self.catalog.ruleset(&s.ruleset)))
    }

    /// Count a quality report; flips or reverts the family when a streak completes
    pub fn record_report(
        &self,
        tx: &StoreTx<'_>,
        report: &QualityReport,
        part: &Part,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<TriggerChange>> {
        let Some(primary) =
            self.catalog
                .active_ruleset(&part.part_type, &part.process, &report.step)
        else {
            return Ok(None);
        };
        let Some(policy) = TriggerPolicy::of(primary) else {
            return Ok(None);
        };
        let Some(mut state) = self.current(tx, &primary.id, &report.work_order, &report.step, now)?
        else {
            debug!(
                ruleset = %primary.id,
                work_order = %report.work_order,
                step = %report.step,
                "no active sampling trigger, report not counted"
            );
            return Ok(None);
        };

        match apply_report(&mut state, &policy, &part.id, report.verdict) {
            TriggerOutcome::AlreadyInspected => {
                debug!(
                    trigger = %state.id,
                    part = %part.id,
                    "part already counted by sampling trigger"
                );
                Ok(None)
            }
            TriggerOutcome::Counted => {
                tx.update_trigger_state(&state)?;
                debug!(
                    trigger = %state.id,
                    success = state.success_count,
                    fail = state.fail_count,
                    "sampling trigger counted report"
                );
                Ok(None)
            }
            TriggerOutcome::Flip => {
                state.deactivate(now);
                tx.update_trigger_state(&state)?;
                let mut next = SamplingTriggerState::new(
                    &policy.fallback,
                    &primary.id,
                    &report.work_order,
                    &report.step,
                    now,
                );
                next.triggered_by = Some(report.id.clone());
                tx.insert_trigger_state(&next)?;

                info!(
                    primary = %primary.id,
                    fallback = %policy.fallback,
                    work_order = %report.work_order,
                    step = %report.step,
                    "fallback sampling activated"
                );
                emit(
                    tx,
                    &report.work_order,
                    Some(&part.id),
                    &FlowEvent::SamplingTriggerActivated {
                        step: report.step.clone(),
                        primary: primary.id.clone(),
                        fallback: policy.fallback.clone(),
                        report: report.id.clone(),
                    },
                    now,
                )?;
                Ok(Some(TriggerChange::Activated {
                    primary: primary.id.clone(),
                    fallback: policy.fallback,
                }))
            }
            TriggerOutcome::Revert => {
                state.deactivate(now);
                tx.update_trigger_state(&state)?;
                let mut next = SamplingTriggerState::new(
                    &primary.id,
                    &primary.id,
                    &report.work_order,
                    &report.step,
                    now,
                );
                next.triggered_by = Some(report.id.clone());
                tx.insert_trigger_state(&next)?;

                info!(
                    primary = %primary.id,
                    fallback = %state.ruleset,
                    work_order = %report.work_order,
                    step = %report.step,
                    "fallback sampling reverted to primary"
                );
                emit(
                    tx,
                    &report.work_order,
                    Some(&part.id),
                    &FlowEvent::SamplingTriggerReverted {
                        step: report.step.clone(),
                        primary: primary.id.clone(),
                        fallback: state.ruleset.clone(),
                        report: report.id.clone(),
                    },
                    now,
                )?;
                Ok(Some(TriggerChange::Reverted {
                    primary: primary.id.clone(),
                    fallback: state.ruleset,
                }))
            }
        }
    }

    /// The single active state of a family, deactivating any duplicates
    fn current(
        &self,
        tx: &StoreTx<'_>,
        primary: &EntityId,
        work_order: &EntityId,
        step: &EntityId,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<SamplingTriggerState>> {
        let states = tx.active_trigger_states(primary, work_order, step)?;
        let (keep, extras) = resolve_duplicates(states);
        let Some(keep) = keep else {
            return Ok(None);
        };
        if extras.is_empty() {
            return Ok(Some(keep));
        }

        error!(
            primary = %primary,
            work_order = %work_order,
            step = %step,
            kept = %keep.id,
            duplicates = extras.len(),
            "duplicate active sampling trigger states, deactivating all but the latest"
        );
        let mut deactivated = Vec::with_capacity(extras.len());
        for mut extra in extras {
            extra.deactivate(now);
            tx.update_trigger_state(&extra)?;
            deactivated.push(extra.id);
        }
        emit(
            tx,
            work_order,
            None,
            &FlowEvent::DuplicateTriggerStates {
                step: step.clone(),
                kept: keep.id.clone(),
                deactivated,
            },
            now,
        )?;
        Ok(Some(keep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::EntityPrefix;
    use chrono::Duration;

    fn ids() -> (EntityId, EntityId, EntityId, EntityId) {
        (
            EntityId::new(EntityPrefix::Srs),
            EntityId::new(EntityPrefix::Srs),
            EntityId::new(EntityPrefix::Wo),
            EntityId::new(EntityPrefix::Step),
        )
    }

    fn policy(fallback: &EntityId) -> TriggerPolicy {
        TriggerPolicy {
            fallback: fallback.clone(),
            threshold: 3,
            duration: 2,
        }
    }

    fn part() -> EntityId {
        EntityId::new(EntityPrefix::Part)
    }

    #[test]
    fn test_three_consecutive_fails_flip() {
        let (primary, fallback, wo, step) = ids();
        let mut state = SamplingTriggerState::new(&primary, &primary, &wo, &step, Utc::now());
        let policy = policy(&fallback);

        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Fail),
            TriggerOutcome::Counted
        );
        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Fail),
            TriggerOutcome::Counted
        );
        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Fail),
            TriggerOutcome::Flip
        );
    }

    #[test]
    fn test_pass_breaks_fail_streak() {
        let (primary, fallback, wo, step) = ids();
        let mut state = SamplingTriggerState::new(&primary, &primary, &wo, &step, Utc::now());
        let policy = policy(&fallback);

        apply_report(&mut state, &policy, &part(), Verdict::Fail);
        apply_report(&mut state, &policy, &part(), Verdict::Fail);
        apply_report(&mut state, &policy, &part(), Verdict::Pass);
        assert_eq!(state.fail_count, 0);
        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Fail),
            TriggerOutcome::Counted
        );
    }

    #[test]
    fn test_same_part_counts_once() {
        let (primary, fallback, wo, step) = ids();
        let mut state = SamplingTriggerState::new(&primary, &primary, &wo, &step, Utc::now());
        let policy = policy(&fallback);
        let p = part();

        apply_report(&mut state, &policy, &p, Verdict::Fail);
        assert_eq!(
            apply_report(&mut state, &policy, &p, Verdict::Fail),
            TriggerOutcome::AlreadyInspected
        );
        assert_eq!(state.fail_count, 1);
    }

    #[test]
    fn test_fallback_reverts_after_duration() {
        let (primary, fallback, wo, step) = ids();
        let mut state = SamplingTriggerState::new(&fallback, &primary, &wo, &step, Utc::now());
        let policy = policy(&fallback);

        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Pass),
            TriggerOutcome::Counted
        );
        assert_eq!(
            apply_report(&mut state, &policy, &part(), Verdict::Pass),
            TriggerOutcome::Revert
        );
    }

    #[test]
    fn test_fails_on_fallback_never_flip_again() {
        let (primary, fallback, wo, step) = ids();
        let mut state = SamplingTriggerState::new(&fallback, &primary, &wo, &step, Utc::now());
        let policy = policy(&fallback);
        for _ in 0..5 {
            assert_eq!(
                apply_report(&mut state, &policy, &part(), Verdict::Fail),
                TriggerOutcome::Counted
            );
        }
    }

    #[test]
    fn test_resolve_duplicates_keeps_latest() {
        let (primary, fallback, wo, step) = ids();
        let now = Utc::now();
        let older = SamplingTriggerState::new(&primary, &primary, &wo, &step, now - Duration::minutes(5));
        let newer = SamplingTriggerState::new(&fallback, &primary, &wo, &step, now);

        let (keep, extras) = resolve_duplicates(vec![older.clone(), newer.clone()]);
        assert_eq!(keep.unwrap().id, newer.id);
        assert_eq!(extras.len(), 1);
        assert_eq!(extras[0].id, older.id);

        let (keep, extras) = resolve_duplicates(Vec::new());
        assert!(keep.is_none());
        assert!(extras.is_empty());
    }

    #[test]
    fn test_policy_requires_fallback() {
        let proc = EntityId::new(EntityPrefix::Proc);
        let step = EntityId::new(EntityPrefix::Step);
        let mut set = SamplingRuleSet::new("Inspect", "PUMP-100", &proc, &step, "qa");
        assert!(TriggerPolicy::of(&set).is_none());

        let fallback = EntityId::new(EntityPrefix::Srs);
        set.fallback = Some(fallback.clone());
        set.fallback_threshold = Some(3);
        set.fallback_duration = Some(2);
        assert_eq!(TriggerPolicy::of(&set), Some(policy(&fallback)));
    }
}
