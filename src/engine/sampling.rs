//! Sampling engine - decides per part and step whether inspection is required

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::catalog::Catalog;
use crate::core::identity::EntityId;
use crate::core::store::StoreTx;
use crate::engine::error::EngineResult;
use crate::engine::fallback::FallbackTriggerTracker;
use crate::entities::part::Part;
use crate::entities::sampling::{
    FiredRule, RuleType, SamplingContext, SamplingDecision, SamplingRule, SamplingRuleSet,
};
use crate::entities::step::Step;

/// Resolves sampling decisions against the active rule sets of a catalog
pub struct SamplingEngine<'a> {
    catalog: &'a Catalog,
}

impl<'a> SamplingEngine<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Resolve whether `part` must be inspected at `step`
    ///
    /// Substitutes the fallback rule set while a fallback trigger is active for
    /// the part's work order at this step; the primary stays recorded.
    pub fn resolve(
        &self,
        tx: &StoreTx<'_>,
        part: &Part,
        step: &Step,
        cohort_size: u32,
    ) -> EngineResult<SamplingDecision> {
        let context = SamplingContext {
            ordinal: part.ordinal,
            cohort_size,
        };

        if !step.sampling_required {
            return Ok(SamplingDecision::not_required(&step.id, context));
        }

        let Some(primary) = self
            .catalog
            .active_ruleset(&part.part_type, &part.process, &step.id)
        else {
            debug!(part = %part.id, step = %step.id, "no active sampling rule set");
            return Ok(SamplingDecision::not_required(&step.id, context));
        };

        let tracker = FallbackTriggerTracker::new(self.catalog);
        let fallback = tracker.active_fallback(tx, primary, &part.work_order, &step.id)?;
        let evaluated = fallback.unwrap_or(primary);

        let fired = evaluate_rules(evaluated, &part.id, context);
        debug!(
            part = %part.id,
            step = %step.id,
            ruleset = %evaluated.id,
            fallback = fallback.is_some(),
            selected = fired.is_some(),
            "sampling resolved"
        );

        Ok(SamplingDecision {
            step: step.id.clone(),
            requires_sampling: fired.is_some(),
            rule: fired,
            ruleset: Some(evaluated.id.clone()),
            primary_ruleset: Some(primary.id.clone()),
            fallback_active: fallback.is_some(),
            context,
        })
    }
}

/// Evaluate rules in ascending order; the first decisive rule wins
pub fn evaluate_rules(
    ruleset: &SamplingRuleSet,
    part: &EntityId,
    context: SamplingContext,
) -> Option<FiredRule> {
    ruleset
        .ordered_rules()
        .into_iter()
        .find_map(|rule| {
            rule_outcome(rule, part, &ruleset.id, context).map(|selected| (rule, selected))
        })
        .filter(|(_, selected)| *selected)
        .map(|(rule, _)| FiredRule {
            rule_type: rule.rule_type,
            value: rule.value,
            order: rule.order,
        })
}

/// Outcome of one rule: `Some(true)` selects the part, `None` abstains
fn rule_outcome(
    rule: &SamplingRule,
    part: &EntityId,
    ruleset: &EntityId,
    context: SamplingContext,
) -> Option<bool> {
    let selected = match rule.rule_type {
        RuleType::EveryNthPart => {
            let n = positional_value(rule, ruleset)?;
            context.ordinal % n == 0
        }
        RuleType::FirstNParts => {
            let n = positional_value(rule, ruleset)?;
            context.ordinal <= n
        }
        RuleType::LastNParts => {
            let n = positional_value(rule, ruleset)?;
            context.ordinal > context.cohort_size.saturating_sub(n)
        }
        RuleType::Percentage => {
            let p = percent_value(rule, ruleset)?;
            seeded_rng(part, ruleset).random_bool(p / 100.0)
        }
        RuleType::Random => {
            let p = percent_value(rule, ruleset)?;
            rand::rng().random_bool(p / 100.0)
        }
    };
    selected.then_some(true)
}

/// n for positional rules; must be a whole number of at least 1
fn positional_value(rule: &SamplingRule, ruleset: &EntityId) -> Option<u32> {
    if rule.value >= 1.0 && rule.value.fract() == 0.0 && rule.value <= f64::from(u32::MAX) {
        Some(rule.value as u32)
    } else {
        warn!(
            ruleset = %ruleset,
            rule_type = %rule.rule_type,
            value = rule.value,
            "invalid rule value, rule skipped"
        );
        None
    }
}

/// Percentage in 0..=100
fn percent_value(rule: &SamplingRule, ruleset: &EntityId) -> Option<f64> {
    if (0.0..=100.0).contains(&rule.value) {
        Some(rule.value)
    } else {
        warn!(
            ruleset = %ruleset,
            rule_type = %rule.rule_type,
            value = rule.value,
            "invalid rule value, rule skipped"
        );
        None
    }
}

/// Generator seeded by (part, rule set) so repeated draws agree
fn seeded_rng(part: &EntityId, ruleset: &EntityId) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(part.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(ruleset.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    StdRng::seed_from_u64(u64::from_le_bytes(seed))
}
