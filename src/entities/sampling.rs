//! Sampling rule sets - versioned inspection policy per (part type, process, step)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::entity::{Entity, Status};
use crate::core::identity::{EntityId, EntityPrefix};

/// Kind of sampling clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Every n-th part of the work order (by creation order)
    EveryNthPart,
    /// Deterministic pseudo-random selection with probability value/100
    Percentage,
    /// Non-deterministic selection with probability value/100
    Random,
    /// The first n parts of the work order
    FirstNParts,
    /// The last n parts of the work order
    LastNParts,
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleType::EveryNthPart => write!(f, "every_nth_part"),
            RuleType::Percentage => write!(f, "percentage"),
            RuleType::Random => write!(f, "random"),
            RuleType::FirstNParts => write!(f, "first_n_parts"),
            RuleType::LastNParts => write!(f, "last_n_parts"),
        }
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "every_nth_part" => Ok(RuleType::EveryNthPart),
            "percentage" => Ok(RuleType::Percentage),
            "random" => Ok(RuleType::Random),
            "first_n_parts" => Ok(RuleType::FirstNParts),
            "last_n_parts" => Ok(RuleType::LastNParts),
            _ => Err(format!(
                "Invalid rule type: {}. Use every_nth_part, percentage, random, first_n_parts, or last_n_parts",
                s
            )),
        }
    }
}

/// One evaluable clause of a rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRule {
    pub rule_type: RuleType,

    /// n for positional rules, percent (0-100) for probabilistic ones
    pub value: f64,

    /// Evaluation order (ascending)
    #[serde(default)]
    pub order: u32,
}

impl SamplingRule {
    pub fn new(rule_type: RuleType, value: f64, order: u32) -> Self {
        Self {
            rule_type,
            value,
            order,
        }
    }
}

/// A SamplingRuleSet entity - an immutable, versioned inspection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingRuleSet {
    /// Unique identifier (SRS-xxx)
    pub id: EntityId,

    /// Rule set title
    pub title: String,

    /// Part type in scope
    pub part_type: String,

    /// Process in scope
    pub process: EntityId,

    /// Step in scope
    pub step: EntityId,

    /// Version number
    #[serde(default = "default_version")]
    pub version: u32,

    /// Rule set this version replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<EntityId>,

    /// Whether this version is in effect
    #[serde(default = "default_active")]
    pub active: bool,

    /// Stricter policy used while a fallback trigger is active
    #[serde(default)]
    pub is_fallback: bool,

    /// Fallback rule set (primary sets only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<EntityId>,

    /// Consecutive failures that switch to the fallback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_threshold: Option<u32>,

    /// Consecutive passes on the fallback that switch back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_duration: Option<u32>,

    /// Rules, evaluated by ascending `order`
    #[serde(default)]
    pub rules: Vec<SamplingRule>,

    /// Document status
    #[serde(default)]
    pub status: Status,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Author
    pub author: String,
}

fn default_version() -> u32 {
    1
}

fn default_active() -> bool {
    true
}

impl Entity for SamplingRuleSet {
    const PREFIX: &'static str = "SRS";

    fn id(&self) -> &EntityId {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn status(&self) -> &str {
        match self.status {
            Status::Draft => "draft",
            Status::Review => "review",
            Status::Approved => "approved",
            Status::Released => "released",
            Status::Obsolete => "obsolete",
        }
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn author(&self) -> &str {
        &self.author
    }
}

impl SamplingRuleSet {
    /// Create a new, active primary rule set
    pub fn new(
        title: impl Into<String>,
        part_type: impl Into<String>,
        process: &EntityId,
        step: &EntityId,
        author: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Srs),
            title: title.into(),
            part_type: part_type.into(),
            process: process.clone(),
            step: step.clone(),
            version: 1,
            supersedes: None,
            active: true,
            is_fallback: false,
            fallback: None,
            fallback_threshold: None,
            fallback_duration: None,
            rules: Vec::new(),
            status: Status::Released,
            created: Utc::now(),
            author: author.into(),
        }
    }

    /// Builder-style rule addition
    pub fn with_rule(mut self, rule_type: RuleType, value: f64, order: u32) -> Self {
        self.rules.push(SamplingRule::new(rule_type, value, order));
        self
    }

    /// Rules in evaluation order (stable for equal `order`)
    pub fn ordered_rules(&self) -> Vec<&SamplingRule> {
        let mut rules: Vec<&SamplingRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.order);
        rules
    }

    /// Whether this primary set can switch to a fallback
    pub fn has_fallback(&self) -> bool {
        !self.is_fallback && self.fallback.is_some()
    }

    /// Whether this set applies to the given scope
    pub fn applies_to(&self, part_type: &str, process: &EntityId, step: &EntityId) -> bool {
        self.part_type == part_type && &self.process == process && &self.step == step
    }
}

/// The rule that decided a sampling resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredRule {
    pub rule_type: RuleType,
    pub value: f64,
    pub order: u32,
}

/// Inputs a resolution was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingContext {
    /// 1-based position of the part in its work order
    pub ordinal: u32,

    /// Number of parts in the work order
    pub cohort_size: u32,
}

/// Resolved sampling decision for one part at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingDecision {
    /// Step the decision was computed for
    pub step: EntityId,

    pub requires_sampling: bool,

    /// Rule that selected the part, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<FiredRule>,

    /// Rule set actually evaluated (the fallback when substituted)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ruleset: Option<EntityId>,

    /// Active primary rule set for the scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_ruleset: Option<EntityId>,

    /// Whether the fallback rule set was substituted
    #[serde(default)]
    pub fallback_active: bool,

    pub context: SamplingContext,
}

impl SamplingDecision {
    /// Decision for a step that is not sampled at all
    pub fn not_required(step: &EntityId, context: SamplingContext) -> Self {
        Self {
            step: step.clone(),
            requires_sampling: false,
            rule: None,
            ruleset: None,
            primary_ruleset: None,
            fallback_active: false,
            context,
        }
    }
}
