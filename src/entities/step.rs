//! Step entity type - one node of a process graph

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::entity::{Entity, Status};
use crate::core::identity::{EntityId, EntityPrefix};
use crate::entities::part::PartStatus;

/// Where the outcome of a decision step comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// Latest quality report verdict for the part at this step
    QaResult,
    /// Measurements of the latest quality report against their limits
    Measurement,
    /// Supplied by the operator when finishing the step
    Manual,
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionType::QaResult => write!(f, "qa_result"),
            DecisionType::Measurement => write!(f, "measurement"),
            DecisionType::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for DecisionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qa_result" | "qa" => Ok(DecisionType::QaResult),
            "measurement" => Ok(DecisionType::Measurement),
            "manual" => Ok(DecisionType::Manual),
            _ => Err(format!(
                "Invalid decision type: {}. Use qa_result, measurement, or manual",
                s
            )),
        }
    }
}

/// Final disposition recorded when a part reaches a terminal step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Shipped,
    Stock,
    Scrapped,
    Returned,
    Cancelled,
}

impl TerminalStatus {
    /// Lifecycle status a part takes when it lands on a terminal step
    pub fn part_status(&self) -> PartStatus {
        match self {
            TerminalStatus::Completed | TerminalStatus::Shipped | TerminalStatus::Stock => {
                PartStatus::Completed
            }
            TerminalStatus::Scrapped => PartStatus::Scrapped,
            TerminalStatus::Returned | TerminalStatus::Cancelled => PartStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalStatus::Completed => write!(f, "completed"),
            TerminalStatus::Shipped => write!(f, "shipped"),
            TerminalStatus::Stock => write!(f, "stock"),
            TerminalStatus::Scrapped => write!(f, "scrapped"),
            TerminalStatus::Returned => write!(f, "returned"),
            TerminalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TerminalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "completed" => Ok(TerminalStatus::Completed),
            "shipped" => Ok(TerminalStatus::Shipped),
            "stock" => Ok(TerminalStatus::Stock),
            "scrapped" => Ok(TerminalStatus::Scrapped),
            "returned" => Ok(TerminalStatus::Returned),
            "cancelled" => Ok(TerminalStatus::Cancelled),
            _ => Err(format!("Invalid terminal status: {}", s)),
        }
    }
}

/// Step behavior, tagged by `step_type` in YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepKind {
    Start,
    Task,
    Timer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_minutes: Option<u32>,
    },
    Decision {
        decision_type: DecisionType,
    },
    Rework,
    Terminal {
        terminal_status: TerminalStatus,
    },
}

impl StepKind {
    /// The `step_type` tag
    pub fn step_type(&self) -> &'static str {
        match self {
            StepKind::Start => "start",
            StepKind::Task => "task",
            StepKind::Timer { .. } => "timer",
            StepKind::Decision { .. } => "decision",
            StepKind::Rework => "rework",
            StepKind::Terminal { .. } => "terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepKind::Terminal { .. })
    }

    pub fn decision_type(&self) -> Option<DecisionType> {
        match self {
            StepKind::Decision { decision_type } => Some(*decision_type),
            _ => None,
        }
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        match self {
            StepKind::Terminal { terminal_status } => Some(*terminal_status),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Decision { decision_type } => write!(f, "decision ({})", decision_type),
            StepKind::Terminal { terminal_status } => write!(f, "terminal ({})", terminal_status),
            other => write!(f, "{}", other.step_type()),
        }
    }
}

/// A Step entity - a unit of work, decision point or end state
///
/// Steps are linked into processes through [`crate::entities::process::ProcessStep`]
/// rather than pointing at a process, so one step can be reused by several
/// process versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier (STEP-xxx)
    pub id: EntityId,

    /// Step title
    pub title: String,

    /// Detailed description / operator notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Step behavior
    #[serde(flatten)]
    pub kind: StepKind,

    /// Maximum visits before the ESCALATION edge is forced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_visits: Option<u32>,

    /// Cohort cannot leave the step without a QA sign-off
    #[serde(default)]
    pub requires_qa_signoff: bool,

    /// Step is eligible for inspection sampling
    #[serde(default)]
    pub sampling_required: bool,

    /// Any quarantined cohort member blocks the whole cohort
    #[serde(default)]
    pub block_on_quarantine: bool,

    /// Minimum ratio of ready cohort members needed to advance (0.0 - 1.0)
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,

    /// Document status
    #[serde(default)]
    pub status: Status,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Author
    pub author: String,

    /// Entity revision number
    #[serde(default = "default_revision")]
    pub entity_revision: u32,
}

fn default_pass_threshold() -> f64 {
    1.0
}

fn default_revision() -> u32 {
    1
}

impl Entity for Step {
    const PREFIX: &'static str = "STEP";

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

impl Step {
    /// Create a new step
    pub fn new(title: impl Into<String>, kind: StepKind, author: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Step),
            title: title.into(),
            description: None,
            kind,
            max_visits: None,
            requires_qa_signoff: false,
            sampling_required: false,
            block_on_quarantine: false,
            pass_threshold: default_pass_threshold(),
            status: Status::Released,
            created: Utc::now(),
            author: author.into(),
            entity_revision: 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}
