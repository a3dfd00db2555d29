//! Process entity type - Versioned manufacturing process graphs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::entity::{Entity, Status};
use crate::core::identity::{EntityId, EntityPrefix};

/// Edge classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    /// Taken on pass or when no decision applies
    Default,
    /// Taken on fail
    Alternate,
    /// Taken once the visit count exceeds the step's `max_visits`
    Escalation,
}

impl EdgeType {
    pub fn all() -> &'static [EdgeType] {
        &[EdgeType::Default, EdgeType::Alternate, EdgeType::Escalation]
    }

    /// Position in fixed-size per-node edge tables
    pub fn index(&self) -> usize {
        match self {
            EdgeType::Default => 0,
            EdgeType::Alternate => 1,
            EdgeType::Escalation => 2,
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeType::Default => write!(f, "DEFAULT"),
            EdgeType::Alternate => write!(f, "ALTERNATE"),
            EdgeType::Escalation => write!(f, "ESCALATION"),
        }
    }
}

impl std::str::FromStr for EdgeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEFAULT" => Ok(EdgeType::Default),
            "ALTERNATE" => Ok(EdgeType::Alternate),
            "ESCALATION" => Ok(EdgeType::Escalation),
            _ => Err(format!(
                "Invalid edge type: {}. Use DEFAULT, ALTERNATE, or ESCALATION",
                s
            )),
        }
    }
}

/// Membership of a step in a process (join entity)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStep {
    /// Step ID (STEP-xxx)
    pub step: EntityId,

    /// Position in the process listing
    pub order: u32,

    /// Parts of a new work order start here
    #[serde(default)]
    pub is_entry_point: bool,
}

/// Directed, typed transition between two steps of this process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepEdge {
    pub from: EntityId,
    pub to: EntityId,
    #[serde(default = "default_edge_type")]
    pub edge_type: EdgeType,
}

fn default_edge_type() -> EdgeType {
    EdgeType::Default
}

/// A Process entity - a versioned recipe for one part type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Unique identifier (PROC-xxx)
    pub id: EntityId,

    /// Process title
    pub title: String,

    /// Part type this process manufactures
    pub part_type: String,

    /// Version number, incremented by each revision
    #[serde(default = "default_version")]
    pub version: u32,

    /// Process this version supersedes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<EntityId>,

    /// Detailed description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Steps of the process with their ordering
    #[serde(default)]
    pub steps: Vec<ProcessStep>,

    /// Edges between steps
    #[serde(default)]
    pub edges: Vec<StepEdge>,

    /// Document status (released = published and immutable)
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

fn default_version() -> u32 {
    1
}

fn default_revision() -> u32 {
    1
}

impl Entity for Process {
    const PREFIX: &'static str = "PROC";

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

impl Process {
    /// Create a new draft process
    pub fn new(title: impl Into<String>, part_type: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Proc),
            title: title.into(),
            part_type: part_type.into(),
            version: 1,
            previous_version: None,
            description: None,
            steps: Vec::new(),
            edges: Vec::new(),
            status: Status::Draft,
            created: Utc::now(),
            author: author.into(),
            entity_revision: 1,
        }
    }

    /// Append a step at the given order position
    pub fn add_step(&mut self, step: &EntityId, order: u32, is_entry_point: bool) {
        self.steps.push(ProcessStep {
            step: step.clone(),
            order,
            is_entry_point,
        });
    }

    /// Add an edge between two steps
    pub fn add_edge(&mut self, from: &EntityId, to: &EntityId, edge_type: EdgeType) {
        self.edges.push(StepEdge {
            from: from.clone(),
            to: to.clone(),
            edge_type,
        });
    }

    /// Create the next version of this process
    ///
    /// The new version is a disjoint draft carrying a copy of the graph and a
    /// `previous_version` link; the current version is never edited in place.
    pub fn new_revision(&self, author: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Proc),
            title: self.title.clone(),
            part_type: self.part_type.clone(),
            version: self.version + 1,
            previous_version: Some(self.id.clone()),
            description: self.description.clone(),
            steps: self.steps.clone(),
            edges: self.edges.clone(),
            status: Status::Draft,
            created: Utc::now(),
            author: author.into(),
            entity_revision: 1,
        }
    }

    /// Whether this process is published and can be used by work orders
    pub fn is_published(&self) -> bool {
        self.status.is_published()
    }
}
