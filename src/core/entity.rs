//! Entity trait - common interface for definition entities

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::core::identity::EntityId;

/// Common trait for entities defined as project files
pub trait Entity: Serialize + DeserializeOwned {
    /// The entity type prefix (e.g., "PROC", "STEP")
    const PREFIX: &'static str;

    /// Get the entity's unique ID
    fn id(&self) -> &EntityId;

    /// Get the entity's title
    fn title(&self) -> &str;

    /// Get the entity's status
    fn status(&self) -> &str;

    /// Get the creation timestamp
    fn created(&self) -> DateTime<Utc>;

    /// Get the author
    fn author(&self) -> &str;
}

/// Document status of a definition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum Status {
    #[default]
    Draft,
    Review,
    Approved,
    Released,
    Obsolete,
}

impl Status {
    /// Released definitions are published: immutable and usable by work orders
    pub fn is_published(&self) -> bool {
        matches!(self, Status::Released)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Draft => write!(f, "draft"),
            Status::Review => write!(f, "review"),
            Status::Approved => write!(f, "approved"),
            Status::Released => write!(f, "released"),
            Status::Obsolete => write!(f, "obsolete"),
        }
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(Status::Draft),
            "review" => Ok(Status::Review),
            "approved" => Ok(Status::Approved),
            "released" => Ok(Status::Released),
            "obsolete" => Ok(Status::Obsolete),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}
