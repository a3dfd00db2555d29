//! WO record type - a cohort of parts produced and advanced together

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::identity::{EntityId, EntityPrefix};

/// Work order: the unit of batch synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Unique identifier (WO-xxx)
    pub id: EntityId,

    /// User-facing work order number
    pub number: String,

    /// Part type produced
    pub part_type: String,

    /// Pinned process version
    pub process: EntityId,

    /// Number of parts in the cohort
    pub quantity: u32,

    /// Free-form notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Creation timestamp
    pub created: DateTime<Utc>,

    /// Author
    pub author: String,
}

impl WorkOrder {
    pub fn new(
        number: impl Into<String>,
        part_type: impl Into<String>,
        process: EntityId,
        quantity: u32,
        author: impl Into<String>,
    ) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Wo),
            number: number.into(),
            part_type: part_type.into(),
            process,
            quantity,
            notes: None,
            created: Utc::now(),
            author: author.into(),
        }
    }
}
