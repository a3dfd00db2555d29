//! Entity identity system using type-prefixed ULIDs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

/// Entity type prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityPrefix {
    /// Manufacturing process (versioned graph definition)
    Proc,
    /// Process step (graph node)
    Step,
    /// Sampling rule set
    Srs,
    /// Work order (cohort of parts)
    Wo,
    /// Part (graph traveler)
    Part,
    /// Quality report (inspection outcome)
    Qr,
    /// QA sign-off for a step of a work order
    Qas,
    /// Sampling trigger state (fallback feedback loop)
    Trig,
}

impl EntityPrefix {
    /// Get the string representation of the prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityPrefix::Proc => "PROC",
            EntityPrefix::Step => "STEP",
            EntityPrefix::Srs => "SRS",
            EntityPrefix::Wo => "WO",
            EntityPrefix::Part => "PART",
            EntityPrefix::Qr => "QR",
            EntityPrefix::Qas => "QAS",
            EntityPrefix::Trig => "TRIG",
        }
    }

    /// Get all valid prefixes
    pub fn all() -> &'static [EntityPrefix] {
        &[
            EntityPrefix::Proc,
            EntityPrefix::Step,
            EntityPrefix::Srs,
            EntityPrefix::Wo,
            EntityPrefix::Part,
            EntityPrefix::Qr,
            EntityPrefix::Qas,
            EntityPrefix::Trig,
        ]
    }

    /// Prefixes of entities defined as YAML files in a project
    pub fn definitions() -> &'static [EntityPrefix] {
        &[EntityPrefix::Proc, EntityPrefix::Step, EntityPrefix::Srs]
    }
}

impl fmt::Display for EntityPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityPrefix {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|prefix| prefix.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| IdParseError::InvalidPrefix(s.to_string()))
    }
}

/// A unique entity identifier combining a type prefix and ULID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId {
    prefix: EntityPrefix,
    ulid: Ulid,
}

impl EntityId {
    /// Create a new EntityId with the given prefix
    pub fn new(prefix: EntityPrefix) -> Self {
        Self {
            prefix,
            ulid: Ulid::new(),
        }
    }

    /// Get the entity prefix
    pub fn prefix(&self) -> EntityPrefix {
        self.prefix
    }

    /// Parse an EntityId from a string
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        s.parse()
    }

    /// Parse an EntityId and require a specific prefix
    pub fn parse_as(s: &str, expected: EntityPrefix) -> Result<Self, IdParseError> {
        let id: EntityId = s.parse()?;
        if id.prefix != expected {
            return Err(IdParseError::WrongPrefix {
                id: s.to_string(),
                expected,
            });
        }
        Ok(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.ulid)
    }
}

impl FromStr for EntityId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix_str, ulid_str) = s
            .split_once('-')
            .ok_or_else(|| IdParseError::MissingDelimiter(s.to_string()))?;

        let prefix = prefix_str.parse()?;
        let ulid = Ulid::from_string(ulid_str)
            .map_err(|e| IdParseError::InvalidUlid(ulid_str.to_string(), e.to_string()))?;

        Ok(Self { prefix, ulid })
    }
}

impl Serialize for EntityId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur when parsing entity IDs
#[derive(Debug, Error)]
pub enum IdParseError {
    #[error("invalid entity prefix: '{0}' (valid: PROC, STEP, SRS, WO, PART, QR, QAS, TRIG)")]
    InvalidPrefix(String),

    #[error("missing '-' delimiter in entity ID: '{0}'")]
    MissingDelimiter(String),

    #[error("invalid ULID '{0}': {1}")]
    InvalidUlid(String, String),

    #[error("entity ID '{id}' is not a {expected} ID")]
    WrongPrefix { id: String, expected: EntityPrefix },
}
