//! Quality records - inspection reports and QA sign-offs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::identity::{EntityId, EntityPrefix};

/// Inspection verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pass" => Ok(Verdict::Pass),
            "fail" => Ok(Verdict::Fail),
            _ => Err(format!("Invalid verdict: {}. Use pass or fail", s)),
        }
    }
}

/// Outcome used to pick an edge out of a decision step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionResult {
    Pass,
    Fail,
}

impl From<Verdict> for DecisionResult {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Pass => DecisionResult::Pass,
            Verdict::Fail => DecisionResult::Fail,
        }
    }
}

impl std::fmt::Display for DecisionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecisionResult::Pass => write!(f, "pass"),
            DecisionResult::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for DecisionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Verdict>().map(DecisionResult::from)
    }
}

/// One measured characteristic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Characteristic name (e.g., "bore diameter")
    pub name: String,

    /// Measured value
    pub value: f64,

    /// Minimum acceptable value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Maximum acceptable value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    /// Unit of measurement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Measurement {
    pub fn is_within_limits(&self) -> bool {
        self.min.map_or(true, |min| self.value >= min)
            && self.max.map_or(true, |max| self.value <= max)
    }
}

/// Inspection outcome for one part at one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Unique identifier (QR-xxx)
    pub id: EntityId,

    /// Inspected part
    pub part: EntityId,

    /// Work order of the part
    pub work_order: EntityId,

    /// Step the inspection belongs to
    pub step: EntityId,

    /// PASS / FAIL
    pub verdict: Verdict,

    /// Measurement data
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub measurements: Vec<Measurement>,

    /// Inspector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspector: Option<String>,

    /// Notes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    /// Creation timestamp
    pub created: DateTime<Utc>,
}

impl QualityReport {
    pub fn new(part: &EntityId, work_order: &EntityId, step: &EntityId, verdict: Verdict) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Qr),
            part: part.clone(),
            work_order: work_order.clone(),
            step: step.clone(),
            verdict,
            measurements: Vec::new(),
            inspector: None,
            notes: None,
            created: Utc::now(),
        }
    }

    /// Decision derived from the measurements (None when nothing was measured)
    pub fn measurement_decision(&self) -> Option<DecisionResult> {
        if self.measurements.is_empty() {
            return None;
        }
        if self.measurements.iter().all(Measurement::is_within_limits) {
            Some(DecisionResult::Pass)
        } else {
            Some(DecisionResult::Fail)
        }
    }
}

/// QA sign-off releasing a step of a work order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaSignoff {
    /// Unique identifier (QAS-xxx)
    pub id: EntityId,

    pub work_order: EntityId,

    pub step: EntityId,

    /// Person signing off
    pub approver: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Creation timestamp
    pub created: DateTime<Utc>,
}

impl QaSignoff {
    pub fn new(work_order: &EntityId, step: &EntityId, approver: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(EntityPrefix::Qas),
            work_order: work_order.clone(),
            step: step.clone(),
            approver: approver.into(),
            comment: None,
            created: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(verdict: Verdict) -> QualityReport {
        QualityReport::new(
            &EntityId::new(EntityPrefix::Part),
            &EntityId::new(EntityPrefix::Wo),
            &EntityId::new(EntityPrefix::Step),
            verdict,
        )
    }

    fn measurement(value: f64, min: Option<f64>, max: Option<f64>) -> Measurement {
        Measurement {
            name: "bore".to_string(),
            value,
            min,
            max,
            unit: Some("mm".to_string()),
        }
    }

    #[test]
    fn test_measurement_limits() {
        assert!(measurement(10.0, Some(9.9), Some(10.1)).is_within_limits());
        assert!(!measurement(10.2, Some(9.9), Some(10.1)).is_within_limits());
        assert!(measurement(10.2, Some(9.9), None).is_within_limits());
        assert!(measurement(-4.0, None, None).is_within_limits());
    }

    #[test]
    fn test_measurement_decision() {
        let mut qr = report(Verdict::Pass);
        assert_eq!(qr.measurement_decision(), None);

        qr.measurements.push(measurement(10.0, Some(9.9), Some(10.1)));
        assert_eq!(qr.measurement_decision(), Some(DecisionResult::Pass));

        qr.measurements.push(measurement(11.0, Some(9.9), Some(10.1)));
        assert_eq!(qr.measurement_decision(), Some(DecisionResult::Fail));
    }

    #[test]
    fn test_verdict_parsing() {
        assert_eq!("PASS".parse::<Verdict>().unwrap(), Verdict::Pass);
        assert_eq!("fail".parse::<DecisionResult>().unwrap(), DecisionResult::Fail);
        assert!("maybe".parse::<Verdict>().is_err());
    }
}
