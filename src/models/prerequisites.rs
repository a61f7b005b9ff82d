//! Prerequisite declarations attached to a task.
//!
//! A declaration is keyed by gating point and maps another task's id to the
//! minimum state that task must have reached before the gate opens.

use crate::constants::requirements;
use crate::error::{Result, TaskerError};
use crate::models::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Moment in the lifecycle where prerequisites are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatingPoint {
    #[serde(rename = "for_setup")]
    BeforeSetup,
    #[serde(rename = "for_post_processing")]
    BeforePostProcessing,
}

impl fmt::Display for GatingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeSetup => write!(f, "Setup"),
            Self::BeforePostProcessing => write!(f, "PostProcessing"),
        }
    }
}

/// Minimum state required of another task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Requirement {
    /// Reached `Queued` or anything beyond, up to completion
    #[serde(rename = "Queued")]
    Queued,
    /// Reached `Data Ready` or anything beyond, up to completion
    #[serde(rename = "Data Ready")]
    DataReady,
    #[serde(rename = "Completed")]
    Completed,
    /// Reached any failure sub-kind
    #[serde(rename = "Failed")]
    Failed,
    #[serde(rename = "Standby")]
    Standby,
    #[serde(rename = "Configured")]
    Configured,
}

impl Requirement {
    pub const ALL: [Requirement; 6] = [
        Self::Queued,
        Self::DataReady,
        Self::Completed,
        Self::Failed,
        Self::Standby,
        Self::Configured,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => requirements::QUEUED,
            Self::DataReady => requirements::DATA_READY,
            Self::Completed => requirements::COMPLETED,
            Self::Failed => requirements::FAILED,
            Self::Standby => requirements::STANDBY,
            Self::Configured => requirements::CONFIGURED,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Requirement {
    type Err = TaskerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| {
                TaskerError::ValidationError(format!("Prerequisite requirement '{s}' is not allowed"))
            })
    }
}

/// Dependency declarations of one task, per gating point
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prerequisites {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub for_setup: BTreeMap<TaskId, Requirement>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub for_post_processing: BTreeMap<TaskId, Requirement>,
}

impl Prerequisites {
    pub fn for_gate(&self, gate: GatingPoint) -> &BTreeMap<TaskId, Requirement> {
        match gate {
            GatingPoint::BeforeSetup => &self.for_setup,
            GatingPoint::BeforePostProcessing => &self.for_post_processing,
        }
    }

    fn for_gate_mut(&mut self, gate: GatingPoint) -> &mut BTreeMap<TaskId, Requirement> {
        match gate {
            GatingPoint::BeforeSetup => &mut self.for_setup,
            GatingPoint::BeforePostProcessing => &mut self.for_post_processing,
        }
    }

    /// Record that `owner` needs `other` to reach `required` at `gate`.
    /// A later declaration for the same other task replaces the earlier one.
    pub fn add(
        &mut self,
        owner: TaskId,
        gate: GatingPoint,
        other: TaskId,
        required: Requirement,
    ) -> Result<()> {
        if owner == other {
            return Err(TaskerError::ValidationError(format!(
                "Task {owner} cannot declare a prerequisite on itself"
            )));
        }
        self.for_gate_mut(gate).insert(other, required);
        Ok(())
    }

    pub fn remove(&mut self, gate: GatingPoint, other: TaskId) -> Option<Requirement> {
        self.for_gate_mut(gate).remove(&other)
    }

    pub fn is_empty(&self) -> bool {
        self.for_setup.is_empty() && self.for_post_processing.is_empty()
    }

    /// Whether any gate references `other`
    pub fn references(&self, other: TaskId) -> bool {
        self.for_setup.contains_key(&other) || self.for_post_processing.contains_key(&other)
    }
}
