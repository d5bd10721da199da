//! Component deployment state and operations log models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::ConsoleError;

/// Current provisioning status of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDeploymentState {
    /// Logical component name (e.g. "5gc", "srsran-gnb")
    pub component: String,

    pub status: DeploymentStatus,

    /// Task currently or most recently driving the component
    pub task_id: String,

    /// Set when the component last reached `Deployed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

/// Outcome recorded in the operations log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Failure,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "success",
            OperationStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(OperationStatus::Success),
            "failure" => Ok(OperationStatus::Failure),
            _ => Err(ConsoleError::InvalidValue(format!("operation status '{}'", s))),
        }
    }
}

/// Immutable audit record of a finished operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    /// Row ID, assigned by the store
    #[serde(default)]
    pub id: i64,

    pub operation: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    pub status: OperationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl OperationLogEntry {
    pub fn success(operation: impl Into<String>) -> Self {
        Self::new(operation.into(), OperationStatus::Success, None)
    }

    pub fn failure(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(operation.into(), OperationStatus::Failure, Some(error.into()))
    }

    fn new(operation: String, status: OperationStatus, error: Option<String>) -> Self {
        Self {
            id: 0,
            operation,
            component: None,
            task_id: None,
            status,
            error,
            created_at: Utc::now(),
        }
    }

    pub fn with_component(mut self, component: Option<String>) -> Self {
        self.component = component;
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}
