//! Deployment task models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::TaskStatus;

/// Durable record of one sequence execution attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentTask {
    /// Unique task ID
    pub id: String,

    /// Name of the sequence being executed
    pub operation: String,

    /// Component the sequence drives, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,

    /// Current status
    pub status: TaskStatus,

    /// Accumulated step output
    pub output: String,

    /// Error message for failed or cancelled tasks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentTask {
    /// Create a new pending task
    pub fn new(id: String, operation: String, component: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            operation,
            component,
            status: TaskStatus::Pending,
            output: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Filter criteria for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub component: Option<String>,
    pub limit: Option<u32>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}
