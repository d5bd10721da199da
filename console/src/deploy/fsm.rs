//! Task and deployment status state machines
//!
//! A task moves `Pending -> Running -> {Completed, Failed, Cancelled}`; a
//! component's deployment status moves `NotDeployed -> Deploying -> {Deployed,
//! Failed}` or `Deployed -> Undeploying -> {NotDeployed, Failed}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConsoleError;

/// Lifecycle status of a deployment task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, background execution not yet started
    Pending,

    /// Steps are executing
    Running,

    /// Every step succeeded
    Completed,

    /// A step failed
    Failed,

    /// Cancelled by an operator
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::Running) => true,
            // Cancellation may land before the background task starts, and a
            // task whose Running write failed may still be failed.
            (TaskStatus::Pending, TaskStatus::Failed | TaskStatus::Cancelled) => true,
            (TaskStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// All states from which `self` may be entered
    pub fn predecessors(&self) -> Vec<TaskStatus> {
        TaskStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(*self))
            .collect()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ConsoleError::InvalidValue(format!("task status '{}'", s)))
    }
}

/// Provisioning status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    NotDeployed,
    Deploying,
    Deployed,
    Undeploying,
    Failed,
}

impl DeploymentStatus {
    pub const ALL: [DeploymentStatus; 5] = [
        DeploymentStatus::NotDeployed,
        DeploymentStatus::Deploying,
        DeploymentStatus::Deployed,
        DeploymentStatus::Undeploying,
        DeploymentStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::NotDeployed => "not_deployed",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Undeploying => "undeploying",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// A sequence is currently driving the component
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Deploying | DeploymentStatus::Undeploying
        )
    }

    /// Process an event and return the resulting status
    pub fn apply(&self, event: &DeploymentEvent) -> Result<DeploymentStatus, ConsoleError> {
        let next = match (self, event) {
            // Starting a sequence always takes over the component; an earlier
            // in-flight sequence is not waited for.
            (_, DeploymentEvent::Begin(direction)) => direction.interim(),

            (DeploymentStatus::Deploying, DeploymentEvent::Succeeded) => {
                Direction::Deploy.settled()
            }
            (DeploymentStatus::Undeploying, DeploymentEvent::Succeeded) => {
                Direction::Undeploy.settled()
            }
            (DeploymentStatus::Deploying | DeploymentStatus::Undeploying, DeploymentEvent::Failed) => {
                DeploymentStatus::Failed
            }

            (state, event) => {
                return Err(ConsoleError::InvalidValue(format!(
                    "invalid deployment transition: {:?} -> {:?}",
                    state, event
                )));
            }
        };
        Ok(next)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = ConsoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ConsoleError::InvalidValue(format!("deployment status '{}'", s)))
    }
}

/// Deployment event driving a component's status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentEvent {
    /// A sequence started in the given direction
    Begin(Direction),

    /// Every step of the sequence succeeded
    Succeeded,

    /// A step failed or the sequence was cancelled
    Failed,
}

/// Whether a sequence installs or removes a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Deploy,
    Undeploy,
}

impl Direction {
    /// Tags that mark a step as removing or stopping something
    pub const UNDEPLOY_TAGS: [&'static str; 2] = ["uninstall", "stop"];

    /// Classify a set of step tags
    pub fn from_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let undeploy = tags
            .into_iter()
            .any(|tag| Self::UNDEPLOY_TAGS.contains(&tag));
        if undeploy {
            Direction::Undeploy
        } else {
            Direction::Deploy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deploy => "deploy",
            Direction::Undeploy => "undeploy",
        }
    }

    /// Status held while the sequence runs
    pub fn interim(&self) -> DeploymentStatus {
        match self {
            Direction::Deploy => DeploymentStatus::Deploying,
            Direction::Undeploy => DeploymentStatus::Undeploying,
        }
    }

    /// Status reached when every step succeeds
    pub fn settled(&self) -> DeploymentStatus {
        match self {
            Direction::Deploy => DeploymentStatus::Deployed,
            Direction::Undeploy => DeploymentStatus::NotDeployed,
        }
    }
}
