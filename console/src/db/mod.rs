//! Persistent store for tasks, deployment state and the operations log

pub mod migrate;
pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::deploy::fsm::{DeploymentStatus, TaskStatus};
use crate::errors::ConsoleError;
use crate::models::deployment::{ComponentDeploymentState, OperationLogEntry};
use crate::models::task::{DeploymentTask, TaskFilter};

/// Durable store consumed by the task manager
///
/// Every call is a synchronous round-trip and is safe to use from many tasks
/// at once. Each call is atomic on its own; nothing spans calls.
pub trait Store: Send + Sync {
    /// Insert a new task row
    fn create_task(&self, task: &DeploymentTask) -> Result<(), ConsoleError>;

    /// Fetch a task, or `ConsoleError::NotFound`
    fn get_task(&self, id: &str) -> Result<DeploymentTask, ConsoleError>;

    /// List tasks newest first
    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<DeploymentTask>, ConsoleError>;

    /// Move a task to `status` if that is a legal transition from its current
    /// status. Returns whether the write applied.
    fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, ConsoleError>;

    /// Move a task to a terminal status with an optional error message.
    /// Returns whether the write applied; a task that is already terminal is
    /// left untouched.
    fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, ConsoleError>;

    /// Append a chunk to the task's accumulated output
    fn append_task_output(&self, id: &str, chunk: &str) -> Result<(), ConsoleError>;

    /// Upsert a component's deployment state
    fn set_deployment_state(
        &self,
        component: &str,
        status: DeploymentStatus,
        task_id: &str,
    ) -> Result<(), ConsoleError>;

    /// Fetch a component's deployment state, or `ConsoleError::NotFound`
    fn get_deployment_state(&self, component: &str)
        -> Result<ComponentDeploymentState, ConsoleError>;

    /// All deployment states ordered by component name
    fn list_deployment_states(&self) -> Result<Vec<ComponentDeploymentState>, ConsoleError>;

    /// Append an entry to the operations log, returning its row ID
    fn log_operation(&self, entry: &OperationLogEntry) -> Result<i64, ConsoleError>;

    /// Operations log newest first
    fn list_operations(&self, limit: Option<u32>) -> Result<Vec<OperationLogEntry>, ConsoleError>;
}
