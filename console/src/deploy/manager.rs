//! Deployment task manager
//!
//! Turns a playbook sequence into a durably tracked background task and
//! reconciles the outcome into the owning component's deployment state.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Store;
use crate::deploy::catalog::{Catalog, PlaybookSequence};
use crate::deploy::executor::StepExecutor;
use crate::deploy::fsm::{DeploymentEvent, DeploymentStatus, Direction, TaskStatus};
use crate::deploy::output::TaskOutputWriter;
use crate::errors::ConsoleError;
use crate::models::deployment::OperationLogEntry;
use crate::models::task::DeploymentTask;
use crate::utils::generate_uuid;

/// Error stored on a task cancelled through [`TaskManager::cancel_task`]
pub const CANCELLED_MESSAGE: &str = "task cancelled by user";

type Registry = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Orchestrates sequence executions
///
/// Each started sequence runs on its own tokio task, strictly one step after
/// another. The only state shared with callers is the registry of
/// cancellation tokens for active tasks; everything else goes through the
/// store.
///
/// Store calls are synchronous. The final outcome is written from the
/// blocking pool; the short writes made while steps run (status, output
/// chunks) stay inline and are bounded by the SQLite busy timeout.
///
/// Two sequences started for the same component are not serialised. Each
/// writes the component's deployment state as it goes, so the last write
/// wins regardless of which sequence finished last.
pub struct TaskManager {
    store: Arc<dyn Store>,
    executor: Arc<dyn StepExecutor>,
    catalog: Arc<Catalog>,
    inventory: PathBuf,
    active: Registry,
}

impl TaskManager {
    /// Create a new task manager
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn StepExecutor>,
        catalog: Arc<Catalog>,
        inventory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            executor,
            catalog,
            inventory: inventory.into(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a catalog sequence by name, returning the new task ID
    ///
    /// An unknown name fails before anything is written.
    pub fn start_sequence(
        &self,
        sequence_name: &str,
        component: Option<&str>,
    ) -> Result<String, ConsoleError> {
        let sequence = self.catalog.get(sequence_name)?.clone();
        self.start(sequence, component)
    }

    /// Start a sequence in the background, returning the new task ID
    ///
    /// Returns as soon as the task row exists and the background task is
    /// spawned; no step has run yet. Must be called from within a tokio
    /// runtime.
    pub fn start(
        &self,
        sequence: PlaybookSequence,
        component: Option<&str>,
    ) -> Result<String, ConsoleError> {
        let runtime = Handle::try_current()
            .map_err(|e| ConsoleError::Internal(format!("no async runtime: {}", e)))?;

        let task_id = generate_uuid();
        let component = component
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let direction = sequence.direction();

        let task = DeploymentTask::new(task_id.clone(), sequence.name.clone(), component.clone());
        self.store.create_task(&task)?;

        if let Some(component) = &component {
            self.begin_component(component, direction, &task_id);
        }

        // A fresh token rather than one derived from the caller: provisioning
        // must outlive the request that triggered it.
        let cancel = CancellationToken::new();
        self.registry().insert(task_id.clone(), cancel.clone());

        info!(
            task_id = %task_id,
            operation = %sequence.name,
            component = component.as_deref().unwrap_or("-"),
            direction = ?direction,
            steps = sequence.steps.len(),
            "Starting sequence"
        );

        let execution = Execution {
            task_id: task_id.clone(),
            sequence,
            component,
            direction,
            cancel,
            store: self.store.clone(),
            executor: self.executor.clone(),
            inventory: self.inventory.clone(),
            active: self.active.clone(),
        };
        runtime.spawn(execution.run());

        Ok(task_id)
    }

    /// Cancel an active task
    ///
    /// Signals the step executor and records the task as cancelled without
    /// waiting for the executor to stop. Unknown and finished tasks fail with
    /// `ConsoleError::TaskNotActive`.
    pub fn cancel_task(&self, task_id: &str) -> Result<(), ConsoleError> {
        let cancel = self
            .registry()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ConsoleError::TaskNotActive(task_id.to_string()))?;

        cancel.cancel();

        let applied = self
            .store
            .complete_task(task_id, TaskStatus::Cancelled, Some(CANCELLED_MESSAGE))?;
        if !applied {
            // Still registered while the run writes its outcome
            debug!(task_id = %task_id, "Task finished before cancellation was recorded");
            return Err(ConsoleError::TaskNotActive(task_id.to_string()));
        }
        info!(task_id = %task_id, "Task cancelled");
        Ok(())
    }

    /// Fetch a task record
    pub fn get_task(&self, task_id: &str) -> Result<DeploymentTask, ConsoleError> {
        self.store.get_task(task_id)
    }

    /// Whether the task's background execution is still running
    pub fn is_active(&self, task_id: &str) -> bool {
        self.registry().contains_key(task_id)
    }

    /// IDs of all tasks with a running background execution
    pub fn active_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait for a task's background execution to finish, polling the
    /// registry, and return the final task record
    pub async fn wait(
        &self,
        task_id: &str,
        poll_interval: Duration,
    ) -> Result<DeploymentTask, ConsoleError> {
        while self.is_active(task_id) {
            tokio::time::sleep(poll_interval).await;
        }
        self.store.get_task(task_id)
    }

    /// Move a component into the interim status of a starting sequence
    fn begin_component(&self, component: &str, direction: Direction, task_id: &str) {
        let previous = match self.store.get_deployment_state(component) {
            Ok(state) => state.status,
            Err(e) if e.is_not_found() => DeploymentStatus::NotDeployed,
            Err(e) => {
                warn!(component = %component, "Failed to read deployment state: {}", e);
                DeploymentStatus::NotDeployed
            }
        };
        if previous.is_in_progress() {
            warn!(
                task_id = %task_id,
                component = %component,
                previous = %previous,
                "Component already has a sequence in progress, taking it over"
            );
        }

        let interim = match previous.apply(&DeploymentEvent::Begin(direction)) {
            Ok(status) => status,
            Err(e) => {
                error!(task_id = %task_id, component = %component, "{}", e);
                return;
            }
        };
        if let Err(e) = self.store.set_deployment_state(component, interim, task_id) {
            warn!(
                task_id = %task_id,
                component = %component,
                "Failed to set interim deployment state: {}",
                e
            );
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// How a sequence run ended
enum Outcome {
    Completed,
    Failed { step: String, error: ConsoleError },
    Cancelled,
}

/// Removes a task from the registry when dropped
struct Registration {
    active: Registry,
    task_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

/// Everything one background sequence run owns
struct Execution {
    task_id: String,
    sequence: PlaybookSequence,
    component: Option<String>,
    direction: Direction,
    cancel: CancellationToken,
    store: Arc<dyn Store>,
    executor: Arc<dyn StepExecutor>,
    inventory: PathBuf,
    active: Registry,
}

impl Execution {
    async fn run(self) {
        // Declared first so it drops last: leaving the registry is the final
        // action of every run.
        let _registration = Registration {
            active: self.active.clone(),
            task_id: self.task_id.clone(),
        };

        match self.store.update_task_status(&self.task_id, TaskStatus::Running) {
            Ok(true) => {}
            Ok(false) => debug!(task_id = %self.task_id, "Task left pending, already finished"),
            Err(e) => warn!(task_id = %self.task_id, "Failed to mark task running: {}", e),
        }

        let outcome = self.execute_steps().await;

        // Outcome writes block on SQLite, keep them off the async workers
        let task_id = self.task_id.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || self.finish(outcome)).await {
            error!(task_id = %task_id, "Failed to record task outcome: {}", e);
        }
    }

    async fn execute_steps(&self) -> Outcome {
        let total = self.sequence.steps.len();

        for (index, step) in self.sequence.steps.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            info!(
                task_id = %self.task_id,
                step = %step.name,
                "Running step {}/{}",
                index + 1,
                total
            );

            let mut output = TaskOutputWriter::new(self.store.clone(), self.task_id.as_str());
            let _ = writeln!(output, "==> {}", step.name);

            let result = self
                .executor
                .run(self.cancel.clone(), step, &self.inventory, &mut output)
                .await;
            let _ = output.flush();

            if let Err(error) = result {
                if self.cancel.is_cancelled() {
                    return Outcome::Cancelled;
                }
                return Outcome::Failed {
                    step: step.name.clone(),
                    error,
                };
            }
        }

        if self.cancel.is_cancelled() {
            Outcome::Cancelled
        } else {
            Outcome::Completed
        }
    }

    fn finish(&self, outcome: Outcome) {
        let operation = self.sequence.name.as_str();

        match outcome {
            Outcome::Completed => {
                self.complete(TaskStatus::Completed, None);
                self.reconcile(DeploymentEvent::Succeeded);
                self.record(OperationLogEntry::success(operation));
                info!(task_id = %self.task_id, operation, "Sequence completed");
            }
            Outcome::Failed { step, error } => {
                let message = format!("step '{}' failed: {}", step, error);
                error!(task_id = %self.task_id, operation, "{}", message);
                self.complete(TaskStatus::Failed, Some(&message));
                self.reconcile(DeploymentEvent::Failed);
                self.record(OperationLogEntry::failure(operation, message));
            }
            Outcome::Cancelled => {
                // No-op when cancel_task already recorded it
                self.complete(TaskStatus::Cancelled, Some(CANCELLED_MESSAGE));
                warn!(task_id = %self.task_id, operation, "Sequence cancelled");
                self.reconcile(DeploymentEvent::Failed);
                self.record(OperationLogEntry::failure(operation, "cancelled"));
            }
        }
    }

    fn complete(&self, status: TaskStatus, error: Option<&str>) {
        match self.store.complete_task(&self.task_id, status, error) {
            Ok(true) => {}
            Ok(false) => debug!(
                task_id = %self.task_id,
                status = %status,
                "Task already terminal, final status not written"
            ),
            Err(e) => error!(task_id = %self.task_id, "Failed to complete task: {}", e),
        }
    }

    fn reconcile(&self, event: DeploymentEvent) {
        let Some(component) = &self.component else {
            return;
        };

        let status = match self.direction.interim().apply(&event) {
            Ok(status) => status,
            Err(e) => {
                error!(task_id = %self.task_id, component = %component, "{}", e);
                return;
            }
        };

        if let Err(e) = self
            .store
            .set_deployment_state(component, status, &self.task_id)
        {
            warn!(
                task_id = %self.task_id,
                component = %component,
                "Failed to set deployment state to {}: {}",
                status,
                e
            );
        }
    }

    fn record(&self, entry: OperationLogEntry) {
        let entry = entry
            .with_component(self.component.clone())
            .with_task(self.task_id.as_str());
        if let Err(e) = self.store.log_operation(&entry) {
            warn!(task_id = %self.task_id, "Failed to log operation: {}", e);
        }
    }
}
