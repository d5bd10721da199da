//! Task manager tests, driven by a scripted step executor

use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use provconsole::db::{SqliteStore, Store};
use provconsole::deploy::catalog::{Catalog, PlaybookSequence, PlaybookStep};
use provconsole::deploy::executor::StepExecutor;
use provconsole::deploy::fsm::{DeploymentStatus, TaskStatus};
use provconsole::deploy::manager::{TaskManager, CANCELLED_MESSAGE};
use provconsole::errors::ConsoleError;
use provconsole::models::deployment::{
    ComponentDeploymentState, OperationLogEntry, OperationStatus,
};
use provconsole::models::task::{DeploymentTask, TaskFilter};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(5);
const TIMEOUT: Duration = Duration::from_secs(5);

/// Records every step it is asked to run
#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
    block_on: Option<String>,
}

impl ScriptedExecutor {
    fn failing_on(step: &str) -> Self {
        Self {
            fail_on: Some(step.to_string()),
            ..Default::default()
        }
    }

    fn blocking_on(step: &str) -> Self {
        Self {
            block_on: Some(step.to_string()),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn run(
        &self,
        cancel: CancellationToken,
        step: &PlaybookStep,
        inventory: &Path,
        output: &mut (dyn Write + Send),
    ) -> Result<(), ConsoleError> {
        self.calls.lock().unwrap().push(step.name.clone());
        writeln!(output, "ran {} against {}", step.name, inventory.display())?;

        if self.block_on.as_deref() == Some(step.name.as_str()) {
            cancel.cancelled().await;
            return Err(ConsoleError::StepError("cancelled".to_string()));
        }
        if self.fail_on.as_deref() == Some(step.name.as_str()) {
            return Err(ConsoleError::StepError("exit status: 2".to_string()));
        }
        Ok(())
    }
}

/// SQLite store with injectable faults
struct FaultyStore {
    inner: SqliteStore,
    // Held closed, log_operation parks until it opens
    gate: Option<Arc<(Mutex<bool>, Condvar)>>,
    fail_next_cancel: AtomicBool,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            gate: None,
            fail_next_cancel: AtomicBool::new(false),
        }
    }

    fn gated() -> Self {
        Self {
            gate: Some(Arc::new((Mutex::new(false), Condvar::new()))),
            ..Self::new()
        }
    }

    fn failing_first_cancel() -> Self {
        let store = Self::new();
        store.fail_next_cancel.store(true, Ordering::SeqCst);
        store
    }

    fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            let (open, cvar) = &**gate;
            *open.lock().unwrap() = true;
            cvar.notify_all();
        }
    }
}

impl Store for FaultyStore {
    fn create_task(&self, task: &DeploymentTask) -> Result<(), ConsoleError> {
        self.inner.create_task(task)
    }

    fn get_task(&self, id: &str) -> Result<DeploymentTask, ConsoleError> {
        self.inner.get_task(id)
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<DeploymentTask>, ConsoleError> {
        self.inner.list_tasks(filter)
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, ConsoleError> {
        self.inner.update_task_status(id, status)
    }

    fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, ConsoleError> {
        if status == TaskStatus::Cancelled && self.fail_next_cancel.swap(false, Ordering::SeqCst) {
            return Err(ConsoleError::Internal("database is locked".to_string()));
        }
        self.inner.complete_task(id, status, error)
    }

    fn append_task_output(&self, id: &str, chunk: &str) -> Result<(), ConsoleError> {
        self.inner.append_task_output(id, chunk)
    }

    fn set_deployment_state(
        &self,
        component: &str,
        status: DeploymentStatus,
        task_id: &str,
    ) -> Result<(), ConsoleError> {
        self.inner.set_deployment_state(component, status, task_id)
    }

    fn get_deployment_state(
        &self,
        component: &str,
    ) -> Result<ComponentDeploymentState, ConsoleError> {
        self.inner.get_deployment_state(component)
    }

    fn list_deployment_states(&self) -> Result<Vec<ComponentDeploymentState>, ConsoleError> {
        self.inner.list_deployment_states()
    }

    fn log_operation(&self, entry: &OperationLogEntry) -> Result<i64, ConsoleError> {
        if let Some(gate) = &self.gate {
            let (open, cvar) = &**gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
        }
        self.inner.log_operation(entry)
    }

    fn list_operations(&self, limit: Option<u32>) -> Result<Vec<OperationLogEntry>, ConsoleError> {
        self.inner.list_operations(limit)
    }
}

struct Harness<S: Store = SqliteStore> {
    manager: TaskManager,
    store: Arc<S>,
    executor: Arc<ScriptedExecutor>,
}

impl Harness {
    fn new(executor: ScriptedExecutor) -> Self {
        Harness::with_store(executor, SqliteStore::open_in_memory().unwrap())
    }
}

impl<S: Store + 'static> Harness<S> {
    fn with_store(executor: ScriptedExecutor, store: S) -> Self {
        let store = Arc::new(store);
        let executor = Arc::new(executor);
        let manager = TaskManager::new(
            store.clone(),
            executor.clone(),
            Arc::new(Catalog::builtin()),
            "/etc/provconsole/inventory/hosts.ini",
        );
        Self {
            manager,
            store,
            executor,
        }
    }

    async fn wait(&self, task_id: &str) -> DeploymentTask {
        tokio::time::timeout(TIMEOUT, self.manager.wait(task_id, POLL))
            .await
            .expect("task did not finish in time")
            .unwrap()
    }
}

#[tokio::test]
async fn test_sequence_success() {
    let harness = Harness::new(ScriptedExecutor::default());

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    let task = harness.wait(&task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error.is_none());
    assert!(task.output.contains("==> router"));
    assert!(task.output.contains("ran core against /etc/provconsole/inventory/hosts.ini"));
    assert_eq!(harness.executor.calls(), vec!["router", "core"]);

    let state = harness.store.get_deployment_state("5gc").unwrap();
    assert_eq!(state.status, DeploymentStatus::Deployed);
    assert_eq!(state.task_id, task_id);
    assert!(state.deployed_at.is_some());

    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].operation, "5gc-install");
    assert_eq!(log[0].status, OperationStatus::Success);
    assert_eq!(log[0].component.as_deref(), Some("5gc"));
    assert_eq!(log[0].task_id.as_deref(), Some(task_id.as_str()));
    assert!(!harness.manager.is_active(&task_id));
}

#[tokio::test]
async fn test_task_visible_before_any_step() {
    let harness = Harness::new(ScriptedExecutor::default());

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();

    // Nothing has yielded to the background task yet
    let task = harness.manager.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.operation, "5gc-install");
    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Deploying
    );
    assert!(harness.executor.calls().is_empty());

    harness.wait(&task_id).await;
}

#[tokio::test]
async fn test_step_failure_stops_sequence() {
    let harness = Harness::new(ScriptedExecutor::failing_on("router"));

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    let task = harness.wait(&task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(harness.executor.calls(), vec!["router"]);
}

#[tokio::test]
async fn test_last_step_failure() {
    let harness = Harness::new(ScriptedExecutor::failing_on("core"));

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    let task = harness.wait(&task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(error.contains("core"), "error was {:?}", error);
    assert_eq!(harness.executor.calls(), vec!["router", "core"]);

    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Failed
    );

    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, OperationStatus::Failure);
    assert!(log[0].error.as_deref().unwrap().contains("core"));
}

#[tokio::test]
async fn test_cancel_running_task() {
    let harness = Harness::new(ScriptedExecutor::blocking_on("router"));

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.manager.is_active(&task_id));
    assert_eq!(harness.manager.active_tasks(), vec![task_id.clone()]);
    assert_eq!(
        harness.manager.get_task(&task_id).unwrap().status,
        TaskStatus::Running
    );

    harness.manager.cancel_task(&task_id).unwrap();

    // Recorded before the background run has wound down
    let task = harness.manager.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.error.as_deref(), Some(CANCELLED_MESSAGE));

    let task = harness.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(harness.executor.calls(), vec!["router"]);
    assert!(harness.manager.active_tasks().is_empty());

    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Failed
    );
    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, OperationStatus::Failure);
    assert_eq!(log[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let harness = Harness::new(ScriptedExecutor::default());

    let task_id = harness
        .manager
        .start_sequence("k8s-install", Some("kubernetes"))
        .unwrap();
    harness.manager.cancel_task(&task_id).unwrap();

    let task = harness.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(harness.executor.calls().is_empty());
    assert_eq!(
        harness.store.get_deployment_state("kubernetes").unwrap().status,
        DeploymentStatus::Failed
    );
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let harness = Harness::new(ScriptedExecutor::default());

    let result = harness.manager.cancel_task("no-such-task");
    assert!(matches!(result, Err(ConsoleError::TaskNotActive(_))));
    assert!(harness.store.list_tasks(&TaskFilter::new()).unwrap().is_empty());
    assert!(harness.store.list_operations(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_finished_task() {
    let harness = Harness::new(ScriptedExecutor::default());

    let task_id = harness
        .manager
        .start_sequence("ru-sim-deploy", Some("ru-simulator"))
        .unwrap();
    harness.wait(&task_id).await;

    let result = harness.manager.cancel_task(&task_id);
    assert!(matches!(result, Err(ConsoleError::TaskNotActive(_))));

    let task = harness.manager.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error.is_none());
    assert_eq!(harness.store.list_operations(None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_uninstall_sequence() {
    let harness = Harness::new(ScriptedExecutor::default());
    harness
        .store
        .set_deployment_state("5gc", DeploymentStatus::Deployed, "earlier-task")
        .unwrap();

    let task_id = harness
        .manager
        .start_sequence("5gc-uninstall", Some("5gc"))
        .unwrap();
    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Undeploying
    );

    let task = harness.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(harness.executor.calls(), vec!["core", "router"]);

    let state = harness.store.get_deployment_state("5gc").unwrap();
    assert_eq!(state.status, DeploymentStatus::NotDeployed);
    assert_eq!(state.task_id, task_id);
    assert!(state.deployed_at.is_none());
}

#[tokio::test]
async fn test_sequence_without_component() {
    let harness = Harness::new(ScriptedExecutor::default());
    let sequence = PlaybookSequence::new(
        "smoke-test",
        vec![PlaybookStep::new("ping", "common/ping.yml", &["check"])],
    );

    let task_id = harness.manager.start(sequence, None).unwrap();
    let task = harness.wait(&task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.component.is_none());
    assert!(harness.store.list_deployment_states().unwrap().is_empty());

    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].component.is_none());
}

#[tokio::test]
async fn test_unknown_sequence_writes_nothing() {
    let harness = Harness::new(ScriptedExecutor::default());

    let result = harness.manager.start_sequence("6g-install", Some("6gc"));
    assert!(matches!(result, Err(ConsoleError::UnknownSequence(_))));

    assert!(harness.store.list_tasks(&TaskFilter::new()).unwrap().is_empty());
    assert!(harness.store.list_deployment_states().unwrap().is_empty());
    assert!(harness.manager.active_tasks().is_empty());
}

#[tokio::test]
async fn test_sequences_run_independently() {
    let harness = Harness::new(ScriptedExecutor::default());

    let gnb = harness
        .manager
        .start_sequence("gnb-deploy", Some("srsran-gnb"))
        .unwrap();
    let ru = harness
        .manager
        .start_sequence("ru-sim-deploy", Some("ru-simulator"))
        .unwrap();
    assert_ne!(gnb, ru);

    assert_eq!(harness.wait(&gnb).await.status, TaskStatus::Completed);
    assert_eq!(harness.wait(&ru).await.status, TaskStatus::Completed);

    let states = harness.store.list_deployment_states().unwrap();
    assert_eq!(states.len(), 2);
    assert!(states
        .iter()
        .all(|state| state.status == DeploymentStatus::Deployed));
    assert_eq!(harness.store.list_tasks(&TaskFilter::new()).unwrap().len(), 2);
}

#[test]
fn test_start_requires_runtime() {
    let harness = Harness::new(ScriptedExecutor::default());

    let result = harness.manager.start_sequence("k8s-install", None);
    assert!(matches!(result, Err(ConsoleError::Internal(_))));
    assert!(harness.store.list_tasks(&TaskFilter::new()).unwrap().is_empty());
}

// Single-threaded runtime: the parked log write must not hold the only worker
#[tokio::test]
async fn test_cancel_while_outcome_is_recorded() {
    let harness = Harness::with_store(ScriptedExecutor::default(), FaultyStore::gated());

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();

    // Completed but still registered while the operations log write hangs
    tokio::time::timeout(TIMEOUT, async {
        while harness.store.get_task(&task_id).unwrap().status != TaskStatus::Completed {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
    .expect("task did not complete in time");
    assert!(harness.manager.is_active(&task_id));

    let result = harness.manager.cancel_task(&task_id);
    assert!(matches!(result, Err(ConsoleError::TaskNotActive(_))));

    harness.store.open_gate();
    let task = harness.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error.is_none());
    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Deployed
    );

    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, OperationStatus::Success);
}

#[tokio::test]
async fn test_cancelled_run_records_status_when_cancel_write_fails() {
    let harness = Harness::with_store(
        ScriptedExecutor::blocking_on("router"),
        FaultyStore::failing_first_cancel(),
    );

    let task_id = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = harness.manager.cancel_task(&task_id);
    assert!(matches!(result, Err(ConsoleError::Internal(_))));

    // The background run still writes the cancellation itself
    let task = harness.wait(&task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert!(!harness.manager.is_active(&task_id));

    assert_eq!(
        harness.store.get_deployment_state("5gc").unwrap().status,
        DeploymentStatus::Failed
    );
    let log = harness.store.list_operations(None).unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, OperationStatus::Failure);
    assert_eq!(log[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_new_sequence_takes_over_component_in_progress() {
    let harness = Harness::new(ScriptedExecutor::blocking_on("router"));

    let install = harness
        .manager
        .start_sequence("5gc-install", Some("5gc"))
        .unwrap();
    let state = harness.store.get_deployment_state("5gc").unwrap();
    assert_eq!(state.status, DeploymentStatus::Deploying);
    assert_eq!(state.task_id, install);

    let uninstall = harness
        .manager
        .start_sequence("5gc-uninstall", Some("5gc"))
        .unwrap();
    let state = harness.store.get_deployment_state("5gc").unwrap();
    assert_eq!(state.status, DeploymentStatus::Undeploying);
    assert_eq!(state.task_id, uninstall);

    harness.manager.cancel_task(&install).unwrap();
    harness.manager.cancel_task(&uninstall).unwrap();
    assert_eq!(harness.wait(&install).await.status, TaskStatus::Cancelled);
    assert_eq!(harness.wait(&uninstall).await.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_failed_component_can_be_redeployed() {
    let harness = Harness::new(ScriptedExecutor::default());
    harness
        .store
        .set_deployment_state("srsran-gnb", DeploymentStatus::Failed, "earlier-task")
        .unwrap();

    let task_id = harness
        .manager
        .start_sequence("gnb-deploy", Some("srsran-gnb"))
        .unwrap();
    assert_eq!(
        harness.store.get_deployment_state("srsran-gnb").unwrap().status,
        DeploymentStatus::Deploying
    );

    harness.wait(&task_id).await;
    assert_eq!(
        harness.store.get_deployment_state("srsran-gnb").unwrap().status,
        DeploymentStatus::Deployed
    );
}
