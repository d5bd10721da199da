//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::db::{SqliteStore, Store};
use crate::deploy::catalog::Catalog;
use crate::deploy::executor::{AnsibleExecutor, StepExecutor};
use crate::deploy::manager::TaskManager;
use crate::errors::ConsoleError;

/// Main application state
pub struct AppState {
    /// SQLite store, migrated to the latest schema
    pub db: Arc<SqliteStore>,

    /// Playbook sequence catalog
    pub catalog: Arc<Catalog>,

    /// Background task orchestration
    pub manager: Arc<TaskManager>,
}

impl AppState {
    /// Initialize application state
    ///
    /// Opening the database applies any pending migrations.
    pub fn init(options: &AppOptions) -> Result<Self, ConsoleError> {
        info!(
            database = %options.storage.database_path.display(),
            "Initializing application state..."
        );

        let db = Arc::new(SqliteStore::open(&options.storage.database_path)?);
        let store: Arc<dyn Store> = db.clone();

        let executor: Arc<dyn StepExecutor> = Arc::new(AnsibleExecutor::new(
            &options.executor.ansible_binary,
            &options.executor.playbooks_dir,
        ));

        let catalog = Arc::new(Catalog::builtin());
        let manager = Arc::new(TaskManager::new(
            store,
            executor,
            catalog.clone(),
            &options.executor.inventory_path,
        ));

        Ok(Self {
            db,
            catalog,
            manager,
        })
    }
}
