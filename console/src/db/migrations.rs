//! Shipped schema migrations
//!
//! Append only. Released entries are never edited, reordered or removed.

use rusqlite::Transaction;

use crate::db::migrate::{column_exists, Migration};

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create deployment tasks table",
        apply: create_tasks,
    },
    Migration {
        version: 2,
        description: "create deployment states table",
        apply: create_deployment_states,
    },
    Migration {
        version: 3,
        description: "create operations log table",
        apply: create_operations_log,
    },
    Migration {
        version: 4,
        description: "track component on tasks and operations log",
        apply: add_component_columns,
    },
    Migration {
        version: 5,
        description: "index tasks and operations log",
        apply: add_indexes,
    },
];

fn create_tasks(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE deployment_tasks (
            id TEXT PRIMARY KEY,
            operation TEXT NOT NULL,
            status TEXT NOT NULL,
            output TEXT NOT NULL DEFAULT '',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )
}

fn create_deployment_states(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE deployment_states (
            component TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            task_id TEXT NOT NULL,
            deployed_at TEXT
        );
        ",
    )
}

fn create_operations_log(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE operations_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation TEXT NOT NULL,
            status TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL
        );
        ",
    )
}

fn add_component_columns(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !column_exists(tx, "deployment_tasks", "component")? {
        tx.execute_batch("ALTER TABLE deployment_tasks ADD COLUMN component TEXT;")?;
    }
    if !column_exists(tx, "operations_log", "component")? {
        tx.execute_batch("ALTER TABLE operations_log ADD COLUMN component TEXT;")?;
    }
    if !column_exists(tx, "operations_log", "task_id")? {
        tx.execute_batch("ALTER TABLE operations_log ADD COLUMN task_id TEXT;")?;
    }
    Ok(())
}

fn add_indexes(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_deployment_tasks_status ON deployment_tasks(status);
        CREATE INDEX IF NOT EXISTS idx_deployment_tasks_created_at ON deployment_tasks(created_at);
        CREATE INDEX IF NOT EXISTS idx_deployment_tasks_component ON deployment_tasks(component);
        CREATE INDEX IF NOT EXISTS idx_operations_log_created_at ON operations_log(created_at);
        ",
    )
}
