//! SQLite-backed store

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::migrate::{self, AppliedMigration, MigrationRunner};
use crate::db::migrations::MIGRATIONS;
use crate::db::Store;
use crate::deploy::fsm::{DeploymentStatus, TaskStatus};
use crate::errors::ConsoleError;
use crate::models::deployment::{ComponentDeploymentState, OperationLogEntry};
use crate::models::task::{DeploymentTask, TaskFilter};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str =
    "id, operation, component, status, output, error, created_at, updated_at";

/// Store backed by a single SQLite connection
///
/// File databases run in WAL mode so readers (e.g. an operator polling task
/// output) do not block the writer.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file and bring its schema up to date
    pub fn open(db_path: &Path) -> Result<Self, ConsoleError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %db_path.display(), journal_mode = %mode, "Opened database");

        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, ConsoleError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, ConsoleError> {
        conn.pragma_update(None, "foreign_keys", true)?;

        let runner = MigrationRunner::new(MIGRATIONS)?;
        let applied = runner.run(&mut conn)?;
        if applied > 0 {
            info!(
                applied,
                version = runner.latest_version(),
                "Database schema initialized"
            );
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Highest applied schema version
    pub fn schema_version(&self) -> Result<u32, ConsoleError> {
        migrate::current_version(&self.conn())
    }

    /// Rows of the migration ledger
    pub fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, ConsoleError> {
        migrate::applied_migrations(&self.conn())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn task_exists(conn: &Connection, id: &str) -> Result<bool, ConsoleError> {
        let found = conn
            .query_row(
                "SELECT 1 FROM deployment_tasks WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Guarded status write: only applies from a legal predecessor state
    fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, ConsoleError> {
        let predecessors: Vec<&'static str> =
            status.predecessors().iter().map(|s| s.as_str()).collect();
        if predecessors.is_empty() {
            return Err(ConsoleError::InvalidValue(format!(
                "no task may transition to {}",
                status
            )));
        }

        let placeholders = (0..predecessors.len())
            .map(|i| format!("?{}", i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE deployment_tasks
             SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
             WHERE id = ?4 AND status IN ({})",
            placeholders
        );

        let status_text = status.as_str();
        let now = now_text();
        let mut values: Vec<&dyn ToSql> = vec![&status_text, &error, &now, &id];
        for predecessor in &predecessors {
            values.push(predecessor);
        }

        let conn = self.conn();
        let changed = conn.execute(&sql, values.as_slice())?;
        if changed > 0 {
            return Ok(true);
        }

        if !Self::task_exists(&conn, id)? {
            return Err(ConsoleError::NotFound(format!("task {}", id)));
        }
        debug!(task_id = %id, status = %status, "Task status write skipped");
        Ok(false)
    }
}

impl Store for SqliteStore {
    fn create_task(&self, task: &DeploymentTask) -> Result<(), ConsoleError> {
        self.conn().execute(
            &format!(
                "INSERT INTO deployment_tasks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                TASK_COLUMNS
            ),
            params![
                task.id,
                task.operation,
                task.component,
                task.status.as_str(),
                task.output,
                task.error,
                time_text(&task.created_at),
                time_text(&task.updated_at),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<DeploymentTask, ConsoleError> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM deployment_tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                map_task,
            )
            .optional()?
            .ok_or_else(|| ConsoleError::NotFound(format!("task {}", id)))
    }

    fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<DeploymentTask>, ConsoleError> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            values.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", values.len()));
        }
        if let Some(component) = &filter.component {
            values.push(component.clone());
            clauses.push(format!("component = ?{}", values.len()));
        }

        let mut sql = format!("SELECT {} FROM deployment_tasks", TASK_COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), map_task)?;
        let tasks = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, ConsoleError> {
        self.transition(id, status, None)
    }

    fn complete_task(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool, ConsoleError> {
        if !status.is_terminal() {
            return Err(ConsoleError::InvalidValue(format!(
                "cannot complete task with non-terminal status {}",
                status
            )));
        }
        self.transition(id, status, error)
    }

    fn append_task_output(&self, id: &str, chunk: &str) -> Result<(), ConsoleError> {
        let changed = self.conn().execute(
            "UPDATE deployment_tasks SET output = output || ?1, updated_at = ?2 WHERE id = ?3",
            params![chunk, now_text(), id],
        )?;
        if changed == 0 {
            return Err(ConsoleError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn set_deployment_state(
        &self,
        component: &str,
        status: DeploymentStatus,
        task_id: &str,
    ) -> Result<(), ConsoleError> {
        // deployed_at is stamped on Deployed, cleared on NotDeployed and kept
        // otherwise
        let deployed_at = (status == DeploymentStatus::Deployed).then(now_text);
        self.conn().execute(
            "INSERT INTO deployment_states (component, status, task_id, deployed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(component) DO UPDATE SET
                status = excluded.status,
                task_id = excluded.task_id,
                deployed_at = CASE
                    WHEN excluded.status = 'deployed' THEN excluded.deployed_at
                    WHEN excluded.status = 'not_deployed' THEN NULL
                    ELSE deployment_states.deployed_at
                END",
            params![component, status.as_str(), task_id, deployed_at],
        )?;
        Ok(())
    }

    fn get_deployment_state(
        &self,
        component: &str,
    ) -> Result<ComponentDeploymentState, ConsoleError> {
        self.conn()
            .query_row(
                "SELECT component, status, task_id, deployed_at
                 FROM deployment_states WHERE component = ?1",
                params![component],
                map_deployment_state,
            )
            .optional()?
            .ok_or_else(|| ConsoleError::NotFound(format!("component {}", component)))
    }

    fn list_deployment_states(&self) -> Result<Vec<ComponentDeploymentState>, ConsoleError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT component, status, task_id, deployed_at
             FROM deployment_states ORDER BY component ASC",
        )?;
        let rows = stmt.query_map([], map_deployment_state)?;
        let states = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(states)
    }

    fn log_operation(&self, entry: &OperationLogEntry) -> Result<i64, ConsoleError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operations_log (operation, component, task_id, status, error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.operation,
                entry.component,
                entry.task_id,
                entry.status.as_str(),
                entry.error,
                time_text(&entry.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_operations(&self, limit: Option<u32>) -> Result<Vec<OperationLogEntry>, ConsoleError> {
        let mut sql = String::from(
            "SELECT id, operation, component, task_id, status, error, created_at
             FROM operations_log ORDER BY id DESC",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(OperationLogEntry {
                id: row.get(0)?,
                operation: row.get(1)?,
                component: row.get(2)?,
                task_id: row.get(3)?,
                status: parse_column(row, 4)?,
                error: row.get(5)?,
                created_at: parse_time(row, 6)?,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_task(row: &Row<'_>) -> rusqlite::Result<DeploymentTask> {
    Ok(DeploymentTask {
        id: row.get(0)?,
        operation: row.get(1)?,
        component: row.get(2)?,
        status: parse_column(row, 3)?,
        output: row.get(4)?,
        error: row.get(5)?,
        created_at: parse_time(row, 6)?,
        updated_at: parse_time(row, 7)?,
    })
}

fn map_deployment_state(row: &Row<'_>) -> rusqlite::Result<ComponentDeploymentState> {
    let deployed_at = match row.get::<_, Option<String>>(3)? {
        Some(text) => Some(parse_time_text(3, &text)?),
        None => None,
    };
    Ok(ComponentDeploymentState {
        component: row.get(0)?,
        status: parse_column(row, 1)?,
        task_id: row.get(2)?,
        deployed_at,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ConsoleError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_time_text(idx, &text)
}

fn parse_time_text(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_text(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_text() -> String {
    time_text(&Utc::now())
}
