//! Schema migration runner
//!
//! Migrations form an ordered, append-only list. Each one is applied exactly
//! once, inside its own transaction, together with its ledger row in
//! `schema_migrations`. A failing migration rolls back entirely and stops the
//! run; the next run resumes from the last applied version.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::ConsoleError;

/// Applies one schema change inside the given transaction
pub type ApplyFn = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// A versioned, one-time schema change
#[derive(Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub apply: ApplyFn,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// A row of the migration ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
}

/// Applies pending migrations against a SQLite connection
#[derive(Debug, Clone, Copy)]
pub struct MigrationRunner<'a> {
    migrations: &'a [Migration],
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner, rejecting lists that are not strictly ascending
    pub fn new(migrations: &'a [Migration]) -> Result<Self, ConsoleError> {
        let mut previous = 0;
        for migration in migrations {
            if migration.version <= previous {
                return Err(ConsoleError::ConfigError(format!(
                    "migration {} ({}) is not ordered after version {}",
                    migration.version, migration.description, previous
                )));
            }
            previous = migration.version;
        }
        Ok(Self { migrations })
    }

    /// Highest version this runner knows about
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }

    /// Apply every migration newer than the ledger, returning how many ran
    pub fn run(&self, conn: &mut Connection) -> Result<usize, ConsoleError> {
        ensure_ledger(conn)?;

        let applied = applied_migrations(conn)?;
        self.check_ledger(&applied)?;
        let current = applied.last().map(|m| m.version).unwrap_or(0);

        let mut count = 0;
        for migration in self.migrations.iter().filter(|m| m.version > current) {
            self.apply(conn, migration)?;
            count += 1;
        }

        if count == 0 {
            debug!(version = current, "Schema is up to date");
        } else {
            info!(
                from = current,
                to = self.latest_version(),
                applied = count,
                "Schema migrated"
            );
        }
        Ok(count)
    }

    fn apply(&self, conn: &mut Connection, migration: &Migration) -> Result<(), ConsoleError> {
        info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );

        let to_migration_error = |source: rusqlite::Error| ConsoleError::MigrationError {
            version: migration.version,
            description: migration.description.to_string(),
            source,
        };

        // Dropping the transaction without commit rolls it back
        let tx = conn.transaction()?;
        (migration.apply)(&tx).map_err(to_migration_error)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.description,
                Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
            ],
        )
        .map_err(to_migration_error)?;
        tx.commit().map_err(to_migration_error)?;
        Ok(())
    }

    /// The ledger must be a prefix of the migration list
    fn check_ledger(&self, applied: &[AppliedMigration]) -> Result<(), ConsoleError> {
        let latest = self.latest_version();
        for (index, row) in applied.iter().enumerate() {
            if row.version > latest {
                return Err(ConsoleError::UnsupportedSchemaVersion {
                    supported: latest,
                    found: row.version,
                });
            }
            match self.migrations.get(index) {
                Some(migration) if migration.version == row.version => {}
                _ => {
                    return Err(ConsoleError::ConfigError(format!(
                        "schema ledger diverges from known migrations at version {}",
                        row.version
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Create the ledger table if it does not exist yet
pub fn ensure_ledger(conn: &Connection) -> Result<(), ConsoleError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Highest applied version, or 0 for a fresh database
pub fn current_version(conn: &Connection) -> Result<u32, ConsoleError> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Ledger rows in ascending version order
pub fn applied_migrations(conn: &Connection) -> Result<Vec<AppliedMigration>, ConsoleError> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT version, description, applied_at FROM schema_migrations ORDER BY version ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    let mut applied = Vec::new();
    for row in rows {
        let (version, description, applied_at) = row?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| ConsoleError::InvalidValue(format!("applied_at '{}': {}", applied_at, e)))?
            .with_timezone(&Utc);
        applied.push(AppliedMigration {
            version,
            description,
            applied_at,
        });
    }
    Ok(applied)
}

/// Whether `table` already has a column named `column`
///
/// Lets migrations add columns idempotently on databases that were patched
/// by hand.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        params![table, column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Whether a table with the given name exists
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
