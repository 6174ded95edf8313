use std::path::{Path, PathBuf};
use std::time::Duration;

use backup_audit_core::signature_hash_of_text;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

mod audit_schema;
mod error;
mod ledger;
mod migrations;

pub use audit_schema::{audit_schema_migrations, slot_columns, LEDGER_SCHEMA_VERSION};
pub use error::{AuditError, AuditResult};
pub use ledger::{AuditLedger, StepOutcome};
pub use migrations::{
    AppliedMigration, Migration, MigrationBody, MigrationHook, MigrationSet, MigrationStatus,
    PendingMigration, ShadowRebuild,
};

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  applied_at INTEGER NOT NULL
);
";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the audit store lives and how long a call may wait on another writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), busy_timeout: DEFAULT_BUSY_TIMEOUT }
    }

    #[must_use]
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_version: i64,
    pub lifecycle_violations: Vec<String>,
    pub signature_hash_mismatches: Vec<String>,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.lifecycle_violations.is_empty()
            && self.signature_hash_mismatches.is_empty()
    }
}

impl SqliteStore {
    /// Open the audit store at `path` with the default busy timeout.
    ///
    /// # Errors
    /// Returns [`AuditError::StoreUnavailable`] when the database cannot be opened
    /// or configured.
    pub fn open(path: &Path) -> AuditResult<Self> {
        Self::open_with(&StoreConfig::new(path))
    }

    /// Open a SQLite-backed audit store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`AuditError::StoreUnavailable`] when the database cannot be opened
    /// or pragmas cannot be applied.
    pub fn open_with(config: &StoreConfig) -> AuditResult<Self> {
        let unavailable = |err: rusqlite::Error| {
            AuditError::StoreUnavailable(format!("{}: {err}", config.path.display()))
        };

        let conn = Connection::open(&config.path).map_err(unavailable)?;
        conn.busy_timeout(config.busy_timeout).map_err(unavailable)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(unavailable)?;

        // Forces a read of the header so corrupt or foreign files fail here.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
            .map_err(unavailable)?;

        Ok(Self { conn, path: config.path.clone() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest applied migration version, 0 for a fresh store.
    ///
    /// # Errors
    /// Returns an error when the version marker cannot be created or read.
    pub fn schema_version(&self) -> AuditResult<i64> {
        ensure_schema_migrations(&self.conn)?;
        current_schema_version(&self.conn)
    }

    /// Run quick-check, foreign-key-check, and ledger invariant probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> AuditResult<IntegrityReport> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))?;

        let foreign_key_violations = foreign_key_violations(&self.conn)?;
        let schema_version = self.schema_version()?;

        let mut lifecycle_violations = Vec::new();
        for (table, id_column) in [("runs", "run_id"), ("steps", "id")] {
            if !table_exists(&self.conn, table)? {
                continue;
            }
            let query = format!(
                "SELECT CAST({id_column} AS TEXT), status FROM {table}
                 WHERE (status = 'running') != (finished_at IS NULL)
                 ORDER BY {id_column}"
            );
            let mut stmt = self.conn.prepare(&query)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (id, status) = row?;
                lifecycle_violations.push(format!("{table} {id} has status {status}"));
            }
        }

        let mut signature_hash_mismatches = Vec::new();
        let columns = table_columns(&self.conn, "runs")?;
        for slot in backup_audit_core::SignatureSlot::ALL {
            let (json_column, hash_column) = slot_columns(slot);
            if !columns.iter().any(|c| c == json_column) || !columns.iter().any(|c| c == hash_column)
            {
                continue;
            }
            let query = format!(
                "SELECT run_id, {json_column}, {hash_column} FROM runs
                 WHERE {json_column} IS NOT NULL OR {hash_column} IS NOT NULL
                 ORDER BY run_id"
            );
            let mut stmt = self.conn.prepare(&query)?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;
            for row in rows {
                let (run_id, json, hash) = row?;
                let consistent = match (json, hash) {
                    (Some(json), Some(hash)) => signature_hash_of_text(&json) == hash,
                    _ => false,
                };
                if !consistent {
                    signature_hash_mismatches.push(format!("run {run_id} slot {slot}"));
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_version,
            lifecycle_violations,
            signature_hash_mismatches,
        })
    }
}

fn ensure_schema_migrations(conn: &Connection) -> AuditResult<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> AuditResult<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn foreign_key_violations(conn: &Connection) -> AuditResult<Vec<ForeignKeyViolation>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
            parent: row.get(2)?,
            fk_index: row.get(3)?,
        })
    })?;

    let mut violations = Vec::new();
    for row in rows {
        violations.push(row?);
    }
    Ok(violations)
}

fn table_exists(conn: &Connection, table_name: &str) -> AuditResult<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table_name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> AuditResult<Vec<String>> {
    if !table_exists(conn, table)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}
