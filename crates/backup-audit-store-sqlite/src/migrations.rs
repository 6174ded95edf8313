use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use backup_audit_core::unix_now;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    current_schema_version, ensure_schema_migrations, foreign_key_violations, AuditError,
    AuditResult, SqliteStore,
};

/// Native step of a migration, run inside the migration's transaction after its SQL.
pub type MigrationHook = fn(&Connection) -> AuditResult<()>;

#[derive(Clone)]
pub struct MigrationBody {
    pub sql: String,
    pub hook: Option<MigrationHook>,
}

impl MigrationBody {
    #[must_use]
    pub fn sql(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), hook: None }
    }

    #[must_use]
    pub fn hook(hook: MigrationHook) -> Self {
        Self { sql: String::new(), hook: Some(hook) }
    }

    #[must_use]
    pub fn with_hook(mut self, hook: MigrationHook) -> Self {
        self.hook = Some(hook);
        self
    }

    fn run(&self, conn: &Connection) -> AuditResult<()> {
        if !self.sql.trim().is_empty() {
            conn.execute_batch(&self.sql)?;
        }
        if let Some(hook) = self.hook {
            hook(conn)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MigrationBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationBody")
            .field("sql", &self.sql)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub up: MigrationBody,
    pub down: Option<MigrationBody>,
}

/// An ordered set of migrations with unique, positive versions.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    pub(crate) migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Build a set from migrations in any order.
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidMigrationSet`] on duplicate or non-positive versions.
    pub fn new(mut migrations: Vec<Migration>) -> AuditResult<Self> {
        migrations.sort_by_key(|migration| migration.version);

        let mut seen = BTreeSet::new();
        for migration in &migrations {
            if migration.version <= 0 {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "migration {} has version {}; versions start at 1",
                    migration.name, migration.version
                )));
            }
            if !seen.insert(migration.version) {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "duplicate migration version {:04}",
                    migration.version
                )));
            }
        }

        Ok(Self { migrations })
    }

    /// Discover `NNNN_name.sql`, `NNNN_name.up.sql` and `NNNN_name.down.sql` scripts.
    ///
    /// # Errors
    /// Returns an error when the directory cannot be read or the scripts do not
    /// form a valid set.
    pub fn from_dir(dir: &Path) -> AuditResult<Self> {
        let io_error = |source| AuditError::Io { path: dir.to_path_buf(), source };

        let mut entries = fs::read_dir(dir)
            .map_err(io_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_error)?;
        entries.sort_by_key(fs::DirEntry::file_name);

        let mut ups: BTreeMap<i64, (String, String)> = BTreeMap::new();
        let mut downs: BTreeMap<i64, (String, String)> = BTreeMap::new();

        for entry in entries {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(script) = parse_script_file_name(&file_name) else {
                debug!(file = %file_name, "ignoring non-migration file");
                continue;
            };

            let sql = fs::read_to_string(&path)
                .map_err(|source| AuditError::Io { path: path.clone(), source })?;
            let target = match script.kind {
                ScriptKind::Up => &mut ups,
                ScriptKind::Down => &mut downs,
            };
            if target.insert(script.version, (script.name, sql)).is_some() {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "more than one {} script for version {:04}",
                    script.kind.as_str(),
                    script.version
                )));
            }
        }

        let mut migrations = Vec::with_capacity(ups.len());
        for (version, (name, sql)) in ups {
            let down = match downs.remove(&version) {
                Some((down_name, _)) if down_name != name => {
                    return Err(AuditError::InvalidMigrationSet(format!(
                        "down script {version:04}_{down_name} does not match up script {version:04}_{name}"
                    )));
                }
                Some((_, down_sql)) => Some(MigrationBody::sql(down_sql)),
                None => None,
            };
            migrations.push(Migration { version, name, up: MigrationBody::sql(sql), down });
        }

        if let Some((version, (name, _))) = downs.into_iter().next() {
            return Err(AuditError::InvalidMigrationSet(format!(
                "down script {version:04}_{name} has no matching up script"
            )));
        }

        Self::new(migrations)
    }

    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    #[must_use]
    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations.iter().find(|migration| migration.version == version)
    }

    #[must_use]
    pub fn latest_version(&self) -> i64 {
        self.migrations.last().map_or(0, |migration| migration.version)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptKind {
    Up,
    Down,
}

impl ScriptKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ScriptFile {
    version: i64,
    name: String,
    kind: ScriptKind,
}

fn parse_script_file_name(file_name: &str) -> Option<ScriptFile> {
    let stem = file_name.strip_suffix(".sql")?;
    let (stem, kind) = if let Some(stem) = stem.strip_suffix(".up") {
        (stem, ScriptKind::Up)
    } else if let Some(stem) = stem.strip_suffix(".down") {
        (stem, ScriptKind::Down)
    } else {
        (stem, ScriptKind::Up)
    };

    let (prefix, name) = stem.split_once('_')?;
    if prefix.is_empty() || name.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(ScriptFile { version: prefix.parse().ok()?, name: name.to_string(), kind })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingMigration {
    pub version: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<PendingMigration>,
    /// Versions recorded in the store that the migration set does not know about.
    pub unknown_applied: Vec<i64>,
}

/// Create-shadow, copy, drop, rename: reshapes a table without relying on
/// `ALTER TABLE ... DROP COLUMN`.
#[derive(Debug, Clone, Copy)]
pub struct ShadowRebuild<'a> {
    pub table: &'a str,
    /// Column and constraint definitions of the new shape, without parentheses.
    pub columns_sql: &'a str,
    /// Columns present in both shapes; everything else is dropped or left NULL.
    pub copy_columns: &'a [&'a str],
    /// Index statements to recreate after the rename.
    pub indexes: &'a [&'a str],
}

impl ShadowRebuild<'_> {
    /// Must run inside a migration transaction with foreign keys suspended.
    ///
    /// # Errors
    /// Returns an error when any statement fails or the row counts differ.
    pub fn run(&self, conn: &Connection) -> AuditResult<()> {
        let table = self.table;
        let shadow = format!("{table}__shadow");
        let columns = self.copy_columns.join(", ");

        let expected = count_rows(conn, table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE {shadow} ({});
             INSERT INTO {shadow} ({columns}) SELECT {columns} FROM {table};",
            self.columns_sql
        ))?;

        let copied = count_rows(conn, &shadow)?;
        if copied != expected {
            return Err(AuditError::RebuildMismatch { table: table.to_string(), expected, copied });
        }

        conn.execute_batch(&format!(
            "DROP TABLE {table};
             ALTER TABLE {shadow} RENAME TO {table};"
        ))?;
        for index in self.indexes {
            conn.execute_batch(index)?;
        }

        Ok(())
    }
}

fn count_rows(conn: &Connection, table: &str) -> AuditResult<i64> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count)
}

impl SqliteStore {
    /// Report applied, pending, and unknown migrations relative to `set`.
    ///
    /// # Errors
    /// Returns an error when the version marker cannot be read.
    pub fn migration_status(&self, set: &MigrationSet) -> AuditResult<MigrationStatus> {
        ensure_schema_migrations(&self.conn)?;
        let current_version = current_schema_version(&self.conn)?;
        let applied = applied_migrations(&self.conn)?;

        let unknown_applied = applied
            .iter()
            .filter(|row| set.get(row.version).is_none())
            .map(|row| row.version)
            .collect();
        let pending = set
            .migrations()
            .iter()
            .filter(|migration| migration.version > current_version)
            .map(|migration| PendingMigration {
                version: migration.version,
                name: migration.name.clone(),
            })
            .collect();

        Ok(MigrationStatus {
            current_version,
            target_version: set.latest_version(),
            applied,
            pending,
            unknown_applied,
        })
    }

    /// Apply every migration above the current version, in ascending order, one
    /// transaction each. `to` caps the highest version applied.
    ///
    /// Returns how many migrations this call applied; zero when nothing was pending.
    ///
    /// # Errors
    /// Returns [`AuditError::MigrationFailed`] for the first migration that fails.
    /// That migration is rolled back and later ones are not attempted.
    pub fn apply_pending(&mut self, set: &MigrationSet, to: Option<i64>) -> AuditResult<usize> {
        let status = self.migration_status(set)?;
        let current = status.current_version;
        if !status.unknown_applied.is_empty() {
            warn!(versions = ?status.unknown_applied, "store has migrations unknown to this set");
        }

        if let Some(to) = to {
            if to < current {
                return Err(AuditError::InvalidTransition(format!(
                    "schema is at version {current}; `up --to {to}` cannot move backwards"
                )));
            }
            if to != current && set.get(to).is_none() {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "no migration with version {to:04}"
                )));
            }
        }

        let ceiling = to.unwrap_or(i64::MAX);
        let mut applied = 0;
        for migration in set.migrations() {
            if migration.version <= current || migration.version > ceiling {
                continue;
            }
            if self.apply_one(migration)? {
                applied += 1;
            }
        }

        Ok(applied)
    }

    /// Discover the scripts in `dir` and apply everything pending.
    ///
    /// # Errors
    /// Returns an error when discovery fails or a migration fails.
    pub fn apply_pending_dir(&mut self, dir: &Path) -> AuditResult<usize> {
        let set = MigrationSet::from_dir(dir)?;
        self.apply_pending(&set, None)
    }

    /// Run down scripts of every applied migration above `target`, newest first.
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidMigrationSet`] before touching the store when
    /// any migration to revert has no down script, and
    /// [`AuditError::MigrationFailed`] when a down script fails.
    pub fn rollback_to(&mut self, set: &MigrationSet, target: i64) -> AuditResult<usize> {
        ensure_schema_migrations(&self.conn)?;
        let current = current_schema_version(&self.conn)?;
        if target < 0 || target > current {
            return Err(AuditError::InvalidTransition(format!(
                "cannot roll back from version {current} to version {target}"
            )));
        }

        let mut to_revert = applied_migrations(&self.conn)?
            .into_iter()
            .filter(|row| row.version > target)
            .collect::<Vec<_>>();
        to_revert.sort_by_key(|row| std::cmp::Reverse(row.version));

        let mut plan = Vec::with_capacity(to_revert.len());
        for row in &to_revert {
            let Some(migration) = set.get(row.version) else {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "applied migration {:04} ({}) is not part of the migration set",
                    row.version, row.name
                )));
            };
            let Some(down) = migration.down.as_ref() else {
                return Err(AuditError::InvalidMigrationSet(format!(
                    "migration {:04} ({}) has no down script",
                    migration.version, migration.name
                )));
            };
            plan.push((migration, down));
        }

        let mut reverted = 0;
        for (migration, down) in plan {
            if self.revert_one(migration, down)? {
                reverted += 1;
            }
        }
        Ok(reverted)
    }

    fn apply_one(&mut self, migration: &Migration) -> AuditResult<bool> {
        let outcome = self.with_foreign_keys_suspended(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            // Another process may have applied it while we waited for the lock.
            if current_schema_version(&tx)? >= migration.version {
                return Ok(false);
            }

            migration.up.run(&tx)?;
            ensure_foreign_keys_hold(&tx)?;
            tx.execute(
                "INSERT INTO schema_migrations(version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, unix_now()],
            )?;
            tx.commit()?;
            Ok(true)
        });

        match outcome {
            Ok(true) => {
                info!(version = migration.version, name = %migration.name, "applied migration");
                Ok(true)
            }
            Ok(false) => {
                debug!(version = migration.version, "migration already applied by another writer");
                Ok(false)
            }
            Err(err) => {
                warn!(version = migration.version, name = %migration.name, error = %err, "migration failed");
                Err(wrap_migration_error(migration, err))
            }
        }
    }

    fn revert_one(&mut self, migration: &Migration, down: &MigrationBody) -> AuditResult<bool> {
        let outcome = self.with_foreign_keys_suspended(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if current_schema_version(&tx)? != migration.version {
                return Ok(false);
            }

            down.run(&tx)?;
            ensure_foreign_keys_hold(&tx)?;
            tx.execute(
                "DELETE FROM schema_migrations WHERE version = ?1",
                params![migration.version],
            )?;
            tx.commit()?;
            Ok(true)
        });

        match outcome {
            Ok(true) => {
                info!(version = migration.version, name = %migration.name, "rolled back migration");
                Ok(true)
            }
            Ok(false) => {
                debug!(version = migration.version, "migration no longer current; skipping rollback");
                Ok(false)
            }
            Err(err) => {
                warn!(version = migration.version, name = %migration.name, error = %err, "rollback failed");
                Err(wrap_migration_error(migration, err))
            }
        }
    }

    /// SQLite ignores `PRAGMA foreign_keys` inside a transaction, so it is
    /// switched off around the whole migration and checked explicitly before commit.
    fn with_foreign_keys_suspended<T>(
        &mut self,
        f: impl FnOnce(&mut Connection) -> AuditResult<T>,
    ) -> AuditResult<T> {
        self.conn.pragma_update(None, "foreign_keys", false)?;
        let result = f(&mut self.conn);
        let restored = self.conn.pragma_update(None, "foreign_keys", true);
        let value = result?;
        restored?;
        Ok(value)
    }
}

fn wrap_migration_error(migration: &Migration, err: AuditError) -> AuditError {
    match err {
        AuditError::StoreUnavailable(_) | AuditError::MigrationFailed { .. } => err,
        other => AuditError::migration_failed(migration.version, &migration.name, &other),
    }
}

fn ensure_foreign_keys_hold(conn: &Connection) -> AuditResult<()> {
    let violations = foreign_key_violations(conn)?;
    if let Some(first) = violations.first() {
        return Err(AuditError::InvalidTransition(format!(
            "foreign key check failed: {} violation(s), first in {} rowid {} referencing {}",
            violations.len(),
            first.table,
            first.rowid,
            first.parent
        )));
    }
    Ok(())
}

fn applied_migrations(conn: &Connection) -> AuditResult<Vec<AppliedMigration>> {
    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM schema_migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration { version: row.get(0)?, name: row.get(1)?, applied_at: row.get(2)? })
    })?;

    let mut applied = Vec::new();
    for row in rows {
        applied.push(row?);
    }
    Ok(applied)
}


#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::thread;

    use anyhow::{anyhow, Result};
    use tempfile::TempDir;

    use super::test_support::schema_snapshot;
    use super::*;

    fn write_scripts(files: &[(&str, &str)]) -> Result<TempDir> {
        let dir = tempfile::tempdir()?;
        for (name, sql) in files {
            fs::write(dir.path().join(name), sql)?;
        }
        Ok(dir)
    }

    fn init_and_add_column() -> Result<TempDir> {
        write_scripts(&[
            (
                "0001_init.up.sql",
                "CREATE TABLE jobs (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 CREATE INDEX idx_jobs_name ON jobs(name);",
            ),
            ("0001_init.down.sql", "DROP TABLE jobs;"),
            ("0002_add_column.up.sql", "ALTER TABLE jobs ADD COLUMN owner TEXT;"),
            (
                "0002_add_column.down.sql",
                "CREATE TABLE jobs__shadow (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO jobs__shadow (id, name) SELECT id, name FROM jobs;
                 DROP TABLE jobs;
                 ALTER TABLE jobs__shadow RENAME TO jobs;
                 CREATE INDEX idx_jobs_name ON jobs(name);",
            ),
            ("README.md", "not a migration"),
            ("notes_0003.sql", "SELECT 1;"),
        ])
    }

    fn table_exists(store: &SqliteStore, name: &str) -> Result<bool> {
        Ok(crate::table_exists(&store.conn, name)?)
    }

    #[test]
    fn parse_script_file_name_recognizes_up_down_and_plain_scripts() {
        assert_eq!(
            parse_script_file_name("0007_add_index.sql"),
            Some(ScriptFile { version: 7, name: "add_index".to_string(), kind: ScriptKind::Up })
        );
        assert_eq!(
            parse_script_file_name("0002_run_output_sig.down.sql"),
            Some(ScriptFile {
                version: 2,
                name: "run_output_sig".to_string(),
                kind: ScriptKind::Down
            })
        );
        assert_eq!(parse_script_file_name("0001_init.py"), None);
        assert_eq!(parse_script_file_name("init.sql"), None);
        assert_eq!(parse_script_file_name("v1_init.sql"), None);
        assert_eq!(parse_script_file_name("0003_.sql"), None);
    }

    // Test IDs: TMIG-001
    #[test]
    fn from_dir_orders_by_version_and_pairs_down_scripts() -> Result<()> {
        let dir = write_scripts(&[
            ("0010_late.sql", "SELECT 1;"),
            ("0002_second.up.sql", "SELECT 1;"),
            ("0002_second.down.sql", "SELECT 2;"),
            ("0001_first.sql", "SELECT 1;"),
        ])?;

        let set = MigrationSet::from_dir(dir.path())?;
        let versions = set.migrations().iter().map(|m| m.version).collect::<Vec<_>>();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(set.latest_version(), 10);
        assert!(set.get(1).is_some_and(|m| m.down.is_none()));
        assert!(set.get(2).and_then(|m| m.down.as_ref()).is_some_and(|d| d.sql == "SELECT 2;"));
        Ok(())
    }

    // Test IDs: TMIG-002
    #[test]
    fn from_dir_rejects_ambiguous_or_orphaned_scripts() -> Result<()> {
        let duplicate = write_scripts(&[("0001_a.sql", "SELECT 1;"), ("0001_b.sql", "SELECT 1;")])?;
        assert!(matches!(
            MigrationSet::from_dir(duplicate.path()),
            Err(AuditError::InvalidMigrationSet(_))
        ));

        let orphan = write_scripts(&[("0001_a.sql", "SELECT 1;"), ("0002_b.down.sql", "SELECT 1;")])?;
        assert!(matches!(
            MigrationSet::from_dir(orphan.path()),
            Err(AuditError::InvalidMigrationSet(_))
        ));

        let zero = write_scripts(&[("0000_zero.sql", "SELECT 1;")])?;
        assert!(matches!(
            MigrationSet::from_dir(zero.path()),
            Err(AuditError::InvalidMigrationSet(_))
        ));

        let mismatched =
            write_scripts(&[("0001_a.up.sql", "SELECT 1;"), ("0001_b.down.sql", "SELECT 1;")])?;
        assert!(matches!(
            MigrationSet::from_dir(mismatched.path()),
            Err(AuditError::InvalidMigrationSet(_))
        ));
        Ok(())
    }

    // Test IDs: TMIG-003
    #[test]
    fn apply_pending_reaches_version_two_then_is_a_no_op() -> Result<()> {
        let dir = init_and_add_column()?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        assert_eq!(store.apply_pending_dir(dir.path())?, 2);
        assert_eq!(store.schema_version()?, 2);
        let shape = schema_snapshot(&store.conn)?;

        assert_eq!(store.apply_pending_dir(dir.path())?, 0);
        assert_eq!(store.schema_version()?, 2);
        assert_eq!(schema_snapshot(&store.conn)?, shape);

        let status = store.migration_status(&MigrationSet::from_dir(dir.path())?)?;
        assert!(status.pending.is_empty());
        assert_eq!(status.applied.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(), vec![
            "init",
            "add_column"
        ]);
        Ok(())
    }

    // Test IDs: TMIG-004
    #[test]
    fn failed_migration_rolls_back_and_leaves_prior_version() -> Result<()> {
        let dir = init_and_add_column()?;
        fs::write(
            dir.path().join("0003_broken.sql"),
            "CREATE TABLE partial (id INTEGER PRIMARY KEY);
             INSERT INTO jobs (id, name) VALUES (1, 'kept out');
             INSERT INTO no_such_table (id) VALUES (1);",
        )?;
        fs::write(dir.path().join("0004_never.sql"), "CREATE TABLE never (id INTEGER);")?;

        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let Err(err) = store.apply_pending_dir(dir.path()) else {
            return Err(anyhow!("expected migration 3 to fail"));
        };

        let AuditError::MigrationFailed { version, name, reason } = &err else {
            return Err(anyhow!("unexpected error kind: {err}"));
        };
        assert_eq!(*version, 3);
        assert_eq!(name, "broken");
        assert!(reason.contains("no_such_table"), "reason: {reason}");

        assert_eq!(store.schema_version()?, 2);
        assert!(!table_exists(&store, "partial")?);
        assert!(!table_exists(&store, "never")?);
        let jobs: i64 = store.conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        assert_eq!(jobs, 0);

        let foreign_keys: i64 = store.conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        assert_eq!(foreign_keys, 1);
        Ok(())
    }

    // Test IDs: TMIG-005
    #[test]
    fn apply_pending_honors_target_version() -> Result<()> {
        let dir = init_and_add_column()?;
        let set = MigrationSet::from_dir(dir.path())?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        assert_eq!(store.apply_pending(&set, Some(1))?, 1);
        assert_eq!(store.schema_version()?, 1);
        assert!(matches!(
            store.apply_pending(&set, Some(5)),
            Err(AuditError::InvalidMigrationSet(_))
        ));
        assert_eq!(store.apply_pending(&set, Some(2))?, 1);
        assert!(matches!(
            store.apply_pending(&set, Some(1)),
            Err(AuditError::InvalidTransition(_))
        ));
        Ok(())
    }

    // Test IDs: TMIG-006
    #[test]
    fn rollback_restores_prior_structure_and_data() -> Result<()> {
        let dir = init_and_add_column()?;
        let set = MigrationSet::from_dir(dir.path())?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_version()?, 0);

        let empty = schema_snapshot(&store.conn)?;
        store.apply_pending(&set, Some(1))?;
        store.conn.execute("INSERT INTO jobs (id, name) VALUES (1, 'manifest')", [])?;
        let at_one = schema_snapshot(&store.conn)?;

        store.apply_pending(&set, None)?;
        assert_eq!(store.rollback_to(&set, 1)?, 1);
        assert_eq!(store.schema_version()?, 1);
        assert_eq!(schema_snapshot(&store.conn)?, at_one);
        let name: String =
            store.conn.query_row("SELECT name FROM jobs WHERE id = 1", [], |row| row.get(0))?;
        assert_eq!(name, "manifest");

        assert_eq!(store.rollback_to(&set, 0)?, 1);
        assert_eq!(store.schema_version()?, 0);
        let after = schema_snapshot(&store.conn)?;
        assert_eq!(
            after.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            empty.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );

        assert_eq!(store.apply_pending(&set, None)?, 2);
        Ok(())
    }

    // Test IDs: TMIG-007
    #[test]
    fn rollback_without_down_script_changes_nothing() -> Result<()> {
        let dir = write_scripts(&[
            ("0001_init.up.sql", "CREATE TABLE jobs (id INTEGER PRIMARY KEY);"),
            ("0001_init.down.sql", "DROP TABLE jobs;"),
            ("0002_one_way.sql", "CREATE TABLE audit_notes (id INTEGER PRIMARY KEY);"),
        ])?;
        let set = MigrationSet::from_dir(dir.path())?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.apply_pending(&set, None)?;

        assert!(matches!(store.rollback_to(&set, 0), Err(AuditError::InvalidMigrationSet(_))));
        assert_eq!(store.schema_version()?, 2);
        assert!(table_exists(&store, "jobs")?);
        assert!(table_exists(&store, "audit_notes")?);

        assert!(matches!(store.rollback_to(&set, 3), Err(AuditError::InvalidTransition(_))));
        Ok(())
    }

    // Test IDs: TMIG-008
    #[test]
    fn status_lists_pending_and_unknown_versions() -> Result<()> {
        let dir = init_and_add_column()?;
        let set = MigrationSet::from_dir(dir.path())?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.apply_pending(&set, Some(1))?;
        store.conn.execute(
            "INSERT INTO schema_migrations(version, name, applied_at) VALUES (9, 'from_elsewhere', 0)",
            [],
        )?;

        let status = store.migration_status(&set)?;
        assert_eq!(status.current_version, 9);
        assert_eq!(status.target_version, 2);
        assert_eq!(status.unknown_applied, vec![9]);
        // Pending is relative to the version marker, so a foreign higher version hides 0002.
        assert!(status.pending.is_empty());
        Ok(())
    }

    // Test IDs: TMIG-009
    #[test]
    fn failing_foreign_key_check_aborts_migration() -> Result<()> {
        let dir = write_scripts(&[
            (
                "0001_init.sql",
                "CREATE TABLE parents (id INTEGER PRIMARY KEY);
                 CREATE TABLE children (
                   id INTEGER PRIMARY KEY,
                   parent_id INTEGER NOT NULL REFERENCES parents(id)
                 );",
            ),
            ("0002_orphan.sql", "INSERT INTO children (id, parent_id) VALUES (1, 42);"),
        ])?;
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let Err(AuditError::MigrationFailed { version, reason, .. }) =
            store.apply_pending_dir(dir.path())
        else {
            return Err(anyhow!("expected orphan row to fail the migration"));
        };
        assert_eq!(version, 2);
        assert!(reason.contains("foreign key check failed"), "reason: {reason}");
        assert_eq!(store.schema_version()?, 1);
        let children: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM children", [], |row| row.get(0))?;
        assert_eq!(children, 0);
        Ok(())
    }

    // Test IDs: TMIG-010
    #[test]
    fn shadow_rebuild_reshapes_a_parent_table_in_place() -> Result<()> {
        fn drop_note_column(conn: &Connection) -> AuditResult<()> {
            ShadowRebuild {
                table: "parents",
                columns_sql: "id INTEGER PRIMARY KEY, label TEXT NOT NULL",
                copy_columns: &["id", "label"],
                indexes: &["CREATE INDEX idx_parents_label ON parents(label)"],
            }
            .run(conn)
        }

        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let set = MigrationSet::new(vec![
            Migration {
                version: 1,
                name: "init".to_string(),
                up: MigrationBody::sql(
                    "CREATE TABLE parents (id INTEGER PRIMARY KEY, label TEXT NOT NULL, note TEXT);
                     CREATE INDEX idx_parents_label ON parents(label);
                     CREATE TABLE children (
                       id INTEGER PRIMARY KEY,
                       parent_id INTEGER NOT NULL REFERENCES parents(id)
                     );
                     INSERT INTO parents VALUES (1, 'odin', 'x'), (2, 'samson', NULL);
                     INSERT INTO children VALUES (10, 1), (11, 2);",
                ),
                down: None,
            },
            Migration {
                version: 2,
                name: "drop_note".to_string(),
                up: MigrationBody::hook(drop_note_column),
                down: None,
            },
        ])?;

        assert_eq!(store.apply_pending(&set, None)?, 2);

        let shape = schema_snapshot(&store.conn)?;
        let Some(parents) = shape.iter().find(|t| t.name == "parents") else {
            return Err(anyhow!("parents table missing after rebuild"));
        };
        assert_eq!(parents.columns.iter().map(|c| c.0.as_str()).collect::<Vec<_>>(), vec![
            "id", "label"
        ]);
        assert_eq!(parents.indexes, vec!["idx_parents_label".to_string()]);

        let joined: i64 = store.conn.query_row(
            "SELECT COUNT(*) FROM children c JOIN parents p ON p.id = c.parent_id",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(joined, 2);
        assert!(store.integrity_check()?.foreign_key_violations.is_empty());
        Ok(())
    }

    #[test]
    fn shadow_rebuild_refuses_to_drop_rows() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(
            "CREATE TABLE tags (label TEXT NOT NULL);
             INSERT INTO tags VALUES ('odin'), ('odin'), ('samson');",
        )?;

        let tx = store.conn.transaction()?;
        let result = ShadowRebuild {
            table: "tags",
            columns_sql: "label TEXT PRIMARY KEY ON CONFLICT IGNORE",
            copy_columns: &["label"],
            indexes: &[],
        }
        .run(&tx);
        assert!(
            matches!(
                &result,
                Err(AuditError::RebuildMismatch { table, expected: 3, copied: 2 }) if table == "tags"
            ),
            "{result:?}"
        );
        drop(tx);

        assert!(!table_exists(&store, "tags__shadow")?);
        let rows: i64 = store.conn.query_row("SELECT COUNT(*) FROM tags", [], |row| row.get(0))?;
        assert_eq!(rows, 3);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_apply_pending_applies_each_migration_once() -> Result<()> {
        let scripts = init_and_add_column()?;
        let db_dir = tempfile::tempdir()?;
        let db_path = db_dir.path().join("audit.sqlite3");
        assert_eq!(SqliteStore::open(&db_path)?.schema_version()?, 0);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let db_path = db_path.clone();
            let scripts_path = scripts.path().to_path_buf();
            handles.push(thread::spawn(move || -> Result<usize> {
                let mut store = SqliteStore::open(&db_path)?;
                Ok(store.apply_pending_dir(&scripts_path)?)
            }));
        }

        let mut total = 0;
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("migration thread panicked"));
            };
            total += result?;
        }

        assert_eq!(total, 2);
        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.schema_version()?, 2);
        let rows: i64 =
            store.conn.query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))?;
        assert_eq!(rows, 2);
        Ok(())
    }
}
