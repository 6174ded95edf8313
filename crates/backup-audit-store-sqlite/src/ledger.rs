use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use backup_audit_core::{
    compare_signatures, signature_hash_of_text, unix_now, ChangeDecision, CoreError, JobHealth,
    RunId, RunRecord, Signature, SignatureSlot, Status, StepId, StepRecord,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::{debug, warn};

use crate::audit_schema::{audit_schema_migrations, job_name_from_meta, slot_columns};
use crate::{AuditError, AuditResult, SqliteStore, StoreConfig, LEDGER_SCHEMA_VERSION};

const RUN_BASE_COLUMNS: &str = "run_id, name, started_at, finished_at, status, meta_json, output_path";

/// Final status a step body hands to [`AuditLedger::record_step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome<T> {
    pub value: T,
    pub status: Status,
    pub message: Option<String>,
}

impl<T> StepOutcome<T> {
    #[must_use]
    pub fn success(value: T) -> Self {
        Self { value, status: Status::Success, message: None }
    }

    /// Step decided there was nothing to do, e.g. an unchanged signature.
    #[must_use]
    pub fn skipped(value: T, message: impl Into<String>) -> Self {
        Self { value, status: Status::Skipped, message: Some(message.into()) }
    }

    #[must_use]
    pub fn with_status(value: T, status: Status, message: Option<String>) -> Self {
        Self { value, status, message }
    }
}

/// Run/step audit trail on top of a store migrated to [`LEDGER_SCHEMA_VERSION`].
pub struct AuditLedger {
    store: SqliteStore,
}

impl AuditLedger {
    /// Wrap an already-migrated store.
    ///
    /// # Errors
    /// Returns [`AuditError::SchemaOutdated`] when the store is behind the ledger schema.
    pub fn new(store: SqliteStore) -> AuditResult<Self> {
        let current = store.schema_version()?;
        if current < LEDGER_SCHEMA_VERSION {
            return Err(AuditError::SchemaOutdated { current, required: LEDGER_SCHEMA_VERSION });
        }
        Ok(Self { store })
    }

    /// Open the store, bring it to the latest audit schema, and wrap it.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or a migration fails.
    pub fn open(config: &StoreConfig) -> AuditResult<Self> {
        let mut store = SqliteStore::open_with(config)?;
        let applied = store.apply_pending(&audit_schema_migrations(), None)?;
        if applied > 0 {
            debug!(applied, path = %store.path().display(), "audit schema migrated");
        }
        Self::new(store)
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    #[must_use]
    pub fn into_store(self) -> SqliteStore {
        self.store
    }

    /// Insert a `running` run. Without an explicit name, a string `meta.job` is used.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn begin_run(&mut self, name: Option<&str>, meta: &Value) -> AuditResult<RunId> {
        let run_id = RunId::new();
        let name = name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .or_else(|| job_name_from_meta(meta));
        let meta_json = serde_json::to_string(meta)?;

        self.store.conn.execute(
            "INSERT INTO runs (run_id, name, started_at, status, meta_json)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![run_id.to_string(), name, unix_now(), meta_json],
        )?;

        debug!(%run_id, name = name.as_deref().unwrap_or(""), "run started");
        Ok(run_id)
    }

    /// # Errors
    /// Returns [`AuditError::NotFound`] for an unknown run and
    /// [`AuditError::InvalidTransition`] when the run already finished.
    pub fn begin_step(&mut self, run_id: RunId, name: &str) -> AuditResult<StepId> {
        // Write lock first: a deferred read-then-write gets SQLITE_BUSY without waiting.
        let tx = self.store.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match run_status(&tx, run_id)? {
            None => return Err(AuditError::not_found("run", run_id)),
            Some(status) if status.is_terminal() => {
                return Err(AuditError::InvalidTransition(format!(
                    "run {run_id} is already {status}; cannot begin step {name}"
                )));
            }
            Some(_) => {}
        }

        tx.execute(
            "INSERT INTO steps (run_id, name, started_at, status) VALUES (?1, ?2, ?3, 'running')",
            params![run_id.to_string(), name, unix_now()],
        )?;
        let step_id = StepId(tx.last_insert_rowid());
        tx.commit()?;

        debug!(%run_id, %step_id, step = name, "step started");
        Ok(step_id)
    }

    /// # Errors
    /// Returns [`AuditError::InvalidTransition`] when `status` is `running` or the
    /// step already finished, and [`AuditError::NotFound`] for an unknown step.
    pub fn end_step(
        &mut self,
        step_id: StepId,
        status: Status,
        message: Option<&str>,
    ) -> AuditResult<()> {
        if !status.is_terminal() {
            return Err(AuditError::InvalidTransition(format!(
                "step {step_id} cannot be ended with status {status}"
            )));
        }

        let changed = self.store.conn.execute(
            "UPDATE steps SET finished_at = ?1, status = ?2, message = ?3
             WHERE id = ?4 AND status = 'running'",
            params![unix_now(), status.as_str(), message, step_id.0],
        )?;
        if changed == 1 {
            debug!(%step_id, %status, "step finished");
            return Ok(());
        }

        let current = self
            .store
            .conn
            .query_row("SELECT status FROM steps WHERE id = ?1", params![step_id.0], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        match current {
            None => Err(AuditError::not_found("step", step_id)),
            Some(current) => Err(AuditError::InvalidTransition(format!(
                "step {step_id} is already {current}"
            ))),
        }
    }

    /// Store `value` in a signature slot of a running run, together with its hash.
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidTransition`] once the run has finished and
    /// [`AuditError::NotFound`] for an unknown run.
    pub fn set_signature(
        &mut self,
        run_id: RunId,
        slot: SignatureSlot,
        value: &Value,
    ) -> AuditResult<Signature> {
        let signature = Signature::from_value(value)?;
        let (json_column, hash_column) = slot_columns(slot);

        let changed = self.store.conn.execute(
            &format!(
                "UPDATE runs SET {json_column} = ?1, {hash_column} = ?2
                 WHERE run_id = ?3 AND status = 'running'"
            ),
            params![signature.canonical_json, signature.hash, run_id.to_string()],
        )?;
        if changed == 1 {
            debug!(%run_id, %slot, hash = %signature.hash, "signature recorded");
            return Ok(signature);
        }

        match run_status(&self.store.conn, run_id)? {
            None => Err(AuditError::not_found("run", run_id)),
            Some(status) => Err(AuditError::InvalidTransition(format!(
                "run {run_id} is already {status}; signatures are read-only"
            ))),
        }
    }

    /// Finish a run. Steps still running are closed as `failed` in the same transaction.
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidTransition`] when `status` is `running` or the
    /// run already finished, and [`AuditError::NotFound`] for an unknown run.
    pub fn end_run(
        &mut self,
        run_id: RunId,
        status: Status,
        output_path: Option<&str>,
    ) -> AuditResult<()> {
        if !status.is_terminal() {
            return Err(AuditError::InvalidTransition(format!(
                "run {run_id} cannot be ended with status {status}"
            )));
        }

        let tx = self.store.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match run_status(&tx, run_id)? {
            None => return Err(AuditError::not_found("run", run_id)),
            Some(current) if current.is_terminal() => {
                return Err(AuditError::InvalidTransition(format!(
                    "run {run_id} is already {current}"
                )));
            }
            Some(_) => {}
        }

        let now = unix_now();
        let dangling = tx.execute(
            "UPDATE steps SET finished_at = ?1, status = 'failed', message = ?2
             WHERE run_id = ?3 AND status = 'running'",
            params![now, format!("run ended with status {status} before this step finished"), run_id.to_string()],
        )?;
        tx.execute(
            "UPDATE runs SET finished_at = ?1, status = ?2, output_path = COALESCE(?3, output_path)
             WHERE run_id = ?4",
            params![now, status.as_str(), output_path, run_id.to_string()],
        )?;
        tx.commit()?;

        if dangling > 0 {
            warn!(%run_id, dangling, "closed steps still running at end of run as failed");
        }
        debug!(%run_id, %status, "run finished");
        Ok(())
    }

    /// Run `f` as a step. The body decides the final status through its
    /// [`StepOutcome`]; `Err` ends the step `failed` with the error text.
    ///
    /// The closure's own value or error is handed back untouched.
    ///
    /// # Errors
    /// Returns [`AuditError::InvalidTransition`] when the body reports `running`
    /// (the step is then closed as `failed`), or another error when the step
    /// cannot be recorded.
    pub fn record_step<T, E, F>(
        &mut self,
        run_id: RunId,
        name: &str,
        f: F,
    ) -> AuditResult<Result<T, E>>
    where
        E: Display,
        F: FnOnce() -> Result<StepOutcome<T>, E>,
    {
        let step_id = self.begin_step(run_id, name)?;
        match f() {
            Ok(outcome) if !outcome.status.is_terminal() => {
                self.end_step(step_id, Status::Failed, Some("step body reported status running"))?;
                Err(AuditError::InvalidTransition(format!(
                    "step {name} of run {run_id} cannot finish with status {}",
                    outcome.status
                )))
            }
            Ok(StepOutcome { value, status, message }) => {
                self.end_step(step_id, status, message.as_deref())?;
                Ok(Ok(value))
            }
            Err(err) => {
                self.end_step(step_id, Status::Failed, Some(&err.to_string()))?;
                Ok(Err(err))
            }
        }
    }

    /// # Errors
    /// Returns [`AuditError::NotFound`] for an unknown run.
    pub fn get_run(&self, run_id: RunId) -> AuditResult<RunRecord> {
        let row = self
            .store
            .conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", run_select_columns()),
                params![run_id.to_string()],
                RunRow::from_row,
            )
            .optional()?;
        row.ok_or_else(|| AuditError::not_found("run", run_id))?.into_record()
    }

    /// Steps of a run in the order they were started.
    ///
    /// # Errors
    /// Returns [`AuditError::NotFound`] for an unknown run.
    pub fn steps_for(&self, run_id: RunId) -> AuditResult<Vec<StepRecord>> {
        if run_status(&self.store.conn, run_id)?.is_none() {
            return Err(AuditError::not_found("run", run_id));
        }

        let mut stmt = self.store.conn.prepare(
            "SELECT id, name, started_at, finished_at, status, message FROM steps
             WHERE run_id = ?1
             ORDER BY started_at, id",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut steps = Vec::new();
        for row in rows {
            let (id, name, started_at, finished_at, status, message) = row?;
            steps.push(StepRecord {
                step_id: StepId(id),
                run_id,
                name,
                started_at,
                finished_at,
                status: parse_status(&status)?,
                message,
            });
        }
        Ok(steps)
    }

    /// Newest runs first.
    ///
    /// # Errors
    /// Returns an error when a stored row cannot be decoded.
    pub fn recent_runs(&self, limit: usize) -> AuditResult<Vec<RunRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.store.conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
            run_select_columns()
        ))?;
        let rows = stmt.query_map(params![limit], RunRow::from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_record()?);
        }
        Ok(runs)
    }

    /// Signature in `slot` of the most recent `success` run named `name`.
    ///
    /// `None` when there is no successful run or that run left the slot empty;
    /// older successful runs are not consulted.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn latest_successful_signature(
        &self,
        name: &str,
        slot: SignatureSlot,
    ) -> AuditResult<Option<Signature>> {
        let (json_column, hash_column) = slot_columns(slot);
        let row = self
            .store
            .conn
            .query_row(
                &format!(
                    "SELECT {json_column}, {hash_column} FROM runs
                     WHERE name = ?1 AND status = 'success'
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![name],
                |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(json, hash)| stored_signature(json, hash)))
    }

    /// Compare `current` against the last successful run's signature in `slot`.
    ///
    /// # Errors
    /// Returns an error when the baseline cannot be read.
    pub fn check_unchanged(
        &self,
        name: &str,
        slot: SignatureSlot,
        current: &Signature,
    ) -> AuditResult<ChangeDecision> {
        let previous = self.latest_successful_signature(name, slot)?;
        Ok(compare_signatures(previous.as_ref(), current))
    }

    /// Per-job summary for every named job, ordered by name.
    ///
    /// # Errors
    /// Returns an error when a query fails or a stored row cannot be decoded.
    pub fn job_health(&self, now: i64, window: Duration) -> AuditResult<Vec<JobHealth>> {
        let window_start = now.saturating_sub(i64::try_from(window.as_secs()).unwrap_or(i64::MAX));
        let conn = &self.store.conn;

        let mut names_stmt =
            conn.prepare("SELECT DISTINCT name FROM runs WHERE name IS NOT NULL ORDER BY name")?;
        let names = names_stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut health = Vec::with_capacity(names.len());
        for name in names {
            let (run_id, status, started_at, finished_at) = conn.query_row(
                "SELECT run_id, status, started_at, finished_at FROM runs
                 WHERE name = ?1
                 ORDER BY started_at DESC, rowid DESC
                 LIMIT 1",
                params![name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )?;
            let failures: i64 = conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE name = ?1 AND status = 'failed' AND started_at >= ?2",
                params![name, window_start],
                |row| row.get(0),
            )?;

            let last_status = parse_status(&status)?;
            health.push(JobHealth {
                name,
                last_run_id: RunId::parse(&run_id)?,
                last_status,
                last_started_at: started_at,
                last_ok: last_status.is_ok(),
                failures_in_window: u32::try_from(failures).unwrap_or(u32::MAX),
                last_duration_secs: finished_at.map(|finished_at| finished_at - started_at),
            });
        }

        Ok(health)
    }
}

fn run_status(conn: &Connection, run_id: RunId) -> AuditResult<Option<Status>> {
    let status = conn
        .query_row(
            "SELECT status FROM runs WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    status.as_deref().map(parse_status).transpose()
}

fn parse_status(raw: &str) -> AuditResult<Status> {
    Status::parse(raw)
        .ok_or_else(|| AuditError::Core(CoreError::Validation(format!("unknown status {raw}"))))
}

fn stored_signature(json: Option<String>, hash: Option<String>) -> Option<Signature> {
    let json = json?;
    let hash = hash.unwrap_or_else(|| signature_hash_of_text(&json));
    Some(Signature { canonical_json: json, hash })
}

fn run_select_columns() -> String {
    let mut columns = RUN_BASE_COLUMNS.to_string();
    for slot in SignatureSlot::ALL {
        let (json_column, hash_column) = slot_columns(slot);
        columns.push_str(&format!(", {json_column}, {hash_column}"));
    }
    columns
}

struct RunRow {
    run_id: String,
    name: Option<String>,
    started_at: i64,
    finished_at: Option<i64>,
    status: String,
    meta_json: Option<String>,
    output_path: Option<String>,
    signatures: Vec<(SignatureSlot, Option<String>, Option<String>)>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut signatures = Vec::with_capacity(SignatureSlot::ALL.len());
        for (index, slot) in SignatureSlot::ALL.into_iter().enumerate() {
            let json_index = 7 + index * 2;
            signatures.push((slot, row.get(json_index)?, row.get(json_index + 1)?));
        }

        Ok(Self {
            run_id: row.get(0)?,
            name: row.get(1)?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
            status: row.get(4)?,
            meta_json: row.get(5)?,
            output_path: row.get(6)?,
            signatures,
        })
    }

    fn into_record(self) -> AuditResult<RunRecord> {
        let meta = match self.meta_json {
            None => Value::Null,
            Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        };

        let mut signatures = BTreeMap::new();
        for (slot, json, hash) in self.signatures {
            if let Some(signature) = stored_signature(json, hash) {
                signatures.insert(slot, signature);
            }
        }

        Ok(RunRecord {
            run_id: RunId::parse(&self.run_id)?,
            name: self.name,
            started_at: self.started_at,
            finished_at: self.finished_at,
            status: parse_status(&self.status)?,
            meta,
            signatures,
            output_path: self.output_path,
        })
    }
}
