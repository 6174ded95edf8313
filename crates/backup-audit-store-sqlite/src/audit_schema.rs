use backup_audit_core::{signature_hash_of_text, SignatureSlot};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::{AuditResult, Migration, MigrationBody, MigrationSet, ShadowRebuild};

/// Schema version the ledger reads and writes.
pub const LEDGER_SCHEMA_VERSION: i64 = 6;

const STATUS_CHECK: &str = "CHECK (status IN ('running', 'success', 'failed', 'skipped'))";
const LIFECYCLE_CHECK: &str = "CHECK ((status = 'running') = (finished_at IS NULL))";

const CREATE_V1_SQL: &str = r"
CREATE TABLE runs (
  run_id TEXT PRIMARY KEY,
  started_at INTEGER NOT NULL,
  finished_at INTEGER,
  status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed', 'skipped')),
  meta_json TEXT,
  input_sig_json TEXT,
  CHECK ((status = 'running') = (finished_at IS NULL))
);

CREATE TABLE steps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(run_id),
  name TEXT NOT NULL,
  started_at INTEGER NOT NULL,
  finished_at INTEGER,
  status TEXT NOT NULL CHECK (status IN ('running', 'success', 'failed', 'skipped')),
  message TEXT,
  input_sig_json TEXT,
  output_sig_json TEXT,
  output_path TEXT,
  CHECK ((status = 'running') = (finished_at IS NULL))
);

CREATE INDEX idx_steps_run ON steps(run_id);
CREATE INDEX idx_runs_started ON runs(started_at);
";

const DROP_V1_SQL: &str = r"
DROP TABLE steps;
DROP TABLE runs;
";

const ADD_RUN_OUTPUT_SIG_SQL: &str = "ALTER TABLE runs ADD COLUMN output_sig_json TEXT;";

const ADD_SIG_HASHES_SQL: &str = r"
ALTER TABLE runs ADD COLUMN input_sig_hash TEXT;
ALTER TABLE runs ADD COLUMN output_sig_hash TEXT;
CREATE INDEX idx_runs_input_sig_hash ON runs(input_sig_hash);
CREATE INDEX idx_runs_output_sig_hash ON runs(output_sig_hash);
";

const ADD_RUNS_NAME_SQL: &str = r"
ALTER TABLE runs ADD COLUMN name TEXT;
CREATE INDEX idx_runs_name_started ON runs(name, started_at);
";

const ADD_RUN_OUTPUT_PATH_SQL: &str = "ALTER TABLE runs ADD COLUMN output_path TEXT;";

const ADD_SIGNATURE_SLOTS_SQL: &str = r"
ALTER TABLE runs ADD COLUMN current_upstream_signature TEXT;
ALTER TABLE runs ADD COLUMN current_upstream_signature_hash TEXT;
ALTER TABLE runs ADD COLUMN previous_upstream_signature TEXT;
ALTER TABLE runs ADD COLUMN previous_upstream_signature_hash TEXT;
ALTER TABLE runs ADD COLUMN previous_job_signature TEXT;
ALTER TABLE runs ADD COLUMN previous_job_signature_hash TEXT;
ALTER TABLE runs ADD COLUMN job_result_signature TEXT;
ALTER TABLE runs ADD COLUMN job_result_signature_hash TEXT;
";

const RUNS_V1_COLUMNS: [&str; 6] =
    ["run_id", "started_at", "finished_at", "status", "meta_json", "input_sig_json"];
const RUNS_V2_COLUMNS: [&str; 7] = [
    "run_id",
    "started_at",
    "finished_at",
    "status",
    "meta_json",
    "input_sig_json",
    "output_sig_json",
];
const RUNS_V3_COLUMNS: [&str; 9] = [
    "run_id",
    "started_at",
    "finished_at",
    "status",
    "meta_json",
    "input_sig_json",
    "output_sig_json",
    "input_sig_hash",
    "output_sig_hash",
];
const RUNS_V4_COLUMNS: [&str; 10] = [
    "run_id",
    "started_at",
    "finished_at",
    "status",
    "meta_json",
    "input_sig_json",
    "output_sig_json",
    "input_sig_hash",
    "output_sig_hash",
    "name",
];
const RUNS_V5_COLUMNS: [&str; 11] = [
    "run_id",
    "started_at",
    "finished_at",
    "status",
    "meta_json",
    "input_sig_json",
    "output_sig_json",
    "input_sig_hash",
    "output_sig_hash",
    "name",
    "output_path",
];

const STEPS_V1_COLUMNS: [&str; 10] = [
    "id",
    "run_id",
    "name",
    "started_at",
    "finished_at",
    "status",
    "message",
    "input_sig_json",
    "output_sig_json",
    "output_path",
];
const STEPS_V5_COLUMNS: [&str; 7] =
    ["id", "run_id", "name", "started_at", "finished_at", "status", "message"];

const IDX_RUNS_STARTED: &str = "CREATE INDEX idx_runs_started ON runs(started_at)";
const IDX_RUNS_INPUT_SIG_HASH: &str =
    "CREATE INDEX idx_runs_input_sig_hash ON runs(input_sig_hash)";
const IDX_RUNS_OUTPUT_SIG_HASH: &str =
    "CREATE INDEX idx_runs_output_sig_hash ON runs(output_sig_hash)";
const IDX_RUNS_NAME_STARTED: &str =
    "CREATE INDEX idx_runs_name_started ON runs(name, started_at)";
const IDX_STEPS_RUN: &str = "CREATE INDEX idx_steps_run ON steps(run_id)";

/// The migrations that build the `runs`/`steps` ledger, oldest first.
#[must_use]
pub fn audit_schema_migrations() -> MigrationSet {
    let migrations = vec![
        Migration {
            version: 1,
            name: "init".to_string(),
            up: MigrationBody::sql(CREATE_V1_SQL),
            down: Some(MigrationBody::sql(DROP_V1_SQL)),
        },
        Migration {
            version: 2,
            name: "run_output_sig".to_string(),
            up: MigrationBody::sql(ADD_RUN_OUTPUT_SIG_SQL),
            down: Some(MigrationBody::hook(rebuild_runs_v1)),
        },
        Migration {
            version: 3,
            name: "sig_hashes".to_string(),
            up: MigrationBody::sql(ADD_SIG_HASHES_SQL).with_hook(backfill_signature_hashes),
            down: Some(MigrationBody::hook(rebuild_runs_v2)),
        },
        Migration {
            version: 4,
            name: "runs_name".to_string(),
            up: MigrationBody::sql(ADD_RUNS_NAME_SQL).with_hook(backfill_run_names),
            down: Some(MigrationBody::hook(rebuild_runs_v3)),
        },
        Migration {
            version: 5,
            name: "move_output_path".to_string(),
            up: MigrationBody::sql(ADD_RUN_OUTPUT_PATH_SQL).with_hook(move_step_outputs_to_runs),
            down: Some(MigrationBody::hook(restore_step_outputs)),
        },
        Migration {
            version: 6,
            name: "run_signature_slots".to_string(),
            up: MigrationBody::sql(ADD_SIGNATURE_SLOTS_SQL),
            down: Some(MigrationBody::hook(rebuild_runs_v5)),
        },
    ];

    MigrationSet { migrations }
}

/// `(json column, hash column)` of a signature slot in `runs`.
#[must_use]
pub fn slot_columns(slot: SignatureSlot) -> (&'static str, &'static str) {
    match slot {
        SignatureSlot::Input => ("input_sig_json", "input_sig_hash"),
        SignatureSlot::Output => ("output_sig_json", "output_sig_hash"),
        SignatureSlot::CurrentUpstream => {
            ("current_upstream_signature", "current_upstream_signature_hash")
        }
        SignatureSlot::PreviousUpstream => {
            ("previous_upstream_signature", "previous_upstream_signature_hash")
        }
        SignatureSlot::PreviousJobResult => {
            ("previous_job_signature", "previous_job_signature_hash")
        }
        SignatureSlot::JobResult => ("job_result_signature", "job_result_signature_hash"),
    }
}

fn runs_columns_sql(extra: &[&str]) -> String {
    let mut columns = vec![
        "run_id TEXT PRIMARY KEY".to_string(),
        "started_at INTEGER NOT NULL".to_string(),
        "finished_at INTEGER".to_string(),
        format!("status TEXT NOT NULL {STATUS_CHECK}"),
        "meta_json TEXT".to_string(),
    ];
    columns.extend(extra.iter().map(|column| format!("{column} TEXT")));
    columns.push(LIFECYCLE_CHECK.to_string());
    columns.join(",\n  ")
}

fn steps_columns_sql(extra: &[&str]) -> String {
    let mut columns = vec![
        "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
        "run_id TEXT NOT NULL REFERENCES runs(run_id)".to_string(),
        "name TEXT NOT NULL".to_string(),
        "started_at INTEGER NOT NULL".to_string(),
        "finished_at INTEGER".to_string(),
        format!("status TEXT NOT NULL {STATUS_CHECK}"),
        "message TEXT".to_string(),
    ];
    columns.extend(extra.iter().map(|column| format!("{column} TEXT")));
    columns.push(LIFECYCLE_CHECK.to_string());
    columns.join(",\n  ")
}

fn rebuild_runs(conn: &Connection, columns: &[&str], indexes: &[&str]) -> AuditResult<()> {
    // The first five columns are the fixed prefix; everything after is nullable text.
    let columns_sql = runs_columns_sql(&columns[5..]);
    ShadowRebuild { table: "runs", columns_sql: &columns_sql, copy_columns: columns, indexes }
        .run(conn)
}

fn rebuild_runs_v1(conn: &Connection) -> AuditResult<()> {
    rebuild_runs(conn, &RUNS_V1_COLUMNS, &[IDX_RUNS_STARTED])
}

fn rebuild_runs_v2(conn: &Connection) -> AuditResult<()> {
    rebuild_runs(conn, &RUNS_V2_COLUMNS, &[IDX_RUNS_STARTED])
}

fn rebuild_runs_v3(conn: &Connection) -> AuditResult<()> {
    rebuild_runs(
        conn,
        &RUNS_V3_COLUMNS,
        &[IDX_RUNS_STARTED, IDX_RUNS_INPUT_SIG_HASH, IDX_RUNS_OUTPUT_SIG_HASH],
    )
}

fn rebuild_runs_v4(conn: &Connection) -> AuditResult<()> {
    rebuild_runs(
        conn,
        &RUNS_V4_COLUMNS,
        &[IDX_RUNS_STARTED, IDX_RUNS_INPUT_SIG_HASH, IDX_RUNS_OUTPUT_SIG_HASH, IDX_RUNS_NAME_STARTED],
    )
}

fn rebuild_runs_v5(conn: &Connection) -> AuditResult<()> {
    rebuild_runs(
        conn,
        &RUNS_V5_COLUMNS,
        &[IDX_RUNS_STARTED, IDX_RUNS_INPUT_SIG_HASH, IDX_RUNS_OUTPUT_SIG_HASH, IDX_RUNS_NAME_STARTED],
    )
}

/// Newest step value of `column` for a run, the way legacy rows recorded outputs.
fn newest_step_value(conn: &Connection, run_id: &str, column: &str) -> AuditResult<Option<String>> {
    let value = conn
        .query_row(
            &format!(
                "SELECT {column} FROM steps
                 WHERE run_id = ?1 AND {column} IS NOT NULL
                 ORDER BY COALESCE(finished_at, 0) DESC, id DESC
                 LIMIT 1"
            ),
            params![run_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

fn backfill_signature_hashes(conn: &Connection) -> AuditResult<()> {
    let mut stmt = conn.prepare(
        "SELECT run_id, input_sig_json, output_sig_json FROM runs
         WHERE input_sig_hash IS NULL OR output_sig_hash IS NULL",
    )?;
    let runs = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (run_id, input_json, output_json) in runs {
        if let Some(input_json) = input_json {
            conn.execute(
                "UPDATE runs SET input_sig_hash = ?1 WHERE run_id = ?2",
                params![signature_hash_of_text(&input_json), run_id],
            )?;
        }

        let output_json = match output_json {
            Some(json) => Some(json),
            None => newest_step_value(conn, &run_id, "output_sig_json")?,
        };
        if let Some(output_json) = output_json {
            conn.execute(
                "UPDATE runs SET output_sig_json = ?1, output_sig_hash = ?2 WHERE run_id = ?3",
                params![output_json, signature_hash_of_text(&output_json), run_id],
            )?;
        }
    }

    Ok(())
}

/// Job name recorded in run metadata, if it is a non-blank string.
pub(crate) fn job_name_from_meta(meta: &Value) -> Option<String> {
    let job = meta.get("job")?.as_str()?.trim();
    (!job.is_empty()).then(|| job.to_string())
}

fn backfill_run_names(conn: &Connection) -> AuditResult<()> {
    let mut stmt = conn.prepare(
        "SELECT run_id, meta_json FROM runs WHERE name IS NULL AND meta_json IS NOT NULL",
    )?;
    let runs = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (run_id, meta_json) in runs {
        let Ok(meta) = serde_json::from_str::<Value>(&meta_json) else {
            continue;
        };
        if let Some(name) = job_name_from_meta(&meta) {
            conn.execute("UPDATE runs SET name = ?1 WHERE run_id = ?2", params![name, run_id])?;
        }
    }

    Ok(())
}

fn move_step_outputs_to_runs(conn: &Connection) -> AuditResult<()> {
    let mut stmt = conn.prepare(
        "SELECT run_id, input_sig_json, output_sig_json, output_path FROM runs
         WHERE run_id IN (SELECT run_id FROM steps)",
    )?;
    let runs = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (run_id, input_json, output_json, output_path) in runs {
        if output_path.is_none() {
            if let Some(path) = newest_step_value(conn, &run_id, "output_path")? {
                conn.execute(
                    "UPDATE runs SET output_path = ?1 WHERE run_id = ?2",
                    params![path, run_id],
                )?;
            }
        }
        if input_json.is_none() {
            if let Some(json) = newest_step_value(conn, &run_id, "input_sig_json")? {
                conn.execute(
                    "UPDATE runs SET input_sig_json = ?1, input_sig_hash = ?2 WHERE run_id = ?3",
                    params![json, signature_hash_of_text(&json), run_id],
                )?;
            }
        }
        if output_json.is_none() {
            if let Some(json) = newest_step_value(conn, &run_id, "output_sig_json")? {
                conn.execute(
                    "UPDATE runs SET output_sig_json = ?1, output_sig_hash = ?2 WHERE run_id = ?3",
                    params![json, signature_hash_of_text(&json), run_id],
                )?;
            }
        }
    }

    let columns_sql = steps_columns_sql(&[]);
    ShadowRebuild {
        table: "steps",
        columns_sql: &columns_sql,
        copy_columns: &STEPS_V5_COLUMNS,
        indexes: &[IDX_STEPS_RUN],
    }
    .run(conn)
}

fn restore_step_outputs(conn: &Connection) -> AuditResult<()> {
    let columns_sql = steps_columns_sql(&STEPS_V1_COLUMNS[7..]);
    ShadowRebuild {
        table: "steps",
        columns_sql: &columns_sql,
        copy_columns: &STEPS_V5_COLUMNS,
        indexes: &[IDX_STEPS_RUN],
    }
    .run(conn)?;

    rebuild_runs_v4(conn)
}
