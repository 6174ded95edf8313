use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap_or_else(|err| panic!("failed to create temp dir: {err}"))
}

fn run_audit<I, S>(db: &Path, args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_backup-audit"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("BACKUP_AUDIT_DB")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute backup-audit binary: {err}"))
}

fn run_json<I, S>(db: &Path, args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_audit(db, args);
    parse_success(&output)
}

fn parse_success(output: &Output) -> Value {
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "backup-audit command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let value: Value = serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"));
    assert_eq!(value["contract_version"], "cli.v1", "payload: {value}");
    value
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_migration(dir: &Path, file_name: &str, sql: &str) {
    fs::write(dir.join(file_name), sql)
        .unwrap_or_else(|err| panic!("failed to write migration {file_name}: {err}"));
}

fn write_two_step_migrations(dir: &Path) {
    write_migration(dir, "0001_init.up.sql", "CREATE TABLE jobs (id INTEGER PRIMARY KEY, name TEXT NOT NULL);");
    write_migration(dir, "0001_init.down.sql", "DROP TABLE jobs;");
    write_migration(dir, "0002_add_column.up.sql", "ALTER TABLE jobs ADD COLUMN owner TEXT;");
    write_migration(dir, "0002_add_column.down.sql", "ALTER TABLE jobs DROP COLUMN owner;");
}

// Test IDs: TCLI-001
#[test]
fn migrate_up_down_and_status_against_a_script_directory() {
    let root = temp_dir();
    let db = root.path().join("audit.sqlite3");
    let scripts = root.path().join("migrations");
    fs::create_dir_all(&scripts).unwrap_or_else(|err| panic!("failed to create dir: {err}"));
    write_two_step_migrations(&scripts);
    let dir = path_str(&scripts);

    let up = run_json(&db, ["migrate", "up", "--dir", dir]);
    assert_eq!(as_i64(&up, "before_version"), 0);
    assert_eq!(as_i64(&up, "after_version"), 2);
    assert_eq!(as_i64(&up, "applied_count"), 2);

    let again = run_json(&db, ["migrate", "up", "--dir", dir]);
    assert_eq!(as_i64(&again, "applied_count"), 0);
    assert_eq!(as_i64(&again, "after_version"), 2);

    let status = run_json(&db, ["migrate", "status", "--dir", dir]);
    assert_eq!(as_i64(&status, "current_version"), 2);
    assert_eq!(status["up_to_date"], true);
    assert_eq!(status["applied"].as_array().map(Vec::len), Some(2));

    let down = run_json(&db, ["migrate", "down", "--to", "1", "--dir", dir]);
    assert_eq!(as_i64(&down, "after_version"), 1);
    assert_eq!(as_i64(&down, "reverted_count"), 1);

    let status = run_json(&db, ["migrate", "status", "--dir", dir]);
    assert_eq!(status["up_to_date"], false);
    assert_eq!(status["pending"][0]["name"], "add_column");
}

// Test IDs: TCLI-002
#[test]
fn failing_migration_exits_non_zero_and_keeps_last_committed_version() {
    let root = temp_dir();
    let db = root.path().join("audit.sqlite3");
    let scripts = root.path().join("migrations");
    fs::create_dir_all(&scripts).unwrap_or_else(|err| panic!("failed to create dir: {err}"));
    write_migration(&scripts, "0001_init.sql", "CREATE TABLE jobs (id INTEGER PRIMARY KEY);");
    write_migration(
        &scripts,
        "0002_broken.sql",
        "CREATE TABLE partial (id INTEGER); INSERT INTO missing_table VALUES (1);",
    );
    let dir = path_str(&scripts);

    let output = run_audit(&db, ["migrate", "up", "--dir", dir]);
    assert!(!output.status.success(), "broken migration must fail the command");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("0002 (broken)"), "stderr:\n{stderr}");

    let status = run_json(&db, ["migrate", "status", "--dir", dir]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert_eq!(status["pending"][0]["version"], 2);
}

// Test IDs: TCLI-003
#[test]
fn ledger_commands_record_a_run_and_detect_unchanged_signatures() {
    let root = temp_dir();
    let db = root.path().join("audit.sqlite3");

    let begin = run_json(&db, ["run", "begin", "--meta", r#"{"job":"manifest","host":"odin"}"#]);
    assert_eq!(as_str(&begin, "name"), "manifest");
    let run_id = as_str(&begin, "run_id").to_string();

    let step = run_json(&db, ["step", "begin", "--run-id", run_id.as_str(), "--name", "scan"]);
    let step_id = as_i64(&step, "step_id").to_string();
    run_json(&db, ["step", "end", "--step-id", step_id.as_str(), "--status", "success"]);

    let set = run_json(&db, [
        "signature",
        "set",
        "--run-id",
        run_id.as_str(),
        "--slot",
        "output",
        "--json",
        r#"{"files": 2, "root": "/srv"}"#,
    ]);
    let hash = set["signature"]["hash"].as_str().map(str::to_string);

    let ended = run_json(&db, [
        "run",
        "end",
        "--run-id",
        run_id.as_str(),
        "--status",
        "success",
        "--output-path",
        "/srv/manifest.json",
    ]);
    assert_eq!(ended["run"]["status"], "success");
    assert_eq!(ended["run"]["output_path"], "/srv/manifest.json");
    assert_eq!(ended["steps"].as_array().map(Vec::len), Some(1));

    let latest =
        run_json(&db, ["signature", "latest", "--name", "manifest", "--slot", "output"]);
    assert_eq!(latest["signature"]["hash"].as_str().map(str::to_string), hash);

    let check = run_json(&db, [
        "signature",
        "check",
        "--name",
        "manifest",
        "--slot",
        "output",
        "--json",
        r#"{"root":"/srv","files":2}"#,
    ]);
    assert_eq!(as_str(&check, "decision"), "unchanged");
    assert_eq!(check["should_skip"], true);

    let late = run_audit(&db, [
        "signature", "set", "--run-id", run_id.as_str(), "--slot", "input", "--json", "{}",
    ]);
    assert!(!late.status.success(), "signatures of a finished run are read-only");

    let list = run_json(&db, ["run", "list", "--limit", "5"]);
    assert_eq!(list["runs"][0]["run_id"], run_id.as_str());
}

// Test IDs: TCLI-004
#[test]
fn invalid_transitions_and_arguments_exit_non_zero() {
    let root = temp_dir();
    let db = root.path().join("audit.sqlite3");

    let begin = run_json(&db, ["run", "begin", "--name", "restic"]);
    let run_id = as_str(&begin, "run_id").to_string();
    let step = run_json(&db, ["step", "begin", "--run-id", run_id.as_str(), "--name", "snapshot"]);
    let step_id = as_i64(&step, "step_id").to_string();

    let rerun = run_audit(&db, ["step", "end", "--step-id", step_id.as_str(), "--status", "running"]);
    assert!(!rerun.status.success());

    let bad_slot = run_audit(&db, [
        "signature", "latest", "--name", "restic", "--slot", "upstream",
    ]);
    assert!(!bad_slot.status.success());

    let bad_id = run_audit(&db, ["run", "show", "--run-id", "not-a-ulid"]);
    assert!(!bad_id.status.success());

    run_json(&db, ["run", "end", "--run-id", run_id.as_str(), "--status", "failed"]);
    let twice = run_audit(&db, ["run", "end", "--run-id", run_id.as_str(), "--status", "success"]);
    assert!(!twice.status.success());

    let shown = run_json(&db, ["run", "show", "--run-id", run_id.as_str()]);
    assert_eq!(shown["run"]["status"], "failed");
    assert_eq!(shown["steps"][0]["status"], "failed");
}

// Test IDs: TCLI-005
#[test]
fn health_and_integrity_check_report_on_the_ledger() {
    let root = temp_dir();
    let db = root.path().join("audit.sqlite3");

    for (name, status) in [("manifest", "success"), ("git_pull", "failed")] {
        let begin = run_json(&db, ["run", "begin", "--name", name]);
        let run_id = as_str(&begin, "run_id").to_string();
        run_json(&db, ["run", "end", "--run-id", run_id.as_str(), "--status", status]);
    }

    let health = run_json(&db, ["health", "--window-hours", "1"]);
    assert_eq!(health["healthy"], false);
    let jobs = health["jobs"].as_array().cloned().unwrap_or_default();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["name"], "git_pull");
    assert_eq!(jobs[0]["failures_in_window"], 1);
    assert_eq!(jobs[1]["name"], "manifest");
    assert_eq!(jobs[1]["last_ok"], true);

    let report = run_json(&db, ["db", "integrity-check"]);
    assert_eq!(report["clean"], true);
    assert_eq!(as_i64(&report, "schema_version"), 6);
}

#[test]
fn database_path_falls_back_to_environment() {
    let root = temp_dir();
    let db = root.path().join("from-env.sqlite3");

    let output = Command::new(env!("CARGO_BIN_EXE_backup-audit"))
        .args(["migrate", "up"])
        .env("BACKUP_AUDIT_DB", &db)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute backup-audit binary: {err}"));
    let up = parse_success(&output);

    assert_eq!(as_str(&up, "source"), "embedded");
    assert_eq!(as_i64(&up, "after_version"), 6);
    assert!(db.exists(), "store should be created at BACKUP_AUDIT_DB");
}
