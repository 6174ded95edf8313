use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use backup_audit_core::{unix_now, RunId, Signature, SignatureSlot, Status, StepId};
use backup_audit_store_sqlite::{
    audit_schema_migrations, AuditLedger, MigrationSet, SqliteStore, StoreConfig,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "backup-audit")]
#[command(about = "Backup job audit ledger and schema migrations")]
struct Cli {
    #[arg(long, env = "BACKUP_AUDIT_DB", default_value = "./backup_audit.sqlite3")]
    db: PathBuf,

    /// How long a command waits for another writer before giving up.
    #[arg(long, env = "BACKUP_AUDIT_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Migrate {
        #[command(subcommand)]
        command: Box<MigrateCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Run {
        #[command(subcommand)]
        command: Box<RunCommand>,
    },
    Step {
        #[command(subcommand)]
        command: Box<StepCommand>,
    },
    Signature {
        #[command(subcommand)]
        command: Box<SignatureCommand>,
    },
    Health(HealthArgs),
}

#[derive(Debug, Subcommand)]
enum MigrateCommand {
    Up(MigrateUpArgs),
    Down(MigrateDownArgs),
    Status(MigrationSourceArgs),
}

#[derive(Debug, Args)]
struct MigrationSourceArgs {
    /// Directory of `NNNN_name[.up|.down].sql` scripts; defaults to the audit schema.
    #[arg(long)]
    dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MigrateUpArgs {
    #[arg(long)]
    to: Option<i64>,
    #[command(flatten)]
    source: MigrationSourceArgs,
}

#[derive(Debug, Args)]
struct MigrateDownArgs {
    #[arg(long)]
    to: i64,
    #[command(flatten)]
    source: MigrationSourceArgs,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    IntegrityCheck,
}

#[derive(Debug, Subcommand)]
enum RunCommand {
    Begin(RunBeginArgs),
    End(RunEndArgs),
    Show(RunShowArgs),
    List(RunListArgs),
}

#[derive(Debug, Args)]
struct RunBeginArgs {
    #[arg(long)]
    name: Option<String>,
    /// Free-form JSON object stored with the run.
    #[arg(long)]
    meta: Option<String>,
}

#[derive(Debug, Args)]
struct RunEndArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long, value_parser = parse_status)]
    status: Status,
    #[arg(long)]
    output_path: Option<String>,
}

#[derive(Debug, Args)]
struct RunShowArgs {
    #[arg(long)]
    run_id: RunId,
}

#[derive(Debug, Args)]
struct RunListArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Subcommand)]
enum StepCommand {
    Begin(StepBeginArgs),
    End(StepEndArgs),
}

#[derive(Debug, Args)]
struct StepBeginArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct StepEndArgs {
    #[arg(long)]
    step_id: i64,
    #[arg(long, value_parser = parse_status)]
    status: Status,
    #[arg(long)]
    message: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SignatureCommand {
    Set(SignatureSetArgs),
    Latest(SignatureLatestArgs),
    Check(SignatureCheckArgs),
}

#[derive(Debug, Args)]
struct SignatureSetArgs {
    #[arg(long)]
    run_id: RunId,
    #[arg(long, value_parser = parse_slot)]
    slot: SignatureSlot,
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct SignatureLatestArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = parse_slot)]
    slot: SignatureSlot,
}

#[derive(Debug, Args)]
struct SignatureCheckArgs {
    #[arg(long)]
    name: String,
    #[arg(long, value_parser = parse_slot)]
    slot: SignatureSlot,
    #[arg(long)]
    json: String,
}

#[derive(Debug, Args)]
struct HealthArgs {
    #[arg(long, default_value_t = 24)]
    window_hours: u64,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("invalid log level: {log_level}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config =
        StoreConfig::new(&cli.db).with_busy_timeout(Duration::from_millis(cli.busy_timeout_ms));
    match cli.command {
        Command::Migrate { command } => {
            let mut store = open_store(&config)?;
            run_migrate(*command, &mut store)
        }
        Command::Db { command } => {
            let store = open_store(&config)?;
            run_db(*command, &store)
        }
        Command::Run { command } => run_run(*command, &mut open_ledger(&config)?),
        Command::Step { command } => run_step(*command, &mut open_ledger(&config)?),
        Command::Signature { command } => run_signature(*command, &mut open_ledger(&config)?),
        Command::Health(args) => run_health(&args, &open_ledger(&config)?),
    }
}

fn open_store(config: &StoreConfig) -> Result<SqliteStore> {
    SqliteStore::open_with(config)
        .with_context(|| format!("failed to open audit store {}", config.path.display()))
}

fn open_ledger(config: &StoreConfig) -> Result<AuditLedger> {
    AuditLedger::open(config)
        .with_context(|| format!("failed to open audit ledger {}", config.path.display()))
}

fn migration_set(source: &MigrationSourceArgs) -> Result<(MigrationSet, Value)> {
    match source.dir.as_deref() {
        Some(dir) => {
            let set = MigrationSet::from_dir(dir)
                .with_context(|| format!("failed to load migrations from {}", dir.display()))?;
            Ok((set, json!(dir.display().to_string())))
        }
        None => Ok((audit_schema_migrations(), json!("embedded"))),
    }
}

fn run_migrate(command: MigrateCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        MigrateCommand::Up(args) => run_migrate_up(&args, store),
        MigrateCommand::Down(args) => run_migrate_down(&args, store),
        MigrateCommand::Status(args) => run_migrate_status(&args, store),
    }
}

fn run_migrate_up(args: &MigrateUpArgs, store: &mut SqliteStore) -> Result<()> {
    let (set, source) = migration_set(&args.source)?;
    let before = store.schema_version()?;
    let applied = store.apply_pending(&set, args.to).with_context(|| {
        format!("migrate up stopped; store left at last committed version (was {before})")
    })?;
    let after = store.schema_version()?;
    info!(before, after, applied, "migrate up finished");

    emit_json(json!({
        "source": source,
        "before_version": before,
        "after_version": after,
        "applied_count": applied,
        "target_version": args.to.unwrap_or_else(|| set.latest_version()),
    }))
}

fn run_migrate_down(args: &MigrateDownArgs, store: &mut SqliteStore) -> Result<()> {
    let (set, source) = migration_set(&args.source)?;
    let before = store.schema_version()?;
    let reverted = store
        .rollback_to(&set, args.to)
        .with_context(|| format!("migrate down to {} failed", args.to))?;
    let after = store.schema_version()?;
    info!(before, after, reverted, "migrate down finished");

    emit_json(json!({
        "source": source,
        "before_version": before,
        "after_version": after,
        "reverted_count": reverted,
    }))
}

fn run_migrate_status(args: &MigrationSourceArgs, store: &SqliteStore) -> Result<()> {
    let (set, source) = migration_set(args)?;
    let status = store.migration_status(&set)?;
    let mut value = serde_json::to_value(&status).context("failed to serialize migration status")?;
    if let Value::Object(object) = &mut value {
        object.insert("source".to_string(), source);
        object.insert("up_to_date".to_string(), json!(status.pending.is_empty()));
    }
    emit_json(value)
}

fn run_db(command: DbCommand, store: &SqliteStore) -> Result<()> {
    match command {
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            let mut value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            if let Value::Object(object) = &mut value {
                object.insert("clean".to_string(), json!(report.is_clean()));
            }
            emit_json(value)
        }
    }
}

fn run_run(command: RunCommand, ledger: &mut AuditLedger) -> Result<()> {
    match command {
        RunCommand::Begin(args) => {
            let meta = match args.meta.as_deref() {
                Some(raw) => parse_json_arg("--meta", raw)?,
                None => json!({}),
            };
            let run_id = ledger.begin_run(args.name.as_deref(), &meta)?;
            let run = ledger.get_run(run_id)?;
            emit_json(json!({
                "run_id": run_id.to_string(),
                "name": run.name,
                "started_at": rfc3339(run.started_at)?,
            }))
        }
        RunCommand::End(args) => {
            ledger.end_run(args.run_id, args.status, args.output_path.as_deref())?;
            emit_run(ledger, args.run_id)
        }
        RunCommand::Show(args) => emit_run(ledger, args.run_id),
        RunCommand::List(args) => {
            let runs = ledger.recent_runs(args.limit)?;
            emit_json(json!({ "runs": serde_json::to_value(&runs)? }))
        }
    }
}

fn emit_run(ledger: &AuditLedger, run_id: RunId) -> Result<()> {
    let run = ledger.get_run(run_id)?;
    let steps = ledger.steps_for(run_id)?;
    emit_json(json!({
        "run": serde_json::to_value(&run).context("failed to serialize run")?,
        "duration_secs": run.duration_secs(),
        "steps": serde_json::to_value(&steps).context("failed to serialize steps")?,
    }))
}

fn run_step(command: StepCommand, ledger: &mut AuditLedger) -> Result<()> {
    match command {
        StepCommand::Begin(args) => {
            let step_id = ledger.begin_step(args.run_id, &args.name)?;
            emit_json(json!({
                "step_id": step_id.0,
                "run_id": args.run_id.to_string(),
                "name": args.name,
            }))
        }
        StepCommand::End(args) => {
            ledger.end_step(StepId(args.step_id), args.status, args.message.as_deref())?;
            emit_json(json!({
                "step_id": args.step_id,
                "status": args.status.as_str(),
            }))
        }
    }
}

fn run_signature(command: SignatureCommand, ledger: &mut AuditLedger) -> Result<()> {
    match command {
        SignatureCommand::Set(args) => {
            let value = parse_json_arg("--json", &args.json)?;
            let signature = ledger.set_signature(args.run_id, args.slot, &value)?;
            emit_json(json!({
                "run_id": args.run_id.to_string(),
                "slot": args.slot.as_str(),
                "signature": serde_json::to_value(&signature)?,
            }))
        }
        SignatureCommand::Latest(args) => {
            let signature = ledger.latest_successful_signature(&args.name, args.slot)?;
            emit_json(json!({
                "name": args.name,
                "slot": args.slot.as_str(),
                "signature": serde_json::to_value(&signature)?,
            }))
        }
        SignatureCommand::Check(args) => {
            let current = Signature::from_json_text(&args.json);
            let previous = ledger.latest_successful_signature(&args.name, args.slot)?;
            let decision = ledger.check_unchanged(&args.name, args.slot, &current)?;
            emit_json(json!({
                "name": args.name,
                "slot": args.slot.as_str(),
                "decision": decision.as_str(),
                "should_skip": decision.should_skip(),
                "current_hash": current.hash,
                "previous_hash": previous.map(|signature| signature.hash),
            }))
        }
    }
}

fn run_health(args: &HealthArgs, ledger: &AuditLedger) -> Result<()> {
    let now = unix_now();
    let window = Duration::from_secs(args.window_hours.saturating_mul(3_600));
    let jobs = ledger.job_health(now, window)?;
    emit_json(json!({
        "generated_at": rfc3339(now)?,
        "window_hours": args.window_hours,
        "healthy": jobs.iter().all(|job| job.last_ok),
        "jobs": serde_json::to_value(&jobs).context("failed to serialize job health")?,
    }))
}

fn parse_json_arg(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} must be valid JSON"))
}

fn parse_status(raw: &str) -> Result<Status, String> {
    Status::parse(raw).ok_or_else(|| {
        format!("unknown status {raw}; expected one of running, success, failed, skipped")
    })
}

fn parse_slot(raw: &str) -> Result<SignatureSlot, String> {
    SignatureSlot::parse(raw).ok_or_else(|| {
        let known = SignatureSlot::ALL.map(SignatureSlot::as_str).join(", ");
        format!("unknown signature slot {raw}; expected one of {known}")
    })
}

fn rfc3339(unix_seconds: i64) -> Result<String> {
    let timestamp = OffsetDateTime::from_unix_timestamp(unix_seconds)
        .with_context(|| format!("timestamp out of range: {unix_seconds}"))?;
    timestamp.format(&Rfc3339).context("failed to format timestamp")
}
