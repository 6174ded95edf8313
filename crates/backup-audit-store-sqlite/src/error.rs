use std::path::PathBuf;

use backup_audit_core::CoreError;
use rusqlite::ErrorCode;

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("audit schema is at version {current}; version {required} or later is required (run `migrate up`)")]
    SchemaOutdated { current: i64, required: i64 },
    #[error("migration {version:04} ({name}) failed: {reason}")]
    MigrationFailed { version: i64, name: String, reason: String },
    #[error("invalid migration set: {0}")]
    InvalidMigrationSet(String),
    #[error("shadow rebuild of {table} copied {copied} of {expected} rows")]
    RebuildMismatch { table: String, expected: i64, copied: i64 },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Core(#[from] CoreError),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl AuditError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub(crate) fn migration_failed(version: i64, name: &str, err: &Self) -> Self {
        Self::MigrationFailed { version, name: name.to_string(), reason: err.to_string() }
    }
}

impl From<rusqlite::Error> for AuditError {
    fn from(err: rusqlite::Error) -> Self {
        let unavailable = matches!(
            err.sqlite_error_code(),
            Some(
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::ReadOnly
                    | ErrorCode::SystemIoFailure
            )
        );

        if unavailable {
            Self::StoreUnavailable(err.to_string())
        } else {
            Self::Sqlite(err)
        }
    }
}
