use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run id from its canonical ULID text.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the text is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| CoreError::Validation(format!("invalid run id {raw}: {err}")))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Storage row id of a step; allocated by the store, ordered by insertion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StepId(pub i64);

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state shared by runs and steps. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Running,
    Success,
    Failed,
    Skipped,
}

impl Status {
    pub const TERMINAL: [Self; 3] = [Self::Success, Self::Failed, Self::Skipped];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Health view of a finished job: a skipped run did nothing wrong.
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named signature slots carried by a run.
///
/// `Input`/`Output` describe what the run consumed and produced. The remaining
/// four support comparing upstream state and job results across runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignatureSlot {
    Input,
    Output,
    CurrentUpstream,
    PreviousUpstream,
    PreviousJobResult,
    JobResult,
}

impl SignatureSlot {
    pub const ALL: [Self; 6] = [
        Self::Input,
        Self::Output,
        Self::CurrentUpstream,
        Self::PreviousUpstream,
        Self::PreviousJobResult,
        Self::JobResult,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::CurrentUpstream => "current_upstream",
            Self::PreviousUpstream => "previous_upstream",
            Self::PreviousJobResult => "previous_job_result",
            Self::JobResult => "job_result",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.as_str() == value)
    }
}

impl Display for SignatureSlot {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical JSON text of a signature together with its SHA-256 digest.
///
/// Two signatures describe the same content exactly when their hashes are
/// equal; callers compare hashes, never the raw JSON they started from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Signature {
    pub canonical_json: String,
    pub hash: String,
}

impl Signature {
    /// Canonicalize a JSON value (RFC 8785) and digest it.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the value cannot be canonicalized.
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        let canonical_json = canonicalize_value(value)?;
        let hash = sha256_hex(&canonical_json);
        Ok(Self { canonical_json, hash })
    }

    /// Build a signature from stored or caller-supplied text.
    ///
    /// Text that does not parse as JSON is kept verbatim and hashed as-is, which
    /// is how rows written before canonicalization existed are handled.
    #[must_use]
    pub fn from_json_text(text: &str) -> Self {
        let canonical_json = canonicalize_json_text(text);
        let hash = sha256_hex(&canonical_json);
        Self { canonical_json, hash }
    }

    #[must_use]
    pub fn value(&self) -> Option<Value> {
        serde_json::from_str(&self.canonical_json).ok()
    }

    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.hash == other.hash
    }

    /// True when `hash` is the digest of the canonical form of `canonical_json`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        signature_hash_of_text(&self.canonical_json) == self.hash
    }
}

/// Canonical text for a JSON value: sorted keys, no insignificant whitespace.
///
/// # Errors
/// Returns [`CoreError::Validation`] when serialization fails.
pub fn canonicalize_value(value: &Value) -> Result<String, CoreError> {
    serde_jcs::to_string(value)
        .map_err(|err| CoreError::Validation(format!("failed to canonicalize JSON: {err}")))
}

/// Canonicalize JSON text, falling back to the raw text when it is not JSON.
#[must_use]
pub fn canonicalize_json_text(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => canonicalize_value(&value).unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}

#[must_use]
pub fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// `digest(canonicalize(text))`, the value every stored hash column must hold.
#[must_use]
pub fn signature_hash_of_text(text: &str) -> String {
    sha256_hex(&canonicalize_json_text(text))
}

/// Outcome of comparing a fresh signature against the last successful run's.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDecision {
    NoBaseline,
    Unchanged,
    Changed,
}

impl ChangeDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoBaseline => "no_baseline",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
        }
    }

    #[must_use]
    pub fn should_skip(self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

#[must_use]
pub fn compare_signatures(previous: Option<&Signature>, current: &Signature) -> ChangeDecision {
    match previous {
        None => ChangeDecision::NoBaseline,
        Some(previous) if previous.same_content(current) => ChangeDecision::Unchanged,
        Some(_) => ChangeDecision::Changed,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub name: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: Status,
    pub meta: Value,
    #[serde(default)]
    pub signatures: BTreeMap<SignatureSlot, Signature>,
    pub output_path: Option<String>,
}

impl RunRecord {
    #[must_use]
    pub fn signature(&self, slot: SignatureSlot) -> Option<&Signature> {
        self.signatures.get(&slot)
    }

    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at.map(|finished_at| finished_at - self.started_at)
    }

    /// Check the lifecycle and hash invariants of a loaded run.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] describing the first broken invariant.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_lifecycle("run", &self.run_id.to_string(), self.status, self.finished_at)?;

        for (slot, signature) in &self.signatures {
            if !signature.is_consistent() {
                return Err(CoreError::Validation(format!(
                    "run {} signature slot {slot} hash does not match its JSON",
                    self.run_id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    pub run_id: RunId,
    pub name: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: Status,
    pub message: Option<String>,
}

impl StepRecord {
    /// # Errors
    /// Returns [`CoreError::Validation`] when status and `finished_at` disagree.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_lifecycle("step", &self.step_id.to_string(), self.status, self.finished_at)
    }
}

fn validate_lifecycle(
    entity: &str,
    id: &str,
    status: Status,
    finished_at: Option<i64>,
) -> Result<(), CoreError> {
    match (status, finished_at) {
        (Status::Running, None) => Ok(()),
        (Status::Running, Some(_)) => Err(CoreError::Validation(format!(
            "{entity} {id} is running but has finished_at set"
        ))),
        (_, None) => Err(CoreError::Validation(format!(
            "{entity} {id} has terminal status {status} but no finished_at"
        ))),
        (_, Some(_)) => Ok(()),
    }
}

/// Per-job summary of the most recent run and recent failures.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JobHealth {
    pub name: String,
    pub last_run_id: RunId,
    pub last_status: Status,
    pub last_started_at: i64,
    pub last_ok: bool,
    pub failures_in_window: u32,
    pub last_duration_secs: Option<i64>,
}

#[must_use]
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
