//! Job record projection and identifier canonicalization.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{ColumnNames, Row};

/// Why a raw identifier could not be turned into a [`JobId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobIdError {
    #[error("job id is empty")]
    Empty,

    #[error("job id contains a control character at byte {position}")]
    ControlCharacter { position: usize },

    #[error("job id contains unsupported character {ch:?}")]
    InvalidCharacter { ch: char },
}

/// Canonical job identifier.
///
/// Ids end up in filesystem paths, storage keys, and REST filters, so only
/// `[A-Za-z0-9_-]` is accepted. Hyphenated UUIDs are folded to lowercase for
/// paths and keys; store filters use the id exactly as the row holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    canonical: String,
    stored: String,
}

impl JobId {
    pub fn parse(raw: &str) -> Result<Self, JobIdError> {
        if raw.is_empty() {
            return Err(JobIdError::Empty);
        }

        if let Some((position, _)) = raw.char_indices().find(|(_, c)| c.is_control()) {
            return Err(JobIdError::ControlCharacter { position });
        }

        if let Some(ch) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(JobIdError::InvalidCharacter { ch });
        }

        let canonical = match Uuid::try_parse(raw) {
            Ok(uuid) if raw.len() == 36 => uuid.hyphenated().to_string(),
            _ => raw.to_string(),
        };
        Ok(Self {
            canonical,
            stored: raw.to_string(),
        })
    }

    /// Canonical form, used for paths, storage keys and logs.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The id as the job store holds it, used in row filters.
    pub fn stored(&self) -> &str {
        &self.stored
    }

    /// First eight characters, used for default trigger tokens.
    pub fn short(&self) -> &str {
        let end = self.canonical.len().min(8);
        &self.canonical[..end]
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Status column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Training,
    Completed,
    Failed,
    /// Legacy value written by older producers. Never acted on.
    Idle,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Training => "training",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Idle => "idle",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => JobStatus::Queued,
            "training" => JobStatus::Training,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "idle" => JobStatus::Idle,
            _ => JobStatus::Unknown,
        }
    }

    /// Whether this worker ever acts on a job in this status. These are
    /// also the statuses that occupy an owner's single active slot.
    pub fn is_actionable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Training)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The narrow projection of a job row this worker reads.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    /// Raw id as stored. Use [`JobRecord::job_id`] before acting on it.
    pub id: String,
    pub owner_id: Option<String>,
    pub status: JobStatus,
    pub progress: Option<i64>,
    pub error_message: Option<String>,
    pub image_count: Option<i64>,
    pub artifact_reference: Option<String>,
    pub trigger_token: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Legacy column names read when the configured column is absent.
const LEGACY_OWNER_COLUMNS: &[&str] = &["owner_id", "user_id"];
const LEGACY_ARTIFACT_COLUMNS: &[&str] = &["artifact_reference", "artifact_path"];
const TRIGGER_COLUMNS: &[&str] = &["trigger_token", "trigger_word"];

impl JobRecord {
    /// Builds a record from a store row. Returns `None` when the row has no id
    /// or no status.
    pub fn from_row(row: &Row, names: &ColumnNames) -> Option<Self> {
        let id = match row.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let status = JobStatus::parse_lossy(row.get("status")?.as_str()?);

        Some(Self {
            id,
            owner_id: first_text(row, &names.owner, LEGACY_OWNER_COLUMNS),
            status,
            progress: row.get("progress").and_then(Value::as_i64),
            error_message: text(row, "error_message"),
            image_count: row.get("image_count").and_then(Value::as_i64),
            artifact_reference: first_text(
                row,
                &names.artifact_reference,
                LEGACY_ARTIFACT_COLUMNS,
            ),
            trigger_token: TRIGGER_COLUMNS.iter().find_map(|c| text(row, c)),
            created_at: row.get("created_at").and_then(parse_timestamp),
            updated_at: row.get("updated_at").and_then(parse_timestamp),
        })
    }

    pub fn job_id(&self) -> Result<JobId, JobIdError> {
        JobId::parse(&self.id)
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(row: &Row, preferred: &str, fallbacks: &[&str]) -> Option<String> {
    text(row, preferred).or_else(|| fallbacks.iter().find_map(|c| text(row, c)))
}

/// Parses RFC 3339 timestamps, falling back to zone-less timestamps read as UTC.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}
