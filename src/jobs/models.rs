use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::completion::CallResult;
use crate::dag::state::{DagState, PhaseOutcome};
use crate::plan::{ExecutionPlan, PhaseId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DagState> for JobStatus {
    fn from(state: DagState) -> Self {
        match state {
            DagState::Idle => Self::Pending,
            DagState::Running => Self::Running,
            DagState::Completed => Self::Completed,
            DagState::Failed => Self::Failed,
            DagState::Cancelled => Self::Cancelled,
        }
    }
}

/// A job: one execution of a plan snapshot against a set of documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub plan: ExecutionPlan,
    pub document_ids: Vec<String>,
    pub status: JobStatus,
    pub fail_fast: bool,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last time a checkpoint or status change was written
    pub last_progress_at: DateTime<Utc>,
    /// Liveness stamp refreshed by the process running the job. Cleared
    /// when the job reaches a terminal status.
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(plan: ExecutionPlan, document_ids: Vec<String>, fail_fast: bool) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plan,
            document_ids,
            status: JobStatus::Pending,
            fail_fast,
            cancel_requested: false,
            error: None,
            created_at: now,
            updated_at: now,
            last_progress_at: now,
            heartbeat_at: None,
        }
    }

    /// Whether some process refreshed the heartbeat within `timeout` of `now`.
    pub fn has_live_worker(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        self.heartbeat_at.is_some_and(|beat| {
            now.signed_duration_since(beat)
                .to_std()
                .map(|age| age < timeout)
                .unwrap_or(true)
        })
    }
}

/// Unit of idempotent resumability: (phase, operation, pass, item).
///
/// `operation` is the operation key for single-operation phases,
/// `"{step}.{key}"` for chain steps and `"synthesis"` for per-item
/// synthesis. `item` is empty for aggregated phases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub phase: String,
    pub operation: String,
    pub pass: u32,
    pub item: String,
}

impl Coordinate {
    pub fn new(phase: &PhaseId, operation: &str, pass: u32, item: Option<&str>) -> Self {
        Self {
            phase: phase.to_string(),
            operation: operation.to_string(),
            pass,
            item: item.unwrap_or_default().to_string(),
        }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.phase, self.operation, self.pass)?;
        if !self.item.is_empty() {
            write!(f, "/{}", self.item)?;
        }
        Ok(())
    }
}

/// A persisted call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub coordinate: Coordinate,
    pub result: CallResult,
    /// SHA-256 of the prompt the result answered
    pub input_hash: String,
    pub recorded_at: DateTime<Utc>,
}

/// Everything stored for a job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job: JobRecord,
    pub checkpoints: Vec<Checkpoint>,
    pub phase_results: Vec<PhaseOutcome>,
}

impl JobSnapshot {
    pub fn checkpoint_map(&self) -> HashMap<Coordinate, Checkpoint> {
        self.checkpoints
            .iter()
            .map(|c| (c.coordinate.clone(), c.clone()))
            .collect()
    }
}

/// An input document. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub content_hash: String,
    pub char_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: &str, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            content: content.to_string(),
            content_hash: hex::encode(Sha256::digest(content.as_bytes())),
            char_count: content.chars().count(),
            created_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            content_hash: self.content_hash.clone(),
            char_count: self.char_count,
            created_at: self.created_at,
        }
    }
}

/// Document metadata without the text, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub content_hash: String,
    pub char_count: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_status_from_dag_state() {
        assert_eq!(JobStatus::from(DagState::Completed), JobStatus::Completed);
        assert_eq!(JobStatus::from(DagState::Cancelled), JobStatus::Cancelled);
    }

    #[test]
    fn coordinate_display() {
        let aggregated = Coordinate::new(&PhaseId::from(1.5), "survey", 2, None);
        assert_eq!(aggregated.to_string(), "1.5/survey/2");
        let item = Coordinate::new(&PhaseId::from(2.0), "0.outline", 1, Some("doc-a"));
        assert_eq!(item.to_string(), "2/0.outline/1/doc-a");
    }

    #[test]
    fn document_hashes_content() {
        let doc = Document::new("Essay", "héllo");
        assert_eq!(doc.char_count, 5);
        assert_eq!(doc.content_hash.len(), 64);
        assert_eq!(doc.summary().title, "Essay");
    }
}
