//! Execution state for a job run.
//!
//! This module provides the data the runner reports upward: per-item and
//! per-phase outcomes, the job summary, and the events emitted while a
//! job is running.

use crate::dag::scheduler::PhaseStatus;
use crate::plan::PhaseId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Overall state of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DagState {
    /// Submitted but not started
    #[default]
    Idle,
    Running,
    /// Every phase terminal and none failed or blocked
    Completed,
    /// At least one phase failed or was blocked
    Failed,
    /// Cancelled before every phase launched
    Cancelled,
}

impl DagState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Token accounting summed across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    Failed,
}

/// Result of one item of a per-item phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub key: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(with = "duration_serde", default)]
    pub duration: Duration,
}

impl ItemOutcome {
    pub fn success(key: &str, output: String, tokens: TokenUsage, duration: Duration) -> Self {
        Self {
            key: key.to_string(),
            status: ItemStatus::Completed,
            output: Some(output),
            error: None,
            tokens,
            duration,
        }
    }

    pub fn failure(key: &str, error: &str, duration: Duration) -> Self {
        Self {
            key: key.to_string(),
            status: ItemStatus::Failed,
            output: None,
            error: Some(error.to_string()),
            tokens: TokenUsage::default(),
            duration,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

/// Output of one step of a chain (or the single operation of a phase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub operation: String,
    pub text: String,
}

/// Result of running one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: PhaseId,
    pub name: String,
    /// Operation or chain key backing the phase
    #[serde(default)]
    pub operation: String,
    pub status: PhaseStatus,
    /// Text handed to dependents. For per-item phases this is the synthesis
    /// output when one ran, otherwise `None` and dependents read `items`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Per-step outputs of an aggregated phase, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ItemOutcome>,
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Calls issued to the completion service
    #[serde(default)]
    pub calls: u32,
    /// Coordinates satisfied from checkpoints instead of a new call
    #[serde(default)]
    pub reused: u32,
    /// Reused checkpoints whose recorded input no longer matches the prompt
    #[serde(default)]
    pub stale_checkpoints: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_serde", default)]
    pub duration: Duration,
}

impl PhaseOutcome {
    /// An outcome with no output yet, used as the base for the others.
    pub fn new(phase: &PhaseId, name: &str, status: PhaseStatus) -> Self {
        Self {
            phase: phase.clone(),
            name: name.to_string(),
            operation: String::new(),
            status,
            output: None,
            steps: Vec::new(),
            items: Vec::new(),
            tokens: TokenUsage::default(),
            calls: 0,
            reused: 0,
            stale_checkpoints: 0,
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failure(phase: &PhaseId, name: &str, error: &str, duration: Duration) -> Self {
        Self {
            error: Some(error.to_string()),
            duration,
            ..Self::new(
                phase,
                name,
                PhaseStatus::Failed {
                    error: error.to_string(),
                },
            )
        }
    }

    pub fn skipped(phase: &PhaseId, name: &str) -> Self {
        Self::new(phase, name, PhaseStatus::Skipped)
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = operation.to_string();
        self
    }

    pub fn successful_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| i.succeeded())
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.succeeded())
    }
}

/// Summary of a job run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub state: DagState,
    pub total_phases: usize,
    pub completed: usize,
    pub completed_with_errors: usize,
    pub failed: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub tokens: TokenUsage,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Outcomes keyed by phase id string
    #[serde(default)]
    pub phase_results: BTreeMap<String, PhaseOutcome>,
}

impl JobSummary {
    pub fn new(total_phases: usize) -> Self {
        Self {
            total_phases,
            ..Default::default()
        }
    }

    pub fn add_outcome(&mut self, outcome: PhaseOutcome) {
        match outcome.status {
            PhaseStatus::Completed => self.completed += 1,
            PhaseStatus::CompletedWithErrors { .. } => self.completed_with_errors += 1,
            PhaseStatus::Failed { .. } => self.failed += 1,
            PhaseStatus::Blocked { .. } => self.blocked += 1,
            PhaseStatus::Skipped => self.skipped += 1,
            PhaseStatus::Cancelled => self.cancelled += 1,
            PhaseStatus::Pending | PhaseStatus::Running { .. } => {}
        }
        self.tokens.add(outcome.tokens);
        self.phase_results
            .insert(outcome.phase.to_string(), outcome);
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.cancelled == 0
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_phases == 0 {
            return 100.0;
        }
        let done = self.completed + self.completed_with_errors + self.skipped;
        (done as f64 / self.total_phases as f64) * 100.0
    }
}

/// Events emitted while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    Started {
        phase: PhaseId,
        wave_position: usize,
    },
    ItemCompleted {
        phase: PhaseId,
        item: String,
        success: bool,
    },
    Completed {
        phase: PhaseId,
        status: PhaseStatus,
    },
    Blocked {
        phase: PhaseId,
        by: String,
    },
    Cancelled {
        phase: PhaseId,
    },
    JobCompleted {
        state: DagState,
    },
}

impl PhaseEvent {
    pub fn phase(&self) -> Option<&PhaseId> {
        match self {
            PhaseEvent::Started { phase, .. }
            | PhaseEvent::ItemCompleted { phase, .. }
            | PhaseEvent::Completed { phase, .. }
            | PhaseEvent::Blocked { phase, .. }
            | PhaseEvent::Cancelled { phase } => Some(phase),
            PhaseEvent::JobCompleted { .. } => None,
        }
    }
}

/// Tracks execution timing. Uses the tokio clock so paused-time tests see
/// consistent durations.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
