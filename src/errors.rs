//! Typed error hierarchy for the dossier engine.
//!
//! - `PlanError`: plan validation failures, rejected at submission
//! - `CallError`: one completion call, after retry discipline has run
//! - `RunError`: what can stop an operation or phase from finishing
//! - `JobError`: job lifecycle operations exposed to callers
//!
//! Phase failures and per-item failures are not errors here: they are
//! recorded as data on the phase outcome so partial progress stays visible.

use thiserror::Error;

/// Errors raised while resolving an execution plan into a dependency graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Cycle detected in phase dependencies. Involved phases: {phases:?}")]
    CyclicDependency { phases: Vec<String> },

    #[error("Phase {phase} references unknown {kind} '{reference}'")]
    UnknownReference {
        phase: String,
        kind: ReferenceKind,
        reference: String,
    },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase {phase} must name exactly one of `operation` or `chain`")]
    InvalidPhaseKind { phase: String },

    #[error("Phase {phase} has scope=per_item but no item source")]
    MissingItemSource { phase: String },

    #[error("Phase {phase} takes items from phase {source_phase}, which is not one of its dependencies")]
    ItemSourceNotDependency { phase: String, source_phase: String },

    #[error("Invalid phase id '{0}': expected a number such as 1 or 1.5")]
    InvalidPhaseId(String),

    #[error("Chain '{chain}' has no operations")]
    EmptyChain { chain: String },
}

/// What kind of thing an unknown reference was supposed to point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Operation,
    Chain,
    Phase,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Operation => write!(f, "operation"),
            ReferenceKind::Chain => write!(f, "chain"),
            ReferenceKind::Phase => write!(f, "phase"),
        }
    }
}

/// Errors from a single completion call.
///
/// `Transient` and `Stalled` are retried inside the caller; what escapes the
/// caller is `Permanent`, `RetriesExhausted` or `Cancelled`.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("Transient completion failure: {reason}")]
    Transient {
        reason: String,
        /// Text already streamed before the failure, if any.
        partial: Option<String>,
    },

    #[error("Completion request rejected: {0}")]
    Permanent(String),

    #[error("No progress for {stall_secs}s while waiting on the completion service")]
    Stalled {
        stall_secs: u64,
        partial: Option<String>,
    },

    #[error("Completion failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Cancellation requested")]
    Cancelled,
}

impl CallError {
    /// Check if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Stalled { .. })
    }

    /// Text received before the failure, if the service sent any.
    pub fn partial_text(&self) -> Option<&str> {
        match self {
            Self::Transient { partial, .. } | Self::Stalled { partial, .. } => partial
                .as_deref()
                .filter(|text| !text.trim().is_empty()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failure of a unit of work inside a running job.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RunError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Call(CallError::Cancelled))
    }
}

/// Errors from the job lifecycle API.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Plan validation failed: {0}")]
    Validation(#[from] PlanError),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error("Document {document_id} is in use by active job {job_id}")]
    DocumentInUse { document_id: String, job_id: String },

    #[error("Job {job_id} is {status} and cannot be {action}")]
    InvalidTransition {
        job_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Job store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_error_cycle_lists_phases() {
        let err = PlanError::CyclicDependency {
            phases: vec!["1".to_string(), "2".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Cycle"));
        assert!(msg.contains("\"2\""));
    }

    #[test]
    fn unknown_reference_names_kind() {
        let err = PlanError::UnknownReference {
            phase: "3".to_string(),
            kind: ReferenceKind::Chain,
            reference: "missing".to_string(),
        };
        assert_eq!(err.to_string(), "Phase 3 references unknown chain 'missing'");
    }

    #[test]
    fn call_error_retryable_classification() {
        let transient = CallError::Transient {
            reason: "rate limited".into(),
            partial: None,
        };
        let stalled = CallError::Stalled {
            stall_secs: 30,
            partial: None,
        };
        assert!(transient.is_retryable());
        assert!(stalled.is_retryable());
        assert!(!CallError::Permanent("bad request".into()).is_retryable());
        assert!(!CallError::Cancelled.is_retryable());
    }

    #[test]
    fn partial_text_ignores_blank_output() {
        let blank = CallError::Transient {
            reason: "reset".into(),
            partial: Some("   ".into()),
        };
        assert!(blank.partial_text().is_none());

        let some = CallError::Stalled {
            stall_secs: 5,
            partial: Some("half an answer".into()),
        };
        assert_eq!(some.partial_text(), Some("half an answer"));
    }

    #[test]
    fn job_error_converts_from_plan_error() {
        let err: JobError = PlanError::DuplicatePhase("1".into()).into();
        assert!(matches!(err, JobError::Validation(PlanError::DuplicatePhase(_))));
    }

    #[test]
    fn run_error_detects_cancellation() {
        assert!(RunError::from(CallError::Cancelled).is_cancelled());
        assert!(!RunError::from(CallError::Permanent("x".into())).is_cancelled());
        assert!(!RunError::from(anyhow::anyhow!("disk full")).is_cancelled());
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PlanError::DuplicatePhase("1".into()));
        assert_std_error(&CallError::Cancelled);
        assert_std_error(&JobError::JobNotFound("x".into()));
    }
}
