//! Dependency-graph scheduling of plan phases.
//!
//! ## Architecture
//!
//! 1. **Builder** - validates a plan and resolves it into a [`DependencyGraph`]
//! 2. **Scheduler** - tracks phase statuses and computes the launch frontier
//! 3. **Executor** - the [`WorkflowRunner`], which launches phases on the
//!    job-wide phase pool and records their outcomes
//!
//! ## Example
//!
//! ```no_run
//! use dossier::dag::{DagConfig, DagScheduler, resolve};
//! use dossier::plan::{ExecutionPlan, OperationDef, PlanPhase};
//!
//! # fn example() -> anyhow::Result<()> {
//! let plan = ExecutionPlan::default()
//!     .with_operation("survey", OperationDef::new("Survey the text.", &[]))
//!     .with_phase(PlanPhase::operation(1.0, "survey", &[]))
//!     .with_phase(PlanPhase::operation(1.5, "survey", &[]))
//!     .with_phase(PlanPhase::operation(2.0, "survey", &[1.0, 1.5]));
//!
//! let graph = resolve(&plan)?;
//! // Wave 0: [1, 1.5] - no dependencies
//! // Wave 1: [2] - waits for both
//! assert_eq!(graph.compute_waves().len(), 2);
//!
//! let scheduler = DagScheduler::new(graph, DagConfig::default());
//! assert_eq!(scheduler.ready_phases(), vec![0, 1]);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod executor;
pub mod scheduler;
pub mod state;

pub use builder::{
    ChainStep, DagBuilder, DependencyGraph, PhaseIndex, PhaseKind, PhaseScope, ResolvedPhase,
    resolve,
};
pub use executor::WorkflowRunner;
pub use scheduler::{DagConfig, DagScheduler, PhaseNode, PhaseStatus};
pub use state::{
    DagState, ExecutionTimer, ItemOutcome, ItemStatus, JobSummary, PhaseEvent, PhaseOutcome,
    StepOutput, TokenUsage,
};
