//! Workflow runner: walks the dependency graph and runs phases in parallel.
//!
//! Phases launch as soon as their dependencies satisfy them, up to the
//! job-wide phase pool size. Results come back over a channel; each one is
//! persisted before the frontier is recomputed. Cancellation is checked
//! before every launch and never interrupts a running phase.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::dag::builder::{DependencyGraph, PhaseIndex, ResolvedPhase};
use crate::dag::scheduler::{DagConfig, DagScheduler, PhaseStatus};
use crate::dag::state::{ExecutionTimer, JobSummary, PhaseEvent, PhaseOutcome};
use crate::plan::PhaseId;
use crate::pool::WorkerPool;
use crate::runner::{PhaseRunner, RunContext};

/// Runs every phase of one job.
pub struct WorkflowRunner {
    ctx: RunContext,
    dag_config: DagConfig,
}

impl WorkflowRunner {
    pub fn new(ctx: RunContext, dag_config: DagConfig) -> Self {
        Self { ctx, dag_config }
    }

    /// Execute the graph.
    ///
    /// `previous` holds outcomes recorded by an earlier run of the same job;
    /// phases whose stored outcome satisfies dependents are reused instead
    /// of run again.
    pub async fn execute(
        &self,
        graph: DependencyGraph,
        previous: Vec<PhaseOutcome>,
    ) -> Result<JobSummary> {
        let timer = ExecutionTimer::start();
        let mut scheduler = DagScheduler::new(graph, self.dag_config.clone());
        let mut summary = JobSummary::new(scheduler.phase_count());

        let waves = scheduler.graph().compute_waves();
        info!(
            job_id = %self.ctx.job_id,
            phases = scheduler.phase_count(),
            waves = waves.len(),
            max_parallel = self.dag_config.max_parallel,
            fail_fast = self.dag_config.fail_fast,
            "Starting workflow"
        );

        let reusable: HashMap<PhaseId, PhaseOutcome> = previous
            .into_iter()
            .filter(|o| o.status.satisfies_dependents())
            .map(|o| (o.phase.clone(), o))
            .collect();

        let pool = WorkerPool::new("phases", self.dag_config.max_parallel);
        let runner = Arc::new(PhaseRunner::new(self.ctx.clone()));
        let (result_tx, mut result_rx) = mpsc::channel::<(PhaseIndex, PhaseOutcome)>(100);

        let mut outputs: HashMap<PhaseId, PhaseOutcome> = HashMap::new();
        let mut active_tasks: HashMap<PhaseIndex, JoinHandle<()>> = HashMap::new();
        let mut cancelled = false;
        let mut launched = 0usize;

        'outer: loop {
            if !cancelled && self.ctx.cancel.is_cancelled() {
                cancelled = true;
                info!(job_id = %self.ctx.job_id, "Cancellation requested, launching no further phases");
                for index in scheduler.cancel_pending() {
                    let outcome = self.placeholder(&scheduler, index, PhaseStatus::Cancelled);
                    self.ctx
                        .emit(PhaseEvent::Cancelled {
                            phase: outcome.phase.clone(),
                        })
                        .await;
                    self.record(&mut summary, &mut outputs, outcome).await?;
                }
            }

            if !cancelled {
                for index in scheduler.ready_phases() {
                    if active_tasks.len() >= pool.size() {
                        break;
                    }
                    let Some(phase) = scheduler.graph().get_phase(index).cloned() else {
                        continue;
                    };

                    if phase.skip {
                        info!(job_id = %self.ctx.job_id, phase = %phase.id, "Skipping phase");
                        let outcome = PhaseOutcome::skipped(&phase.id, &phase.name)
                            .with_operation(phase.kind.key());
                        self.finish(&mut scheduler, &mut summary, &mut outputs, index, outcome)
                            .await?;
                        continue 'outer;
                    }

                    if let Some(stored) = reusable.get(&phase.id) {
                        info!(job_id = %self.ctx.job_id, phase = %phase.id, "Reusing stored phase result");
                        self.finish(&mut scheduler, &mut summary, &mut outputs, index, stored.clone())
                            .await?;
                        continue 'outer;
                    }

                    if self.ctx.cancel.is_cancelled() {
                        continue 'outer;
                    }

                    scheduler.mark_running(index);
                    self.ctx
                        .emit(PhaseEvent::Started {
                            phase: phase.id.clone(),
                            wave_position: launched,
                        })
                        .await;
                    launched += 1;

                    info!(
                        job_id = %self.ctx.job_id,
                        phase = %phase.id,
                        name = %phase.name,
                        operation = phase.kind.key(),
                        per_item = phase.is_per_item(),
                        "Launching phase"
                    );

                    let upstream: HashMap<PhaseId, PhaseOutcome> = phase
                        .depends_on
                        .iter()
                        .filter_map(|dep| outputs.get(dep).map(|o| (dep.clone(), o.clone())))
                        .collect();

                    let permit = pool.acquire().await?;
                    let result_tx = result_tx.clone();
                    let runner = runner.clone();

                    let handle = tokio::spawn(async move {
                        let _permit = permit; // Hold until complete
                        let outcome = run_guarded(&runner, &phase, &upstream).await;
                        result_tx.send((index, outcome)).await.ok();
                    });
                    active_tasks.insert(index, handle);
                }
            }

            if active_tasks.is_empty() {
                if scheduler.all_terminal() || scheduler.ready_phases().is_empty() || cancelled {
                    break;
                }
                continue;
            }

            match result_rx.recv().await {
                Some((index, outcome)) => {
                    if let Some(handle) = active_tasks.remove(&index) {
                        handle.await.ok();
                    }
                    if let Err(e) = self
                        .finish(&mut scheduler, &mut summary, &mut outputs, index, outcome)
                        .await
                    {
                        for (_, handle) in active_tasks.drain() {
                            handle.abort();
                        }
                        return Err(e);
                    }
                }
                None => break,
            }
        }

        let state = scheduler.final_state(cancelled);
        summary.state = state;
        summary.duration = timer.elapsed();

        info!(
            job_id = %self.ctx.job_id,
            state = ?state,
            completed = summary.completed,
            completed_with_errors = summary.completed_with_errors,
            failed = summary.failed,
            blocked = summary.blocked,
            cancelled = summary.cancelled,
            tokens = summary.tokens.total(),
            "Workflow finished"
        );

        self.ctx.emit(PhaseEvent::JobCompleted { state }).await;
        Ok(summary)
    }

    /// Record a terminal outcome and block whatever it blocks.
    async fn finish(
        &self,
        scheduler: &mut DagScheduler,
        summary: &mut JobSummary,
        outputs: &mut HashMap<PhaseId, PhaseOutcome>,
        index: PhaseIndex,
        outcome: PhaseOutcome,
    ) -> Result<()> {
        let blocked = scheduler.mark_finished(index, outcome.status.clone());

        match &outcome.status {
            PhaseStatus::Failed { error } => {
                warn!(job_id = %self.ctx.job_id, phase = %outcome.phase, %error, "Phase failed")
            }
            status => {
                info!(job_id = %self.ctx.job_id, phase = %outcome.phase, status = status.label(), "Phase finished")
            }
        }

        self.ctx
            .emit(PhaseEvent::Completed {
                phase: outcome.phase.clone(),
                status: outcome.status.clone(),
            })
            .await;
        self.record(summary, outputs, outcome).await?;

        for blocked_index in blocked {
            let status = scheduler
                .status(blocked_index)
                .cloned()
                .unwrap_or(PhaseStatus::Blocked { by: String::new() });
            let by = match &status {
                PhaseStatus::Blocked { by } => by.clone(),
                _ => String::new(),
            };
            let blocked_outcome = self.placeholder(scheduler, blocked_index, status);
            info!(job_id = %self.ctx.job_id, phase = %blocked_outcome.phase, %by, "Phase blocked");
            self.ctx
                .emit(PhaseEvent::Blocked {
                    phase: blocked_outcome.phase.clone(),
                    by,
                })
                .await;
            self.record(summary, outputs, blocked_outcome).await?;
        }

        Ok(())
    }

    /// Persist an outcome and fold it into the summary.
    async fn record(
        &self,
        summary: &mut JobSummary,
        outputs: &mut HashMap<PhaseId, PhaseOutcome>,
        outcome: PhaseOutcome,
    ) -> Result<()> {
        self.ctx
            .store
            .upsert_phase_result(&self.ctx.job_id, &outcome)
            .await
            .with_context(|| format!("Failed to persist result of phase {}", outcome.phase))?;
        outputs.insert(outcome.phase.clone(), outcome.clone());
        summary.add_outcome(outcome);
        Ok(())
    }

    /// Outcome for a phase that never ran.
    fn placeholder(&self, scheduler: &DagScheduler, index: PhaseIndex, status: PhaseStatus) -> PhaseOutcome {
        match scheduler.graph().get_phase(index) {
            Some(phase) => PhaseOutcome::new(&phase.id, &phase.name, status).with_operation(phase.kind.key()),
            None => PhaseOutcome::new(&scheduler.nodes()[index].id, "", status),
        }
    }
}

/// Run a phase, turning a panic into a failed outcome so the result always
/// reaches the launch loop.
async fn run_guarded(
    runner: &PhaseRunner,
    phase: &ResolvedPhase,
    upstream: &HashMap<PhaseId, PhaseOutcome>,
) -> PhaseOutcome {
    let timer = ExecutionTimer::start();
    match AssertUnwindSafe(runner.run(phase, upstream)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(phase = %phase.id, "Phase task panicked");
            PhaseOutcome::failure(&phase.id, &phase.name, "phase task panicked", timer.elapsed())
                .with_operation(phase.kind.key())
        }
    }
}
