//! Phase execution.
//!
//! An aggregated phase runs its operation or chain once over the job's
//! documents. A per-item phase resolves its items, runs the same work once
//! per item on a bounded [`WorkerPool`], and optionally synthesizes the
//! successful item outputs with one more call. Item failures stay local to
//! the item.

use std::collections::HashMap;
use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use tracing::{info, warn};

use super::chain::{ChainRunner, WorkUnit, run_operation};
use super::{RunContext, WorkTally, call_checkpointed};
use crate::completion::{CallOptions, Prompt};
use crate::context::Segment;
use crate::dag::builder::{PhaseKind, PhaseScope, ResolvedPhase};
use crate::dag::scheduler::PhaseStatus;
use crate::dag::state::{ExecutionTimer, ItemOutcome, PhaseEvent, PhaseOutcome, StepOutput};
use crate::errors::RunError;
use crate::jobs::models::{Coordinate, Document};
use crate::plan::{ItemSource, OperationDef, PhaseId};
use crate::pool::WorkerPool;

/// Coordinate key of the per-item synthesis call.
pub const SYNTHESIS_KEY: &str = "synthesis";

// Bullet ("- x", "* x", "• x") or numbered ("1. x", "2) x") list lines
static LIST_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•]|\d+[.)])\s+(.+?)\s*$").unwrap());

/// One item of a per-item phase.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Stable key, used in checkpoint coordinates
    pub key: String,
    /// Human-readable name; item overrides may also be keyed by it
    pub label: String,
    pub text: String,
}

impl WorkItem {
    pub fn new(key: &str, label: &str, text: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            text: text.to_string(),
        }
    }
}

/// Resolve the items of a per-item phase.
///
/// A `phase_output` source whose phase has no recorded outcome yields no
/// items.
pub fn resolve_items(
    source: &ItemSource,
    documents: &[Document],
    upstream: &HashMap<PhaseId, PhaseOutcome>,
) -> Vec<WorkItem> {
    match source {
        ItemSource::Documents => documents
            .iter()
            .map(|doc| {
                WorkItem::new(
                    &doc.id,
                    &doc.title,
                    &format!("### Document: {}\n{}", doc.title, doc.content),
                )
            })
            .collect(),
        ItemSource::List { items } => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let key = item.key.clone().unwrap_or_else(|| (i + 1).to_string());
                WorkItem::new(&key, &key, &item.text)
            })
            .collect(),
        ItemSource::PhaseOutput { phase } => match upstream.get(phase) {
            Some(outcome) => items_from_outcome(outcome),
            None => Vec::new(),
        },
    }
}

fn items_from_outcome(outcome: &PhaseOutcome) -> Vec<WorkItem> {
    if !outcome.items.is_empty() {
        return outcome
            .successful_items()
            .filter_map(|item| {
                item.output
                    .as_deref()
                    .map(|text| WorkItem::new(&item.key, &item.key, text))
            })
            .collect();
    }

    let Some(output) = outcome.output.as_deref().filter(|o| !o.trim().is_empty()) else {
        return Vec::new();
    };

    let listed: Vec<WorkItem> = output
        .lines()
        .filter_map(|line| LIST_LINE_REGEX.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .enumerate()
        .map(|(i, text)| {
            let key = (i + 1).to_string();
            WorkItem::new(&key, &key, &text)
        })
        .collect();

    if listed.is_empty() {
        vec![WorkItem::new("1", "1", output.trim())]
    } else {
        listed
    }
}

/// Output of running a phase's work once.
struct UnitOutput {
    text: String,
    steps: Vec<StepOutput>,
    tally: WorkTally,
}

/// Runs one resolved phase to a terminal [`PhaseOutcome`].
pub struct PhaseRunner {
    ctx: RunContext,
}

impl PhaseRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Run `phase` given its dependencies' outcomes.
    ///
    /// Never returns an error: failures and cancellation become the
    /// outcome's status.
    pub async fn run(
        &self,
        phase: &ResolvedPhase,
        upstream: &HashMap<PhaseId, PhaseOutcome>,
    ) -> PhaseOutcome {
        let timer = ExecutionTimer::start();
        let context = self.ctx.broker.assemble(phase, upstream);

        let mut outcome = match &phase.scope {
            PhaseScope::Aggregated => self.run_aggregated(phase, &context).await,
            PhaseScope::PerItem { source } => {
                let items = resolve_items(source, &self.ctx.documents, upstream);
                self.run_per_item(phase, &items, &context).await
            }
        };

        outcome.duration = timer.elapsed();
        outcome
    }

    async fn run_aggregated(&self, phase: &ResolvedPhase, context: &str) -> PhaseOutcome {
        let input = self.ctx.documents_input();
        let unit = WorkUnit::aggregated(phase, context, &input);
        let base = PhaseOutcome::new(&phase.id, &phase.name, PhaseStatus::Completed)
            .with_operation(phase.kind.key());

        match self.run_unit(&unit).await {
            Ok(output) => PhaseOutcome {
                output: Some(output.text),
                steps: output.steps,
                ..with_tally(base, output.tally)
            },
            Err(err) => self.error_outcome(phase, base, &err),
        }
    }

    async fn run_per_item(
        &self,
        phase: &ResolvedPhase,
        items: &[WorkItem],
        context: &str,
    ) -> PhaseOutcome {
        let size = phase.item_concurrency.unwrap_or(self.ctx.item_concurrency);
        let pool = WorkerPool::new(format!("phase {} items", phase.id), size);

        info!(
            job_id = %self.ctx.job_id,
            phase = %phase.id,
            items = items.len(),
            pool = pool.size(),
            "Fanning out per-item phase"
        );

        let runs = items.iter().map(|item| self.run_item(phase, item, context, &pool));
        let results = join_all(runs).await;

        let mut tally = WorkTally::default();
        let mut any_cancelled = false;
        let mut outcomes = Vec::with_capacity(results.len());
        for (outcome, item_tally, cancelled) in results {
            tally.absorb(item_tally);
            any_cancelled |= cancelled;
            outcomes.push(outcome);
        }

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        let base = PhaseOutcome {
            items: outcomes,
            ..PhaseOutcome::new(&phase.id, &phase.name, PhaseStatus::Completed)
                .with_operation(phase.kind.key())
        };
        let mut outcome = with_tally(base, tally);

        if any_cancelled && self.ctx.cancel.is_cancelled() {
            outcome.status = PhaseStatus::Cancelled;
            return outcome;
        }

        if failed > 0 && failed == outcome.items.len() {
            let first = outcome
                .failed_items()
                .find_map(|i| i.error.clone())
                .unwrap_or_default();
            let error = format!("all {} items failed; first error: {}", failed, first);
            outcome.status = PhaseStatus::Failed {
                error: error.clone(),
            };
            outcome.error = Some(error);
            return outcome;
        }

        if failed > 0 {
            outcome.status = PhaseStatus::CompletedWithErrors {
                failed_items: failed,
            };
        }

        if phase.synthesize && outcome.successful_items().next().is_some() {
            let mut synthesis_tally = WorkTally::default();
            match self
                .synthesize(phase, &outcome, context, &mut synthesis_tally)
                .await
            {
                Ok(text) => outcome.output = Some(text),
                Err(err) if err.is_cancelled() => outcome.status = PhaseStatus::Cancelled,
                Err(err) => {
                    let error = format!("synthesis failed: {}", err);
                    warn!(job_id = %self.ctx.job_id, phase = %phase.id, error = %err, "Synthesis failed");
                    outcome.status = PhaseStatus::Failed {
                        error: error.clone(),
                    };
                    outcome.error = Some(error);
                }
            }
            outcome = with_tally(outcome, synthesis_tally);
        }

        outcome
    }

    /// Run one item under a pool slot. Returns the outcome, the work done,
    /// and whether the item stopped because of cancellation.
    async fn run_item(
        &self,
        phase: &ResolvedPhase,
        item: &WorkItem,
        context: &str,
        pool: &WorkerPool,
    ) -> (ItemOutcome, WorkTally, bool) {
        let timer = ExecutionTimer::start();
        let _permit = match pool.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return (
                    ItemOutcome::failure(&item.key, &err.to_string(), timer.elapsed()),
                    WorkTally::default(),
                    false,
                );
            }
        };

        let unit = WorkUnit::for_item(phase, item, context);
        let (outcome, tally, cancelled) = match self.run_unit(&unit).await {
            Ok(output) => (
                ItemOutcome::success(&item.key, output.text, output.tally.tokens, timer.elapsed()),
                output.tally,
                false,
            ),
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(
                        job_id = %self.ctx.job_id,
                        phase = %phase.id,
                        item = %item.key,
                        error = %err,
                        "Item failed"
                    );
                }
                (
                    ItemOutcome::failure(&item.key, &err.to_string(), timer.elapsed()),
                    WorkTally::default(),
                    err.is_cancelled(),
                )
            }
        };

        self.ctx
            .emit(PhaseEvent::ItemCompleted {
                phase: phase.id.clone(),
                item: item.key.clone(),
                success: outcome.succeeded(),
            })
            .await;

        (outcome, tally, cancelled)
    }

    async fn run_unit(&self, unit: &WorkUnit<'_>) -> Result<UnitOutput, RunError> {
        match &unit.phase.kind {
            PhaseKind::SingleOperation { key, operation } => {
                let run = run_operation(&self.ctx, unit, key, operation, "").await?;
                Ok(UnitOutput {
                    steps: vec![StepOutput {
                        operation: key.clone(),
                        text: run.text.clone(),
                    }],
                    text: run.text,
                    tally: run.tally,
                })
            }
            PhaseKind::Chain {
                steps,
                pass_context,
                ..
            } => {
                let result = ChainRunner::new(&self.ctx)
                    .run(unit, steps, *pass_context)
                    .await?;
                Ok(UnitOutput {
                    text: result.buffer,
                    steps: result.steps,
                    tally: result.tally,
                })
            }
        }
    }

    /// One call over the successful item outputs of a per-item phase.
    async fn synthesize(
        &self,
        phase: &ResolvedPhase,
        outcome: &PhaseOutcome,
        context: &str,
        tally: &mut WorkTally,
    ) -> Result<String, RunError> {
        let base = synthesis_operation(&phase.kind);
        let base_prompt = base.map(|op| op.prompt.trim_end()).unwrap_or_default();

        let mut instructions = format!(
            "{}\n\n## Synthesis\nThe work above was done once per item. Combine the per-item \
             results below into one consolidated result and attribute each point to the \
             items it comes from.",
            base_prompt
        );
        if !context.is_empty() {
            instructions.push_str("\n\n## Upstream context\n");
            instructions.push_str(context);
        }
        let failed: Vec<&str> = outcome.failed_items().map(|i| i.key.as_str()).collect();
        if !failed.is_empty() {
            instructions.push_str(&format!(
                "\n\nThese items failed and have no results: {}",
                failed.join(", ")
            ));
        }

        let input = outcome
            .successful_items()
            .filter_map(|item| {
                item.output.as_deref().map(|text| {
                    Segment::new(&phase.id, phase.kind.key(), text)
                        .for_item(&item.key)
                        .render()
                })
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let depth = phase
            .depth
            .unwrap_or_else(|| base.map(|op| op.default_depth).unwrap_or_default());
        let options = CallOptions::new(depth, self.ctx.cancel.clone())
            .with_default_model(base.and_then(|op| op.model.clone()));
        let coordinate = Coordinate::new(&phase.id, SYNTHESIS_KEY, 0, None);

        call_checkpointed(
            &self.ctx,
            &coordinate,
            &Prompt::new(instructions, input),
            phase.model_hint.as_deref(),
            &options,
            tally,
        )
        .await
    }

    fn error_outcome(&self, phase: &ResolvedPhase, base: PhaseOutcome, err: &RunError) -> PhaseOutcome {
        if err.is_cancelled() {
            info!(job_id = %self.ctx.job_id, phase = %phase.id, "Phase stopped by cancellation");
            return PhaseOutcome {
                status: PhaseStatus::Cancelled,
                ..base
            };
        }
        warn!(job_id = %self.ctx.job_id, phase = %phase.id, error = %err, "Phase failed");
        PhaseOutcome {
            status: PhaseStatus::Failed {
                error: err.to_string(),
            },
            error: Some(err.to_string()),
            ..base
        }
    }
}

/// The operation whose prompt frames the synthesis: the phase's operation,
/// or the last step of its chain.
fn synthesis_operation(kind: &PhaseKind) -> Option<&OperationDef> {
    match kind {
        PhaseKind::SingleOperation { operation, .. } => Some(operation),
        PhaseKind::Chain { steps, .. } => steps.last().map(|step| &step.operation),
    }
}

fn with_tally(mut outcome: PhaseOutcome, tally: WorkTally) -> PhaseOutcome {
    outcome.tokens.add(tally.tokens);
    outcome.calls += tally.calls;
    outcome.reused += tally.reused;
    outcome.stale_checkpoints += tally.stale;
    outcome
}
