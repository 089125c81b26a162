//! Operations and chains.
//!
//! An operation runs one pass per stance its depth selects; pass k sees
//! pass k-1's output. A chain runs its operations in declared order and,
//! when `pass_context` is set, shows each operation the tagged outputs of
//! the steps before it.

use tracing::{debug, info};

use super::phase::WorkItem;
use super::{RunContext, WorkTally, call_checkpointed};
use crate::completion::{CallOptions, Prompt};
use crate::context::Segment;
use crate::dag::builder::{ChainStep, ResolvedPhase};
use crate::dag::state::StepOutput;
use crate::errors::RunError;
use crate::jobs::models::Coordinate;
use crate::plan::{Depth, ItemOverride, OperationDef};

/// One piece of work: a phase, narrowed to one item for per-item phases.
#[derive(Debug, Clone, Copy)]
pub struct WorkUnit<'a> {
    pub phase: &'a ResolvedPhase,
    pub item: Option<&'a WorkItem>,
    /// Assembled upstream context
    pub upstream: &'a str,
    /// Text the operation works on
    pub input: &'a str,
}

impl<'a> WorkUnit<'a> {
    pub fn aggregated(phase: &'a ResolvedPhase, upstream: &'a str, input: &'a str) -> Self {
        Self {
            phase,
            item: None,
            upstream,
            input,
        }
    }

    pub fn for_item(phase: &'a ResolvedPhase, item: &'a WorkItem, upstream: &'a str) -> Self {
        Self {
            phase,
            item: Some(item),
            upstream,
            input: &item.text,
        }
    }

    pub fn item_key(&self) -> Option<&'a str> {
        self.item.map(|i| i.key.as_str())
    }

    /// Overrides for this item, looked up by key and then by label.
    pub fn item_override(&self) -> Option<&'a ItemOverride> {
        let item = self.item?;
        self.phase
            .item_overrides
            .get(&item.key)
            .or_else(|| self.phase.item_overrides.get(&item.label))
    }

    /// Item override, else the phase's depth, else the operation default.
    pub fn depth_for(&self, operation: &OperationDef) -> Depth {
        self.item_override()
            .and_then(|o| o.depth)
            .or(self.phase.depth)
            .unwrap_or(operation.default_depth)
    }

    pub fn model_hint(&self) -> Option<&'a str> {
        self.item_override()
            .and_then(|o| o.model_hint.as_deref())
            .or(self.phase.model_hint.as_deref())
    }

    fn item_instructions(&self) -> Option<&'a str> {
        self.item_override().and_then(|o| o.instructions.as_deref())
    }
}

/// Output of one operation's passes.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRun {
    /// Output of the last pass
    pub text: String,
    pub passes: u32,
    pub tally: WorkTally,
}

/// Output of a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainResult {
    pub steps: Vec<StepOutput>,
    /// Tagged step outputs, trimmed to the phase's context budget
    pub buffer: String,
    pub tally: WorkTally,
}

/// Instructions for one pass. Empty sections are omitted.
pub(crate) fn compose_instructions(
    operation: &OperationDef,
    stance: Option<(&str, usize, usize)>,
    upstream: &str,
    chain_buffer: &str,
    previous_pass: Option<&str>,
    item_instructions: Option<&str>,
) -> String {
    let mut sections = vec![operation.prompt.trim_end().to_string()];

    if let Some((stance, pass, total)) = stance {
        sections.push(format!("## Stance (pass {} of {})\n{}", pass, total, stance));
    }
    if !upstream.is_empty() {
        sections.push(format!("## Upstream context\n{}", upstream));
    }
    if !chain_buffer.is_empty() {
        sections.push(format!("## Earlier steps in this chain\n{}", chain_buffer));
    }
    if let Some(previous) = previous_pass {
        sections.push(format!("## Previous pass output\n{}", previous));
    }
    if let Some(extra) = item_instructions.filter(|s| !s.trim().is_empty()) {
        sections.push(format!("## Item-specific instructions\n{}", extra));
    }

    sections.join("\n\n")
}

/// Run every pass of `operation` for `unit`.
///
/// `key` is the operation's coordinate key within the phase.
pub async fn run_operation(
    ctx: &RunContext,
    unit: &WorkUnit<'_>,
    key: &str,
    operation: &OperationDef,
    chain_buffer: &str,
) -> Result<OperationRun, RunError> {
    let depth = unit.depth_for(operation);
    let stances = operation.stances_for(depth);
    let total = stances.len();
    let options =
        CallOptions::new(depth, ctx.cancel.clone()).with_default_model(operation.model.clone());

    let mut tally = WorkTally::default();
    let mut previous: Option<String> = None;

    for (index, stance) in stances.iter().enumerate() {
        let pass = index + 1;
        let instructions = compose_instructions(
            operation,
            stance.as_deref().map(|s| (s, pass, total)),
            unit.upstream,
            chain_buffer,
            previous.as_deref(),
            unit.item_instructions(),
        );
        let prompt = Prompt::new(instructions, unit.input);
        let coordinate = Coordinate::new(&unit.phase.id, key, pass as u32, unit.item_key());

        debug!(
            job_id = %ctx.job_id,
            phase = %unit.phase.id,
            operation = %key,
            pass,
            item = unit.item_key().unwrap_or(""),
            %depth,
            "Running pass"
        );

        let text =
            call_checkpointed(ctx, &coordinate, &prompt, unit.model_hint(), &options, &mut tally)
                .await?;
        previous = Some(text);
    }

    Ok(OperationRun {
        text: previous.unwrap_or_default(),
        passes: total as u32,
        tally,
    })
}

/// Runs the operations of a chain in order.
pub struct ChainRunner<'a> {
    ctx: &'a RunContext,
}

impl<'a> ChainRunner<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Coordinate key of the step at `index`.
    pub fn step_key(index: usize, step: &ChainStep) -> String {
        format!("{}.{}", index, step.key)
    }

    pub async fn run(
        &self,
        unit: &WorkUnit<'_>,
        steps: &[ChainStep],
        pass_context: bool,
    ) -> Result<ChainResult, RunError> {
        let budget = self.ctx.broker.budget_for(unit.phase);
        let mut segments: Vec<Segment> = Vec::with_capacity(steps.len());
        let mut outputs = Vec::with_capacity(steps.len());
        let mut tally = WorkTally::default();
        let mut buffer = String::new();

        for (index, step) in steps.iter().enumerate() {
            let key = Self::step_key(index, step);
            let visible = if pass_context { buffer.as_str() } else { "" };
            let run = run_operation(self.ctx, unit, &key, &step.operation, visible).await?;

            info!(
                job_id = %self.ctx.job_id,
                phase = %unit.phase.id,
                operation = %key,
                item = unit.item_key().unwrap_or(""),
                passes = run.passes,
                "Chain step finished"
            );

            let mut segment = Segment::new(&unit.phase.id, &step.key, &run.text);
            if let Some(item) = unit.item_key() {
                segment = segment.for_item(item);
            }
            segments.push(segment);
            buffer = self.ctx.broker.assemble_segments(&segments, budget);

            tally.absorb(run.tally);
            outputs.push(StepOutput {
                operation: step.key.clone(),
                text: run.text,
            });
        }

        Ok(ChainResult {
            steps: outputs,
            buffer,
            tally,
        })
    }
}
