//! Executes the work inside one phase.
//!
//! - [`chain`]: multi-pass operations and chains of operations
//! - [`phase`]: aggregated and per-item phases, item fan-out, synthesis
//!
//! Every completion call goes through [`call_checkpointed`], which consults
//! the job store first so a coordinate that already has a checkpoint is
//! never sent to the service again.

pub mod chain;
pub mod phase;

pub use chain::{ChainResult, ChainRunner, OperationRun, run_operation};
pub use phase::{PhaseRunner, WorkItem, resolve_items};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::completion::{CallOptions, CompletionCaller, Prompt};
use crate::context::ContextBroker;
use crate::dag::state::{PhaseEvent, TokenUsage};
use crate::errors::RunError;
use crate::jobs::models::{Coordinate, Document};
use crate::jobs::store::JobStore;

/// Default item pool size for per-item phases.
pub const DEFAULT_ITEM_CONCURRENCY: usize = 2;

/// Everything a phase needs to run, shared by every phase of a job.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    pub store: Arc<dyn JobStore>,
    pub caller: Arc<CompletionCaller>,
    pub broker: ContextBroker,
    pub documents: Arc<Vec<Document>>,
    /// Item pool size for per-item phases that do not set their own
    pub item_concurrency: usize,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::Sender<PhaseEvent>>,
}

impl RunContext {
    pub fn new(job_id: &str, store: Arc<dyn JobStore>, caller: Arc<CompletionCaller>) -> Self {
        Self {
            job_id: job_id.to_string(),
            store,
            caller,
            broker: ContextBroker::default(),
            documents: Arc::new(Vec::new()),
            item_concurrency: DEFAULT_ITEM_CONCURRENCY,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_documents(mut self, documents: Vec<Document>) -> Self {
        self.documents = Arc::new(documents);
        self
    }

    pub fn with_broker(mut self, broker: ContextBroker) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_item_concurrency(mut self, size: usize) -> Self {
        self.item_concurrency = size.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<PhaseEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Send an event if a listener is attached. A closed channel is ignored.
    pub async fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.events {
            tx.send(event).await.ok();
        }
    }

    /// The job's documents as one input block.
    pub fn documents_input(&self) -> String {
        self.documents
            .iter()
            .map(|doc| format!("### Document: {}\n{}", doc.title, doc.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Work accounting for a unit of execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkTally {
    pub tokens: TokenUsage,
    /// Logical calls issued to the completion service
    pub calls: u32,
    /// Coordinates answered from a checkpoint
    pub reused: u32,
    /// Reused checkpoints whose prompt fingerprint changed
    pub stale: u32,
}

impl WorkTally {
    pub fn absorb(&mut self, other: WorkTally) {
        self.tokens.add(other.tokens);
        self.calls += other.calls;
        self.reused += other.reused;
        self.stale += other.stale;
    }
}

/// Answer `prompt` at `coordinate`, from the checkpoint if one exists.
///
/// A fresh result is checkpointed before it is returned.
pub async fn call_checkpointed(
    ctx: &RunContext,
    coordinate: &Coordinate,
    prompt: &Prompt,
    model_hint: Option<&str>,
    options: &CallOptions,
    tally: &mut WorkTally,
) -> Result<String, RunError> {
    let fingerprint = prompt.fingerprint();

    if let Some(checkpoint) = ctx.store.get_checkpoint(&ctx.job_id, coordinate).await? {
        if checkpoint.input_hash != fingerprint {
            warn!(
                job_id = %ctx.job_id,
                coordinate = %coordinate,
                "Reusing checkpoint whose prompt no longer matches"
            );
            tally.stale += 1;
        } else {
            debug!(job_id = %ctx.job_id, coordinate = %coordinate, "Reusing checkpoint");
        }
        tally.reused += 1;
        return Ok(checkpoint.result.text);
    }

    let result = ctx.caller.call(prompt, model_hint, options).await?;
    ctx.store
        .upsert_checkpoint(&ctx.job_id, coordinate, &result, &fingerprint)
        .await?;

    debug!(
        job_id = %ctx.job_id,
        coordinate = %coordinate,
        model = %result.model,
        attempts = result.attempts,
        chunked = result.chunked,
        partial = result.partial,
        "Checkpointed call result"
    );

    tally.calls += 1;
    tally
        .tokens
        .add(TokenUsage::new(result.prompt_tokens, result.completion_tokens));
    Ok(result.text)
}
