//! Job lifecycle.
//!
//! The [`JobManager`] is the only component callers talk to. It validates
//! and submits plans, runs each job on a background task, exposes polling
//! status and results, cancels cooperatively, and recovers jobs left
//! `running` by a previous process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::models::{Document, DocumentSummary, JobRecord, JobStatus};
use super::store::JobStore;
use crate::completion::CompletionCaller;
use crate::context::{ContextBroker, DEFAULT_BUDGET_CHARS};
use crate::dag::builder::{DependencyGraph, resolve};
use crate::dag::executor::WorkflowRunner;
use crate::dag::scheduler::{DagConfig, PhaseStatus};
use crate::dag::state::{DagState, PhaseEvent, PhaseOutcome, TokenUsage};
use crate::errors::JobError;
use crate::plan::{ExecutionPlan, PhaseId};
use crate::runner::{DEFAULT_ITEM_CONCURRENCY, RunContext};

/// How often a running job refreshes its worker heartbeat and re-reads its
/// stored cancellation flag.
const WORKER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables for jobs started by a manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Phases in flight per job
    pub max_parallel_phases: usize,
    /// Items in flight per per-item phase, unless the phase sets its own
    pub max_parallel_items: usize,
    pub context_budget: usize,
    /// A `running` job with no progress for this long is failed on recovery
    pub stale_after: Duration,
    /// A job whose worker heartbeat is younger than this is owned by a live
    /// process and is never recovered
    pub heartbeat_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_parallel_phases: 4,
            max_parallel_items: DEFAULT_ITEM_CONCURRENCY,
            context_budget: DEFAULT_BUDGET_CHARS,
            stale_after: Duration::from_secs(30 * 60),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-phase progress in a status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase: PhaseId,
    pub name: String,
    pub status: PhaseStatus,
    pub items_completed: usize,
    pub items_failed: usize,
    #[serde(default)]
    pub reused: u32,
    #[serde(default)]
    pub stale_checkpoints: u32,
}

/// Answer to `status(job_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub plan_name: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_progress_at: DateTime<Utc>,
    pub phases: Vec<PhaseProgress>,
    pub checkpoints: usize,
    pub stale_checkpoints: u32,
    pub tokens: TokenUsage,
    pub completion_percentage: f64,
}

/// One row of `list_jobs()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListing {
    pub id: String,
    pub plan_name: String,
    pub status: JobStatus,
    pub phases: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobListing {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.clone(),
            plan_name: job.plan.name.clone(),
            status: job.status,
            phases: job.plan.phases.len(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// What `recover_orphans()` did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub resumed: Vec<String>,
    pub failed: Vec<String>,
    pub cancelled: Vec<String>,
    /// Still heartbeating from another process
    #[serde(default)]
    pub skipped: Vec<String>,
}

/// Live statuses folded from runner events.
#[derive(Debug, Default)]
struct ProgressBoard {
    statuses: HashMap<PhaseId, PhaseStatus>,
    /// (succeeded, failed) item counts
    items: HashMap<PhaseId, (usize, usize)>,
}

impl ProgressBoard {
    fn apply(&mut self, event: &PhaseEvent) {
        match event {
            PhaseEvent::Started { phase, .. } => {
                self.statuses.insert(
                    phase.clone(),
                    PhaseStatus::Running {
                        started_at_ms: Utc::now().timestamp_millis().max(0) as u64,
                    },
                );
            }
            PhaseEvent::ItemCompleted { phase, success, .. } => {
                let counts = self.items.entry(phase.clone()).or_default();
                if *success {
                    counts.0 += 1;
                } else {
                    counts.1 += 1;
                }
            }
            PhaseEvent::Completed { phase, status } => {
                self.statuses.insert(phase.clone(), status.clone());
            }
            PhaseEvent::Blocked { phase, by } => {
                self.statuses
                    .insert(phase.clone(), PhaseStatus::Blocked { by: by.clone() });
            }
            PhaseEvent::Cancelled { phase } => {
                self.statuses.insert(phase.clone(), PhaseStatus::Cancelled);
            }
            PhaseEvent::JobCompleted { .. } => {}
        }
    }
}

struct ActiveJob {
    cancel: CancellationToken,
    board: Arc<Mutex<ProgressBoard>>,
    /// Flips to true once the worker has recorded its final status
    finished: watch::Receiver<bool>,
}

/// Job lifecycle API.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    caller: Arc<CompletionCaller>,
    config: ManagerConfig,
    active: Arc<Mutex<HashMap<String, ActiveJob>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, caller: Arc<CompletionCaller>, config: ManagerConfig) -> Self {
        Self {
            store,
            caller,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // ── Documents ─────────────────────────────────────────────────────

    pub async fn upload_document(&self, title: &str, content: &str) -> Result<Document, JobError> {
        let document = Document::new(title, content);
        self.store.insert_document(&document).await?;
        info!(document_id = %document.id, title, chars = document.char_count, "Stored document");
        Ok(document)
    }

    pub async fn get_document(&self, id: &str) -> Result<Document, JobError> {
        self.store
            .get_document(id)
            .await?
            .ok_or_else(|| JobError::DocumentNotFound(id.to_string()))
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>, JobError> {
        Ok(self.store.list_documents().await?)
    }

    /// Delete a document. Refused while a pending or running job uses it.
    pub async fn delete_document(&self, id: &str) -> Result<(), JobError> {
        for status in [JobStatus::Pending, JobStatus::Running] {
            if let Some(job) = self
                .store
                .jobs_with_status(status)
                .await?
                .into_iter()
                .find(|j| j.document_ids.iter().any(|d| d == id))
            {
                return Err(JobError::DocumentInUse {
                    document_id: id.to_string(),
                    job_id: job.id,
                });
            }
        }

        if self.store.delete_document(id).await? {
            info!(document_id = %id, "Deleted document");
            Ok(())
        } else {
            Err(JobError::DocumentNotFound(id.to_string()))
        }
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    /// Validate `plan`, record a job and start it. Nothing is recorded if
    /// validation fails.
    pub async fn submit(
        &self,
        plan: ExecutionPlan,
        document_ids: Vec<String>,
        fail_fast: bool,
    ) -> Result<String, JobError> {
        let graph = resolve(&plan)?;
        let documents = self.load_documents(&document_ids).await?;

        let job = JobRecord::new(plan, document_ids, fail_fast);
        self.store.create_job(&job).await?;
        info!(
            job_id = %job.id,
            plan = %job.plan.name,
            phases = graph.len(),
            documents = documents.len(),
            fail_fast,
            "Submitted job"
        );

        let job_id = job.id.clone();
        self.launch(job, graph, documents, Vec::new()).await;
        Ok(job_id)
    }

    /// Request cancellation. Running phases finish; nothing new launches.
    /// Returns the status at the time of the request.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, JobError> {
        let job = self.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
                action: "cancelled",
            });
        }

        self.store.request_cancel(job_id).await?;

        // A worker in another process sees the stored flag on its next
        // poll; an orphan is finalised by recovery.
        if let Some(running) = self.active.lock().await.get(job_id) {
            running.cancel.cancel();
        }
        info!(job_id, status = %job.status, "Cancellation requested");
        Ok(job.status)
    }

    /// Per-phase progress for polling.
    pub async fn status(&self, job_id: &str) -> Result<JobStatusReport, JobError> {
        let snapshot = self
            .store
            .load_job(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;

        let stored: HashMap<PhaseId, PhaseOutcome> = snapshot
            .phase_results
            .into_iter()
            .map(|o| (o.phase.clone(), o))
            .collect();

        let board = {
            let active = self.active.lock().await;
            active.get(job_id).map(|a| a.board.clone())
        };
        let live = match board {
            Some(board) => {
                let board = board.lock().await;
                Some((board.statuses.clone(), board.items.clone()))
            }
            None => None,
        };

        let mut tokens = TokenUsage::default();
        let mut stale_checkpoints = 0;
        let mut terminal = 0;
        let mut phases = Vec::with_capacity(snapshot.job.plan.phases.len());

        for phase in &snapshot.job.plan.phases {
            let mut progress = PhaseProgress {
                phase: phase.id.clone(),
                name: phase.display_name(),
                status: PhaseStatus::Pending,
                items_completed: 0,
                items_failed: 0,
                reused: 0,
                stale_checkpoints: 0,
            };

            if let Some(outcome) = stored.get(&phase.id) {
                progress.status = outcome.status.clone();
                progress.items_completed = outcome.successful_items().count();
                progress.items_failed = outcome.failed_items().count();
                progress.reused = outcome.reused;
                progress.stale_checkpoints = outcome.stale_checkpoints;
                tokens.add(outcome.tokens);
                stale_checkpoints += outcome.stale_checkpoints;
            } else if let Some((statuses, items)) = &live {
                if let Some(status) = statuses.get(&phase.id) {
                    progress.status = status.clone();
                }
                if let Some((ok, failed)) = items.get(&phase.id) {
                    progress.items_completed = *ok;
                    progress.items_failed = *failed;
                }
            }

            if progress.status.is_terminal() {
                terminal += 1;
            }
            phases.push(progress);
        }

        let completion_percentage = if phases.is_empty() {
            100.0
        } else {
            terminal as f64 / phases.len() as f64 * 100.0
        };

        Ok(JobStatusReport {
            job_id: snapshot.job.id,
            plan_name: snapshot.job.plan.name,
            status: snapshot.job.status,
            error: snapshot.job.error,
            cancel_requested: snapshot.job.cancel_requested,
            created_at: snapshot.job.created_at,
            updated_at: snapshot.job.updated_at,
            last_progress_at: snapshot.job.last_progress_at,
            phases,
            checkpoints: snapshot.checkpoints.len(),
            stale_checkpoints,
            tokens,
            completion_percentage,
        })
    }

    /// Stored phase outcomes, in phase order.
    pub async fn results(&self, job_id: &str) -> Result<Vec<PhaseOutcome>, JobError> {
        self.get_job(job_id).await?;
        Ok(self.store.phase_results(job_id).await?)
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobListing>, JobError> {
        Ok(self
            .store
            .list_jobs()
            .await?
            .iter()
            .map(JobListing::from)
            .collect())
    }

    pub async fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().await.contains_key(job_id)
    }

    /// Wait for a job's worker to finish and return the stored status.
    pub async fn wait(&self, job_id: &str) -> Result<JobStatus, JobError> {
        let finished = {
            let active = self.active.lock().await;
            active.get(job_id).map(|a| a.finished.clone())
        };
        if let Some(mut finished) = finished
            && finished.wait_for(|done| *done).await.is_err()
        {
            warn!(job_id, "Job supervisor dropped without reporting");
        }
        Ok(self.get_job(job_id).await?.status)
    }

    /// Resume jobs left `pending` or `running` with no live worker. Jobs
    /// still heartbeating, here or in another process, are skipped. Jobs
    /// idle past the staleness threshold are failed instead, and jobs with a
    /// recorded cancellation request are cancelled.
    pub async fn recover_orphans(&self) -> Result<RecoveryReport, JobError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        let mut candidates = self.store.jobs_with_status(JobStatus::Running).await?;
        candidates.extend(self.store.jobs_with_status(JobStatus::Pending).await?);

        for job in candidates {
            if self.is_active(&job.id).await {
                continue;
            }
            if job.has_live_worker(now, self.config.heartbeat_timeout) {
                info!(job_id = %job.id, "Job is owned by a live worker, leaving it alone");
                report.skipped.push(job.id);
                continue;
            }

            if job.cancel_requested {
                self.store
                    .update_job_status(&job.id, JobStatus::Cancelled, None)
                    .await?;
                info!(job_id = %job.id, "Recovered job had a cancellation request");
                report.cancelled.push(job.id);
                continue;
            }

            let idle = now
                .signed_duration_since(job.last_progress_at)
                .to_std()
                .unwrap_or_default();
            if idle > self.config.stale_after {
                let reason = format!(
                    "No checkpoint progress for {}s; abandoned during recovery",
                    idle.as_secs()
                );
                warn!(job_id = %job.id, idle_secs = idle.as_secs(), "Failing stale job");
                self.store
                    .update_job_status(&job.id, JobStatus::Failed, Some(reason))
                    .await?;
                report.failed.push(job.id);
                continue;
            }

            let job_id = job.id.clone();
            match self.resume(job).await {
                Ok(()) => report.resumed.push(job_id),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Could not resume job");
                    self.store
                        .update_job_status(&job_id, JobStatus::Failed, Some(format!("Recovery failed: {}", e)))
                        .await?;
                    report.failed.push(job_id);
                }
            }
        }

        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            skipped = report.skipped.len(),
            "Orphan recovery finished"
        );
        Ok(report)
    }

    async fn resume(&self, job: JobRecord) -> Result<(), JobError> {
        let graph = resolve(&job.plan)?;
        let documents = self.load_documents(&job.document_ids).await?;
        let previous = self.store.phase_results(&job.id).await?;
        info!(
            job_id = %job.id,
            reusable_phases = previous.iter().filter(|o| o.status.satisfies_dependents()).count(),
            "Resuming job"
        );
        self.launch(job, graph, documents, previous).await;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))
    }

    async fn load_documents(&self, ids: &[String]) -> Result<Vec<Document>, JobError> {
        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            documents.push(self.get_document(id).await?);
        }
        Ok(documents)
    }

    /// Start the job's worker task.
    async fn launch(
        &self,
        job: JobRecord,
        graph: DependencyGraph,
        documents: Vec<Document>,
        previous: Vec<PhaseOutcome>,
    ) {
        let cancel = CancellationToken::new();
        let board = Arc::new(Mutex::new(ProgressBoard::default()));
        let (event_tx, mut event_rx) = mpsc::channel::<PhaseEvent>(256);

        let ctx = RunContext::new(&job.id, self.store.clone(), self.caller.clone())
            .with_documents(documents)
            .with_broker(ContextBroker::new(self.config.context_budget))
            .with_item_concurrency(self.config.max_parallel_items)
            .with_cancel(cancel.clone())
            .with_events(event_tx);
        let dag_config = DagConfig::default()
            .with_max_parallel(self.config.max_parallel_phases)
            .with_fail_fast(job.fail_fast);
        let runner = WorkflowRunner::new(ctx, dag_config);

        let board_task = {
            let board = board.clone();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    board.lock().await.apply(&event);
                }
            })
        };

        let watcher = watch_worker(self.store.clone(), job.id.clone(), cancel.clone());
        let (finished_tx, finished_rx) = watch::channel(false);

        let store = self.store.clone();
        let active = self.active.clone();
        let job_id = job.id.clone();

        // Hold the registry lock until the entry exists so the supervisor's
        // removal cannot run first.
        let mut registry = self.active.lock().await;
        tokio::spawn(async move {
            let work = tokio::spawn(run_job(store.clone(), job_id.clone(), runner, graph, previous));
            if let Err(e) = work.await {
                error!(job_id = %job_id, error = %e, "Job worker ended abnormally");
                let reason = format!("Job worker ended abnormally: {}", e);
                if let Err(e) = store
                    .update_job_status(&job_id, JobStatus::Failed, Some(reason))
                    .await
                {
                    error!(job_id = %job_id, error = %e, "Failed to record final job status");
                }
            }

            watcher.abort();
            board_task.await.ok();
            active.lock().await.remove(&job_id);
            finished_tx.send_replace(true);
        });

        registry.insert(
            job.id,
            ActiveJob {
                cancel,
                board,
                finished: finished_rx,
            },
        );
    }
}

/// Run the plan and record the job's final status.
async fn run_job(
    store: Arc<dyn JobStore>,
    job_id: String,
    runner: WorkflowRunner,
    graph: DependencyGraph,
    previous: Vec<PhaseOutcome>,
) {
    if let Err(e) = store
        .update_job_status(&job_id, JobStatus::Running, None)
        .await
    {
        error!(job_id = %job_id, error = %e, "Failed to mark job running");
    }

    let result = runner.execute(graph, previous).await;
    drop(runner);

    let (status, error) = match result {
        Ok(summary) => {
            let status = JobStatus::from(summary.state);
            let error = (summary.state == DagState::Failed).then(|| {
                format!(
                    "{} phase(s) failed, {} blocked",
                    summary.failed, summary.blocked
                )
            });
            (status, error)
        }
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Job aborted");
            (JobStatus::Failed, Some(format!("{:#}", e)))
        }
    };

    if let Err(e) = store.update_job_status(&job_id, status, error).await {
        error!(job_id = %job_id, error = %e, "Failed to record final job status");
    }
    info!(job_id = %job_id, status = %status, "Job finished");
}

/// Keep the job's heartbeat fresh and trigger `cancel` once the stored job
/// carries a cancellation request. Runs until aborted by the supervisor.
fn watch_worker(
    store: Arc<dyn JobStore>,
    job_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(WORKER_POLL_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = store.touch_heartbeat(&job_id).await {
                warn!(job_id = %job_id, error = %e, "Failed to record worker heartbeat");
            }
            if cancel.is_cancelled() {
                continue;
            }
            match store.get_job(&job_id).await {
                Ok(Some(job)) if job.cancel_requested => {
                    info!(job_id = %job_id, "Stored cancellation request observed");
                    cancel.cancel();
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to poll cancellation flag"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{ModelSelector, ScriptedClient};
    use crate::completion::CallResult;
    use crate::jobs::models::{Checkpoint, Coordinate, JobSnapshot};
    use crate::jobs::store::SqliteJobStore;
    use crate::plan::{OperationDef, PlanPhase};

    fn manager(client: Arc<ScriptedClient>) -> JobManager {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        manager_on(store, client)
    }

    fn manager_on(store: Arc<dyn JobStore>, client: Arc<ScriptedClient>) -> JobManager {
        let caller = Arc::new(CompletionCaller::new(client, ModelSelector::new("test-model")));
        JobManager::new(store, caller, ManagerConfig::default())
    }

    /// SQLite store whose worker-side "mark running" write panics.
    struct PanicOnRunning(SqliteJobStore);

    #[async_trait::async_trait]
    impl JobStore for PanicOnRunning {
        async fn create_job(&self, job: &JobRecord) -> anyhow::Result<()> {
            self.0.create_job(job).await
        }
        async fn load_job(&self, job_id: &str) -> anyhow::Result<Option<JobSnapshot>> {
            self.0.load_job(job_id).await
        }
        async fn get_job(&self, job_id: &str) -> anyhow::Result<Option<JobRecord>> {
            self.0.get_job(job_id).await
        }
        async fn list_jobs(&self) -> anyhow::Result<Vec<JobRecord>> {
            self.0.list_jobs().await
        }
        async fn jobs_with_status(&self, status: JobStatus) -> anyhow::Result<Vec<JobRecord>> {
            self.0.jobs_with_status(status).await
        }
        async fn update_job_status(
            &self,
            job_id: &str,
            status: JobStatus,
            error: Option<String>,
        ) -> anyhow::Result<bool> {
            if status == JobStatus::Running {
                panic!("status write exploded");
            }
            self.0.update_job_status(job_id, status, error).await
        }
        async fn request_cancel(&self, job_id: &str) -> anyhow::Result<bool> {
            self.0.request_cancel(job_id).await
        }
        async fn touch_heartbeat(&self, job_id: &str) -> anyhow::Result<bool> {
            self.0.touch_heartbeat(job_id).await
        }
        async fn upsert_checkpoint(
            &self,
            job_id: &str,
            coordinate: &Coordinate,
            result: &CallResult,
            input_hash: &str,
        ) -> anyhow::Result<()> {
            self.0.upsert_checkpoint(job_id, coordinate, result, input_hash).await
        }
        async fn get_checkpoint(
            &self,
            job_id: &str,
            coordinate: &Coordinate,
        ) -> anyhow::Result<Option<Checkpoint>> {
            self.0.get_checkpoint(job_id, coordinate).await
        }
        async fn upsert_phase_result(&self, job_id: &str, outcome: &PhaseOutcome) -> anyhow::Result<()> {
            self.0.upsert_phase_result(job_id, outcome).await
        }
        async fn phase_results(&self, job_id: &str) -> anyhow::Result<Vec<PhaseOutcome>> {
            self.0.phase_results(job_id).await
        }
        async fn insert_document(&self, document: &Document) -> anyhow::Result<()> {
            self.0.insert_document(document).await
        }
        async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
            self.0.get_document(id).await
        }
        async fn list_documents(&self) -> anyhow::Result<Vec<DocumentSummary>> {
            self.0.list_documents().await
        }
        async fn delete_document(&self, id: &str) -> anyhow::Result<bool> {
            self.0.delete_document(id).await
        }
    }

    fn two_phase_plan() -> ExecutionPlan {
        ExecutionPlan {
            name: "two".into(),
            ..ExecutionPlan::default()
        }
        .with_operation("first", OperationDef::new("FIRST step.", &[]))
        .with_operation("second", OperationDef::new("SECOND step.", &[]))
        .with_phase(PlanPhase::operation(1.0, "first", &[]))
        .with_phase(PlanPhase::operation(2.0, "second", &[1.0]))
    }

    #[tokio::test]
    async fn invalid_plan_is_rejected_without_a_job() {
        let manager = manager(Arc::new(ScriptedClient::new()));
        let plan = two_phase_plan().with_phase(PlanPhase::operation(3.0, "missing", &[]));

        let err = manager.submit(plan, vec![], false).await.unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(manager.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_document_is_rejected() {
        let manager = manager(Arc::new(ScriptedClient::new()));
        let err = manager
            .submit(two_phase_plan(), vec!["nope".into()], false)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn submitted_job_runs_to_completion() {
        let client = Arc::new(ScriptedClient::new());
        let manager = manager(client.clone());
        let doc = manager.upload_document("Essay", "DOC-TEXT").await.unwrap();

        let job_id = manager
            .submit(two_phase_plan(), vec![doc.id.clone()], false)
            .await
            .unwrap();
        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Completed);

        let report = manager.status(&job_id).await.unwrap();
        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(report.plan_name, "two");
        assert_eq!(report.checkpoints, 2);
        assert!(report.tokens.total() > 0);
        assert_eq!(report.completion_percentage, 100.0);
        assert!(report.phases.iter().all(|p| p.status == PhaseStatus::Completed));

        let results = manager.results(&job_id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(client.calls()[0].prompt.contains("DOC-TEXT"));

        let err = manager.cancel(&job_id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert!(!manager.is_active(&job_id).await);
    }

    #[tokio::test]
    async fn cancel_stops_later_phases() {
        let client = Arc::new(
            ScriptedClient::new().with_delay_for("FIRST", Duration::from_millis(200)),
        );
        let manager = manager(client.clone());

        let job_id = manager.submit(two_phase_plan(), vec![], false).await.unwrap();
        manager.cancel(&job_id).await.unwrap();

        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(client.calls_matching("SECOND"), 0);
        let report = manager.status(&job_id).await.unwrap();
        assert!(report.cancel_requested);
        assert_eq!(report.phases[1].status, PhaseStatus::Cancelled);
    }

    #[tokio::test]
    async fn stored_cancel_request_stops_the_worker() {
        let client = Arc::new(
            ScriptedClient::new().with_delay_for("FIRST", Duration::from_millis(1500)),
        );
        let manager = manager(client.clone());

        let job_id = manager.submit(two_phase_plan(), vec![], false).await.unwrap();
        // As another process would
        manager.store().request_cancel(&job_id).await.unwrap();

        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(client.calls_matching("SECOND"), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let manager = manager(Arc::new(ScriptedClient::new()));
        assert!(matches!(
            manager.status("missing").await,
            Err(JobError::JobNotFound(_))
        ));
        assert!(matches!(
            manager.cancel("missing").await,
            Err(JobError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn recovery_resumes_fresh_jobs_from_checkpoints() {
        let client = Arc::new(ScriptedClient::new());
        let manager = manager(client.clone());

        let mut job = JobRecord::new(two_phase_plan(), vec![], false);
        job.status = JobStatus::Running;
        manager.store().create_job(&job).await.unwrap();
        let result = CallResult {
            text: "FIRST-DONE".into(),
            model: "test-model".into(),
            prompt_tokens: 1,
            completion_tokens: 1,
            elapsed_ms: 1,
            chunked: false,
            chunk_count: 0,
            partial: false,
            attempts: 1,
        };
        manager
            .store()
            .upsert_checkpoint(
                &job.id,
                &Coordinate::new(&PhaseId::from(1.0), "first", 1, None),
                &result,
                "old-hash",
            )
            .await
            .unwrap();

        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.resumed, vec![job.id.clone()]);
        assert_eq!(manager.wait(&job.id).await.unwrap(), JobStatus::Completed);

        assert_eq!(client.calls_matching("FIRST step"), 0);
        let second = client.calls().pop().unwrap();
        assert!(second.prompt.contains("FIRST-DONE"));
        let status = manager.status(&job.id).await.unwrap();
        assert_eq!(status.phases[0].reused, 1);
        assert_eq!(status.stale_checkpoints, 1);
    }

    #[tokio::test]
    async fn recovery_fails_stale_jobs_and_honours_cancel_requests() {
        let manager = manager(Arc::new(ScriptedClient::new()));

        let mut stale = JobRecord::new(two_phase_plan(), vec![], false);
        stale.status = JobStatus::Running;
        stale.last_progress_at = Utc::now() - chrono::Duration::hours(2);
        manager.store().create_job(&stale).await.unwrap();

        let mut cancelled = JobRecord::new(two_phase_plan(), vec![], false);
        cancelled.status = JobStatus::Running;
        cancelled.cancel_requested = true;
        manager.store().create_job(&cancelled).await.unwrap();

        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.failed, vec![stale.id.clone()]);
        assert_eq!(report.cancelled, vec![cancelled.id.clone()]);
        assert!(report.resumed.is_empty());

        let stale_job = manager.status(&stale.id).await.unwrap();
        assert_eq!(stale_job.status, JobStatus::Failed);
        assert!(stale_job.error.unwrap().contains("No checkpoint progress"));
    }

    #[tokio::test]
    async fn recovery_skips_jobs_owned_by_another_process() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let owner_client = Arc::new(
            ScriptedClient::new().with_delay_for("FIRST", Duration::from_millis(600)),
        );
        let owner = manager_on(store.clone(), owner_client.clone());
        let job_id = owner.submit(two_phase_plan(), vec![], false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = store.get_job(&job_id).await.unwrap().unwrap();
        assert!(stored.heartbeat_at.is_some());

        // A second process sharing the database
        let other_client = Arc::new(ScriptedClient::new());
        let other = manager_on(store.clone(), other_client.clone());
        let report = other.recover_orphans().await.unwrap();
        assert_eq!(report.skipped, vec![job_id.clone()]);
        assert!(report.resumed.is_empty());

        assert_eq!(owner.wait(&job_id).await.unwrap(), JobStatus::Completed);
        assert_eq!(other_client.call_count(), 0);
        assert_eq!(owner_client.call_count(), 2);
        let finished = store.get_job(&job_id).await.unwrap().unwrap();
        assert!(finished.heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn recovery_resumes_jobs_whose_heartbeat_lapsed() {
        let client = Arc::new(ScriptedClient::new());
        let manager = manager(client.clone());

        let mut lapsed = JobRecord::new(two_phase_plan(), vec![], false);
        lapsed.status = JobStatus::Running;
        lapsed.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(5));
        manager.store().create_job(&lapsed).await.unwrap();

        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.resumed, vec![lapsed.id.clone()]);
        assert!(report.skipped.is_empty());
        assert_eq!(manager.wait(&lapsed.id).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn panicking_worker_fails_the_job_and_releases_waiters() {
        let store = Arc::new(PanicOnRunning(SqliteJobStore::open_in_memory().unwrap()));
        let manager = manager_on(store, Arc::new(ScriptedClient::new()));

        let job_id = manager.submit(two_phase_plan(), vec![], false).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), manager.wait(&job_id))
            .await
            .expect("wait returns once the worker dies")
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        assert!(!manager.is_active(&job_id).await);
        let report = manager.status(&job_id).await.unwrap();
        assert!(report.error.unwrap().contains("ended abnormally"));
    }

    #[tokio::test]
    async fn concurrent_waiters_all_see_the_final_status() {
        let client = Arc::new(ScriptedClient::new().with_delay(Duration::from_millis(100)));
        let manager = manager(client);

        let job_id = manager.submit(two_phase_plan(), vec![], false).await.unwrap();
        let (first, second) = tokio::join!(manager.wait(&job_id), manager.wait(&job_id));
        assert_eq!(first.unwrap(), JobStatus::Completed);
        assert_eq!(second.unwrap(), JobStatus::Completed);
        // Waiting on a finished job returns immediately
        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn document_in_use_cannot_be_deleted() {
        let manager = manager(Arc::new(ScriptedClient::new()));
        let doc = manager.upload_document("Essay", "text").await.unwrap();

        let job = JobRecord::new(two_phase_plan(), vec![doc.id.clone()], false);
        manager.store().create_job(&job).await.unwrap();

        let err = manager.delete_document(&doc.id).await.unwrap_err();
        assert!(matches!(err, JobError::DocumentInUse { .. }));

        manager
            .store()
            .update_job_status(&job.id, JobStatus::Completed, None)
            .await
            .unwrap();
        manager.delete_document(&doc.id).await.unwrap();
        assert!(matches!(
            manager.get_document(&doc.id).await,
            Err(JobError::DocumentNotFound(_))
        ));
    }
}
