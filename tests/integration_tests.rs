//! Integration tests for Dossier
//!
//! These tests drive the CLI binary and the job engine end to end.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a dossier Command
fn dossier() -> Command {
    let mut cmd = cargo_bin_cmd!("dossier");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

const VALID_PLAN: &str = r#"{
  "name": "essay review",
  "operations": {
    "survey": {"prompt": "Survey the documents.", "stances": ["literal", "skeptical"]},
    "critique": {"prompt": "Critique each claim."},
    "conclude": {"prompt": "Write the conclusion."}
  },
  "chains": {
    "review": {"operations": ["survey", "critique"], "pass_context": true}
  },
  "phases": [
    {"id": 1, "operation": "survey"},
    {"id": 1.5, "chain": "review"},
    {"id": 2, "operation": "critique", "depends_on": [1, 1.5],
     "scope": "per_item", "item_source": {"kind": "documents"}, "item_concurrency": 2,
     "synthesize": true},
    {"id": 3, "operation": "conclude", "depends_on": [2]}
  ]
}"#;

const CYCLIC_PLAN: &str = r#"{
  "operations": {"op": {"prompt": "p"}},
  "phases": [
    {"id": 1, "operation": "op", "depends_on": [2]},
    {"id": 2, "operation": "op", "depends_on": [1]}
  ]
}"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_dossier_help() {
        dossier()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"));
    }

    #[test]
    fn test_dossier_version() {
        dossier().arg("--version").assert().success();
    }

    #[test]
    fn test_jobs_empty() {
        let dir = create_temp_project();
        dossier()
            .current_dir(dir.path())
            .arg("jobs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No jobs."));
    }

    #[test]
    fn test_status_unknown_job_fails() {
        let dir = create_temp_project();
        dossier()
            .current_dir(dir.path())
            .args(["status", "no-such-job"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();

        dossier()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created dossier.toml"));

        let content = fs::read_to_string(dir.path().join(".dossier/dossier.toml")).unwrap();
        assert!(content.contains("[concurrency]"));
        assert!(content.contains("max_parallel_items"));

        dossier()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        dossier()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No dossier.toml found"))
            .stdout(predicate::str::contains("max_parallel_phases = 4"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".dossier")).unwrap();
        fs::write(
            dir.path().join(".dossier/dossier.toml"),
            "[chunking]\nchunk_chars = 100\noverlap_chars = 100\n",
        )
        .unwrap();

        dossier()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("overlap_chars"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = create_temp_project();
        dossier()
            .current_dir(dir.path())
            .env("DOSSIER_MAX_PARALLEL_ITEMS", "7")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_parallel_items = 7"));
    }
}

// =============================================================================
// Plan Validation and Dry Runs
// =============================================================================

mod plans {
    use super::*;

    #[test]
    fn test_validate_prints_waves() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, VALID_PLAN).unwrap();

        dossier()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&plan)
            .assert()
            .success()
            .stdout(predicate::str::contains("4 phase(s)"))
            .stdout(predicate::str::contains("Wave 0"))
            .stdout(predicate::str::contains("Wave 2"))
            .stdout(predicate::str::contains("per item + synthesis"));
    }

    #[test]
    fn test_validate_accepts_yaml() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.yaml");
        fs::write(
            &plan,
            "operations:\n  op:\n    prompt: Analyze.\nphases:\n  - id: 1\n    operation: op\n  - id: \"1.5\"\n    operation: op\n    depends_on: [1]\n",
        )
        .unwrap();

        dossier()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&plan)
            .assert()
            .success()
            .stdout(predicate::str::contains("2 phase(s)"));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, CYCLIC_PLAN).unwrap();

        dossier()
            .current_dir(dir.path())
            .arg("validate")
            .arg(&plan)
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid"));
    }

    #[test]
    fn test_dry_run_completes_every_phase() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, VALID_PLAN).unwrap();
        fs::write(dir.path().join("first.md"), "The first essay.").unwrap();
        fs::write(dir.path().join("second.md"), "The second essay.").unwrap();

        dossier()
            .current_dir(dir.path())
            .arg("run")
            .arg(&plan)
            .args(["--doc", "first.md", "--doc", "second.md", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Status: completed"))
            .stdout(predicate::str::contains("dry-run"))
            .stdout(predicate::str::contains("Phase 3"));

        // Dry runs never touch the configured database
        assert!(!dir.path().join(".dossier/dossier.db").exists());
    }

    #[test]
    fn test_dry_run_json_output() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, VALID_PLAN).unwrap();
        fs::write(dir.path().join("doc.md"), "Only essay.").unwrap();

        let output = dossier()
            .current_dir(dir.path())
            .arg("run")
            .arg(&plan)
            .args(["--doc", "doc.md", "--dry-run", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());

        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(value["report"]["status"], "completed");
        assert_eq!(value["results"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_run_rejects_invalid_plan_without_creating_job() {
        let dir = create_temp_project();
        let plan = dir.path().join("plan.json");
        fs::write(&plan, CYCLIC_PLAN).unwrap();

        dossier()
            .current_dir(dir.path())
            .arg("run")
            .arg(&plan)
            .arg("--dry-run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cycle"));
    }
}

// =============================================================================
// Engine Scenarios
// =============================================================================

mod engine {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use dossier::completion::{
        CallOptions, ChunkConfig, CompletionCaller, CompletionClient, CompletionRequest,
        CompletionResponse, Heartbeat, ModelSelector, Prompt, RetryPolicy, ScriptedClient,
        ScriptedReply, chunk_text,
    };
    use dossier::dag::{DagConfig, DagState, PhaseOutcome, PhaseStatus, WorkflowRunner, resolve};
    use dossier::errors::CallError;
    use dossier::jobs::{
        JobManager, JobRecord, JobStatus, JobStore, ManagerConfig, SqliteJobStore,
    };
    use dossier::plan::{Depth, ExecutionPlan, ItemSource, ListItem, OperationDef, PhaseId, PlanPhase};
    use dossier::runner::RunContext;

    fn manager_with(client: Arc<dyn CompletionClient>, store: Arc<dyn JobStore>) -> JobManager {
        let caller = Arc::new(CompletionCaller::new(client, ModelSelector::new("test-model")));
        JobManager::new(store, caller, ManagerConfig::default())
    }

    fn memory_store() -> Arc<dyn JobStore> {
        Arc::new(SqliteJobStore::open_in_memory().unwrap())
    }

    fn list_items(texts: &[&str]) -> ItemSource {
        ItemSource::List {
            items: texts
                .iter()
                .map(|t| ListItem {
                    key: None,
                    text: t.to_string(),
                })
                .collect(),
        }
    }

    /// 1 and 1.5 independent; 2 per item over three items with a pool of
    /// two; 3 after 2.
    fn four_phase_plan() -> ExecutionPlan {
        ExecutionPlan {
            name: "four".into(),
            ..ExecutionPlan::default()
        }
        .with_operation("left", OperationDef::new("WAVE-ONE left survey.", &[]))
        .with_operation("right", OperationDef::new("WAVE-ONE right survey.", &[]))
        .with_operation("item", OperationDef::new("ITEM-WORK examine this item.", &[]))
        .with_operation("final", OperationDef::new("FINAL-WORK conclude.", &[]))
        .with_phase(PlanPhase::operation(1.0, "left", &[]))
        .with_phase(PlanPhase::operation(1.5, "right", &[]))
        .with_phase(
            PlanPhase::operation(2.0, "item", &[1.0, 1.5])
                .per_item(list_items(&["alpha item", "beta item", "gamma item"]))
                .with_item_concurrency(2),
        )
        .with_phase(PlanPhase::operation(3.0, "final", &[2.0]))
    }

    fn outcome<'a>(results: &'a [PhaseOutcome], id: f64) -> &'a PhaseOutcome {
        let id = PhaseId::from(id);
        results.iter().find(|o| o.phase == id).unwrap()
    }

    #[tokio::test]
    async fn test_four_phase_scenario_order_and_bounds() {
        let client = Arc::new(ScriptedClient::new().with_delay(Duration::from_millis(60)));
        let manager = manager_with(client.clone(), memory_store());

        let job_id = manager.submit(four_phase_plan(), vec![], false).await.unwrap();
        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Completed);

        // Every phase ran exactly once; items once each
        assert_eq!(client.calls_matching("WAVE-ONE"), 2);
        assert_eq!(client.calls_matching("ITEM-WORK"), 3);
        assert_eq!(client.calls_matching("FINAL-WORK"), 1);

        // 1 and 1.5 overlapped; items never exceeded the pool
        assert_eq!(client.max_overlap("WAVE-ONE"), 2);
        assert_eq!(client.max_overlap("ITEM-WORK"), 2);

        let calls = client.calls();
        let last_wave_one = calls
            .iter()
            .filter(|c| c.prompt.contains("WAVE-ONE"))
            .map(|c| c.finished)
            .max()
            .unwrap();
        let first_item = calls
            .iter()
            .filter(|c| c.prompt.contains("ITEM-WORK"))
            .map(|c| c.started)
            .min()
            .unwrap();
        let last_item = calls
            .iter()
            .filter(|c| c.prompt.contains("ITEM-WORK"))
            .map(|c| c.finished)
            .max()
            .unwrap();
        let final_call = calls.iter().find(|c| c.prompt.contains("FINAL-WORK")).unwrap();
        assert!(first_item >= last_wave_one);
        assert!(final_call.started >= last_item);

        // 3 saw all three item outputs
        let results = manager.results(&job_id).await.unwrap();
        let items = &outcome(&results, 2.0).items;
        assert_eq!(items.len(), 3);
        for item in items {
            assert!(final_call.prompt.contains(item.output.as_deref().unwrap()));
        }
        assert_eq!(outcome(&results, 3.0).status, PhaseStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_coordinates() {
        // Uninterrupted reference run
        let reference_client = Arc::new(ScriptedClient::new());
        let reference_store = memory_store();
        let reference = manager_with(reference_client.clone(), reference_store.clone());
        let job_id = reference.submit(four_phase_plan(), vec![], false).await.unwrap();
        reference.wait(&job_id).await.unwrap();
        let snapshot = reference_store.load_job(&job_id).await.unwrap().unwrap();
        let expected = reference.results(&job_id).await.unwrap();
        let total_calls = reference_client.call_count();

        // A second store holding the job as an interrupted process left it
        let store = memory_store();
        let mut job = snapshot.job.clone();
        job.status = JobStatus::Running;
        job.heartbeat_at = None;
        store.create_job(&job).await.unwrap();
        let written: Vec<_> = snapshot
            .checkpoints
            .iter()
            .filter(|c| {
                c.coordinate.phase == "1"
                    || c.coordinate.phase == "1.5"
                    || (c.coordinate.phase == "2" && c.coordinate.item == "1")
            })
            .collect();
        assert_eq!(written.len(), 3);
        for checkpoint in &written {
            store
                .upsert_checkpoint(
                    &job.id,
                    &checkpoint.coordinate,
                    &checkpoint.result,
                    &checkpoint.input_hash,
                )
                .await
                .unwrap();
        }

        let client = Arc::new(ScriptedClient::new());
        let manager = manager_with(client.clone(), store.clone());
        let report = manager.recover_orphans().await.unwrap();
        assert_eq!(report.resumed, vec![job.id.clone()]);
        assert_eq!(manager.wait(&job.id).await.unwrap(), JobStatus::Completed);

        assert_eq!(client.call_count(), total_calls - written.len());
        assert_eq!(client.calls_matching("WAVE-ONE"), 0);
        assert_eq!(client.calls_matching("alpha item"), 0);

        let resumed = manager.results(&job.id).await.unwrap();
        for expected_outcome in &expected {
            let got = resumed.iter().find(|o| o.phase == expected_outcome.phase).unwrap();
            assert_eq!(got.status, expected_outcome.status);
            assert_eq!(got.output, expected_outcome.output);
            let outputs = |o: &PhaseOutcome| {
                o.items
                    .iter()
                    .map(|i| (i.key.clone(), i.output.clone()))
                    .collect::<Vec<_>>()
            };
            assert_eq!(outputs(got), outputs(expected_outcome));
        }
        let status = manager.status(&job.id).await.unwrap();
        assert_eq!(status.stale_checkpoints, 0);
    }

    #[tokio::test]
    async fn test_oversized_document_is_chunked_with_one_synthesis() {
        let chunking = ChunkConfig::new(500, 300, 50);
        let client = Arc::new(ScriptedClient::new());
        let caller = Arc::new(
            CompletionCaller::new(client.clone(), ModelSelector::new("test-model"))
                .with_chunking(chunking.clone()),
        );
        let manager = JobManager::new(memory_store(), caller, ManagerConfig::default());

        let content: String = (0..120).map(|i| format!("sentence {:03}. ", i)).collect();
        let document = manager.upload_document("Long", &content).await.unwrap();
        let plan = ExecutionPlan::default()
            .with_operation("digest", OperationDef::new("Digest the text.", &[]))
            .with_phase(PlanPhase::operation(1.0, "digest", &[]));

        let job_id = manager.submit(plan, vec![document.id], false).await.unwrap();
        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Completed);

        let input = format!("### Document: Long\n{}", content);
        let chunks = chunk_text(&input, &chunking);
        assert!(chunks.len() > 1);

        // Union covers the input; only the overlap is duplicated
        let total: usize = chunks.iter().map(|c| c.text.chars().count()).sum();
        assert_eq!(total, input.chars().count() + 50 * (chunks.len() - 1));
        assert_eq!(chunks.first().unwrap().start, 0);
        assert_eq!(chunks.last().unwrap().end, input.chars().count());

        assert_eq!(client.call_count(), chunks.len() + 1);
        let status = manager.status(&job_id).await.unwrap();
        assert_eq!(status.checkpoints, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_follows_backoff_schedule() {
        let client = Arc::new(ScriptedClient::new().script(
            "FLAKY",
            vec![
                ScriptedReply::transient("503"),
                ScriptedReply::transient("503"),
                ScriptedReply::text("finally"),
            ],
        ));
        let caller = CompletionCaller::new(client.clone(), ModelSelector::new("test-model"))
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_initial_backoff(Duration::from_millis(100))
                    .with_multiplier(2.0),
            );

        let result = caller
            .call(
                &Prompt::new("FLAKY task", "input"),
                None,
                &CallOptions::new(Depth::Standard, CancellationToken::new()),
            )
            .await
            .unwrap();
        assert_eq!(result.text, "finally");
        assert_eq!(result.attempts, 3);

        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1].started - calls[0].finished;
        let second_gap = calls[2].started - calls[1].finished;
        let tolerance = Duration::from_millis(5);
        assert!(first_gap >= Duration::from_millis(100) && first_gap <= Duration::from_millis(100) + tolerance);
        assert!(second_gap >= Duration::from_millis(200) && second_gap <= Duration::from_millis(200) + tolerance);
    }

    /// Cancels the job as soon as a matching request has been answered.
    struct CancelAfter {
        inner: ScriptedClient,
        marker: &'static str,
        token: CancellationToken,
    }

    #[async_trait]
    impl CompletionClient for CancelAfter {
        async fn complete(
            &self,
            request: &CompletionRequest,
            heartbeat: &Heartbeat,
        ) -> Result<CompletionResponse, CallError> {
            let response = self.inner.complete(request, heartbeat).await;
            if request.prompt.contains(self.marker) {
                self.token.cancel();
            }
            response
        }
    }

    #[tokio::test]
    async fn test_cancel_between_phases_prevents_dependent_launch() {
        let plan = ExecutionPlan::default()
            .with_operation("a", OperationDef::new("A-WORK first.", &[]))
            .with_operation("b", OperationDef::new("B-WORK second.", &[]))
            .with_phase(PlanPhase::operation(1.0, "a", &[]))
            .with_phase(PlanPhase::operation(2.0, "b", &[1.0]));

        let token = CancellationToken::new();
        let client = Arc::new(CancelAfter {
            inner: ScriptedClient::new(),
            marker: "A-WORK",
            token: token.clone(),
        });
        let store = memory_store();
        let job = JobRecord::new(plan.clone(), vec![], false);
        store.create_job(&job).await.unwrap();

        let caller = Arc::new(CompletionCaller::new(client.clone(), ModelSelector::new("test-model")));
        let ctx = RunContext::new(&job.id, store.clone(), caller).with_cancel(token);
        let summary = WorkflowRunner::new(ctx, DagConfig::default())
            .execute(resolve(&plan).unwrap(), Vec::new())
            .await
            .unwrap();

        assert_eq!(summary.state, DagState::Cancelled);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(client.inner.calls_matching("B-WORK"), 0);

        let results = store.phase_results(&job.id).await.unwrap();
        assert_eq!(outcome(&results, 1.0).status, PhaseStatus::Completed);
        assert_eq!(outcome(&results, 2.0).status, PhaseStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_sink_the_job() {
        let client = Arc::new(
            ScriptedClient::new().script("beta item", vec![ScriptedReply::permanent("refused")]),
        );
        let manager = manager_with(client.clone(), memory_store());

        let job_id = manager.submit(four_phase_plan(), vec![], false).await.unwrap();
        assert_eq!(manager.wait(&job_id).await.unwrap(), JobStatus::Completed);

        let results = manager.results(&job_id).await.unwrap();
        assert_eq!(
            outcome(&results, 2.0).status,
            PhaseStatus::CompletedWithErrors { failed_items: 1 }
        );
        assert_eq!(outcome(&results, 3.0).status, PhaseStatus::Completed);
        assert_eq!(client.calls_matching("FINAL-WORK"), 1);
    }
}
