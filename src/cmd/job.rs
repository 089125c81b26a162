//! Job commands: `dossier run`, `status`, `results`, `cancel`, `recover`, `jobs`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use dossier::config::DossierConfig;
use dossier::dag::{PhaseOutcome, PhaseStatus};
use dossier::jobs::{JobStatus, JobStatusReport};
use dossier::plan::ExecutionPlan;

use super::build_manager;

pub struct RunOptions {
    pub fail_fast: bool,
    pub dry_run: bool,
    pub max_parallel: Option<usize>,
    pub max_items: Option<usize>,
    pub json: bool,
}

pub async fn cmd_run(
    config: DossierConfig,
    plan_path: &Path,
    docs: &[PathBuf],
    options: RunOptions,
) -> Result<()> {
    let plan = ExecutionPlan::load(plan_path)?;
    let config = config.with_cli_overrides(None, options.max_parallel, options.max_items, None);

    if !options.dry_run && config.api_key().is_none() {
        warn!(
            env = %config.toml.service.api_key_env,
            "No API key set; requests are sent unauthenticated"
        );
    }
    let manager = build_manager(&config, options.dry_run)?;

    let mut document_ids = Vec::with_capacity(docs.len());
    for path in docs {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read document: {}", path.display()))?;
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let document = manager.upload_document(&title, &content).await?;
        document_ids.push(document.id);
    }

    let job_id = manager.submit(plan, document_ids, options.fail_fast).await?;
    info!(job_id = %job_id, dry_run = options.dry_run, "Job started");

    let status = tokio::select! {
        status = manager.wait(&job_id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupted; letting running phases finish");
            manager.cancel(&job_id).await?;
            manager.wait(&job_id).await?
        }
    };

    let report = manager.status(&job_id).await?;
    let results = manager.results(&job_id).await?;
    if options.json {
        let out = serde_json::json!({ "report": report, "results": results });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&report);
        print_results(&results);
    }

    if status == JobStatus::Failed {
        bail!(
            "Job {} failed: {}",
            job_id,
            report.error.as_deref().unwrap_or("see phase results")
        );
    }
    Ok(())
}

pub async fn cmd_status(config: &DossierConfig, job_id: &str, json: bool) -> Result<()> {
    let manager = build_manager(config, false)?;
    let report = manager.status(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

pub async fn cmd_results(config: &DossierConfig, job_id: &str, json: bool) -> Result<()> {
    let manager = build_manager(config, false)?;
    let results = manager.results(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results(&results);
    }
    Ok(())
}

pub async fn cmd_cancel(config: &DossierConfig, job_id: &str) -> Result<()> {
    let manager = build_manager(config, false)?;
    let status = manager.cancel(job_id).await?;
    println!("Cancellation requested for job {} (was {}).", job_id, status);
    println!("Running phases finish; no further phases start. An orphaned job is finalised by `dossier recover`.");
    Ok(())
}

pub async fn cmd_recover(config: &DossierConfig) -> Result<()> {
    let manager = build_manager(config, false)?;
    let report = manager.recover_orphans().await?;

    for id in &report.failed {
        println!("Failed   {}", id);
    }
    for id in &report.cancelled {
        println!("Cancelled {}", id);
    }
    for id in &report.skipped {
        println!("Skipped  {} (owned by a live worker)", id);
    }
    if report.resumed.is_empty() {
        println!("No jobs to resume.");
        return Ok(());
    }

    for id in &report.resumed {
        println!("Resuming {}", id);
    }
    for id in &report.resumed {
        let status = manager.wait(id).await?;
        println!("Job {} finished: {}", id, status);
    }
    Ok(())
}

pub async fn cmd_jobs(config: &DossierConfig) -> Result<()> {
    let manager = build_manager(config, false)?;
    let jobs = manager.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10} {:>3} phase(s)  {}  {}",
            job.id,
            job.status.to_string(),
            job.phases,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.plan_name
        );
    }
    Ok(())
}

fn print_report(report: &JobStatusReport) {
    println!();
    println!("Job {} ({})", report.job_id, report.plan_name);
    println!(
        "Status: {}{}",
        report.status,
        if report.cancel_requested && !report.status.is_terminal() {
            " (cancel requested)"
        } else {
            ""
        }
    );
    if let Some(error) = &report.error {
        println!("Error: {}", error);
    }
    println!(
        "Progress: {:.0}%  checkpoints: {}  tokens: {}",
        report.completion_percentage,
        report.checkpoints,
        report.tokens.total()
    );
    if report.stale_checkpoints > 0 {
        println!(
            "Note: {} checkpoint(s) were reused although their prompt changed",
            report.stale_checkpoints
        );
    }
    println!();
    for phase in &report.phases {
        let items = if phase.items_completed + phase.items_failed > 0 {
            format!(
                "  items {} ok / {} failed",
                phase.items_completed, phase.items_failed
            )
        } else {
            String::new()
        };
        println!(
            "  {:>5}  {:<22} {}{}",
            phase.phase.to_string(),
            status_label(&phase.status),
            phase.name,
            items
        );
    }
    println!();
}

fn print_results(results: &[PhaseOutcome]) {
    for outcome in results {
        println!(
            "── Phase {} {} [{}] ──",
            outcome.phase,
            outcome.name,
            status_label(&outcome.status)
        );
        if let Some(error) = &outcome.error {
            println!("error: {}", error);
        }
        for item in outcome.failed_items() {
            println!(
                "item {} failed: {}",
                item.key,
                item.error.as_deref().unwrap_or("unknown error")
            );
        }
        if let Some(output) = &outcome.output {
            println!("{}", output);
        } else {
            for item in outcome.successful_items() {
                println!("[item {}]", item.key);
                println!("{}", item.output.as_deref().unwrap_or_default());
            }
        }
        println!();
    }
}

fn status_label(status: &PhaseStatus) -> String {
    match status {
        PhaseStatus::CompletedWithErrors { failed_items } => {
            format!("completed ({} item(s) failed)", failed_items)
        }
        PhaseStatus::Blocked { by } => format!("blocked by {}", by),
        PhaseStatus::Failed { .. } => "failed".to_string(),
        other => other.label().to_string(),
    }
}
