//! CLI command implementations.
//!
//! | Module   | Commands handled                                |
//! |----------|-------------------------------------------------|
//! | `serve`  | `Serve`                                         |
//! | `plan`   | `Validate`                                      |
//! | `job`    | `Run`, `Status`, `Results`, `Cancel`, `Recover`, `Jobs` |
//! | `config` | `Config`                                        |

pub mod config;
pub mod job;
pub mod plan;
pub mod serve;

pub use config::{cmd_config, cmd_config_init};
pub use job::{RunOptions, cmd_cancel, cmd_jobs, cmd_recover, cmd_results, cmd_run, cmd_status};
pub use plan::cmd_validate;
pub use serve::cmd_serve;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use dossier::completion::{CompletionCaller, CompletionClient, HttpCompletionClient, ScriptedClient};
use dossier::config::DossierConfig;
use dossier::jobs::{JobManager, JobStore, SqliteJobStore};
use dossier::telemetry::{self, TelemetryGuard};

use super::Cli;

/// File → environment → CLI.
pub fn load_config(cli: &Cli, project_dir: &Path) -> Result<DossierConfig> {
    let config = DossierConfig::new(project_dir.to_path_buf())?.with_cli_overrides(
        cli.db.clone(),
        None,
        None,
        cli.model.clone(),
    );
    Ok(config)
}

pub fn init_telemetry(config: &DossierConfig, verbose: bool) -> Result<TelemetryGuard> {
    let mut logging = config.toml.logging.clone();
    if verbose {
        logging.level = "debug".to_string();
    }
    let guard = telemetry::init(&logging, config.log_dir().as_deref())?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    Ok(guard)
}

/// Build a manager over the configured store and completion service. A dry
/// run uses an in-memory store and the scripted client instead.
pub fn build_manager(config: &DossierConfig, dry_run: bool) -> Result<JobManager> {
    let toml = &config.toml;

    let (store, client): (Arc<dyn JobStore>, Arc<dyn CompletionClient>) = if dry_run {
        (
            Arc::new(SqliteJobStore::open_in_memory()?),
            Arc::new(ScriptedClient::new().with_prefix("dry-run")),
        )
    } else {
        let db_path = config.db_path();
        let store = SqliteJobStore::open(&db_path)
            .with_context(|| format!("Failed to open job store at {}", db_path.display()))?;
        let client = HttpCompletionClient::new(
            &toml.service.base_url,
            config.api_key(),
            toml.connect_timeout(),
        )?;
        (Arc::new(store), Arc::new(client))
    };

    let caller = CompletionCaller::new(client, toml.model_selector())
        .with_retry(toml.retry_policy())
        .with_chunking(toml.chunk_config())
        .with_timeouts(toml.stall_timeout(), toml.attempt_timeout());

    Ok(JobManager::new(store, Arc::new(caller), toml.manager_config()))
}
