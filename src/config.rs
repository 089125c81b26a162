//! Configuration for Dossier.
//!
//! Settings are read from `.dossier/dossier.toml`. Every field has a
//! default, so a missing file yields a working configuration. Values are
//! layered file → environment (`DOSSIER_*`, with `.env` loaded first) → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [service]
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "DOSSIER_API_KEY"
//! connect_timeout_secs = 10
//!
//! [models]
//! default = "gpt-4o-mini"
//! deep = "gpt-4o"
//!
//! [concurrency]
//! max_parallel_phases = 4
//! max_parallel_items = 2
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 1000
//! backoff_multiplier = 2.0
//! max_backoff_ms = 30000
//!
//! [timeouts]
//! stall_timeout_secs = 90
//! attempt_timeout_secs = 600
//!
//! [chunking]
//! threshold_chars = 60000
//! chunk_chars = 40000
//! overlap_chars = 2000
//!
//! [context]
//! default_budget_chars = 48000
//!
//! [recovery]
//! stale_after_secs = 1800
//! heartbeat_timeout_secs = 15
//! resume_on_start = true
//!
//! [storage]
//! db_path = ".dossier/dossier.db"
//!
//! [logging]
//! level = "info"
//! json = false
//! dir = ".dossier/logs"
//! ```
//!
//! Both concurrency limits should stay below the completion service's own
//! concurrent-request limit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::completion::{ChunkConfig, ModelSelector, RetryPolicy};
use crate::context::DEFAULT_BUDGET_CHARS;
use crate::jobs::ManagerConfig;

/// Name of the project-local configuration directory.
pub const DOSSIER_DIR: &str = ".dossier";
/// Name of the configuration file inside [`DOSSIER_DIR`].
pub const CONFIG_FILE: &str = "dossier.toml";

/// Completion service endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub connect_timeout_secs: u64,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "DOSSIER_API_KEY".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Model defaults. A depth-specific model wins over `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    pub default: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep: Option<String>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            default: "gpt-4o-mini".to_string(),
            surface: None,
            standard: None,
            deep: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    /// Phases in flight per job
    pub max_parallel_phases: usize,
    /// Items in flight per per-item phase
    pub max_parallel_items: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        Self {
            max_parallel_phases: manager.max_parallel_phases,
            max_parallel_items: manager.max_parallel_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts per request, the first included
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Keep salvaged partial text when retries run out
    pub accept_partial: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            backoff_multiplier: policy.multiplier,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            accept_partial: policy.accept_partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    /// Abort an attempt after this long without streamed data
    pub stall_timeout_secs: u64,
    /// Hard cap on one attempt
    pub attempt_timeout_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            stall_timeout_secs: crate::completion::caller::DEFAULT_STALL_TIMEOUT.as_secs(),
            attempt_timeout_secs: crate::completion::caller::DEFAULT_ATTEMPT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSection {
    pub threshold_chars: usize,
    pub chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingSection {
    fn default() -> Self {
        let chunking = ChunkConfig::default();
        Self {
            threshold_chars: chunking.threshold_chars,
            chunk_chars: chunking.chunk_chars,
            overlap_chars: chunking.overlap_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// Upstream context cap for phases without their own
    pub default_budget_chars: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            default_budget_chars: DEFAULT_BUDGET_CHARS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// Running jobs idle longer than this are failed instead of resumed
    pub stale_after_secs: u64,
    /// Jobs whose worker heartbeat is younger than this belong to a live
    /// process and are left alone
    pub heartbeat_timeout_secs: u64,
    /// Recover orphaned jobs when the server starts
    pub resume_on_start: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            stale_after_secs: ManagerConfig::default().stale_after.as_secs(),
            heartbeat_timeout_secs: ManagerConfig::default().heartbeat_timeout.as_secs(),
            resume_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// SQLite database; relative paths resolve against the project directory
    pub db_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DOSSIER_DIR).join("dossier.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// JSON lines on stdout instead of text
    pub json: bool,
    /// Directory for daily-rolling JSON log files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

/// The complete dossier.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DossierToml {
    #[serde(default)]
    pub service: ServiceSection,
    #[serde(default)]
    pub models: ModelsSection,
    #[serde(default)]
    pub concurrency: ConcurrencySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub chunking: ChunkingSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl DossierToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse dossier.toml")
    }

    /// Load from `<dossier_dir>/dossier.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(dossier_dir: &Path) -> Result<Self> {
        let config_path = dossier_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize dossier.toml")
    }

    /// Apply `DOSSIER_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Vec<String> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `DOSSIER_*` overrides read through `lookup`. Returns warnings
    /// for values that could not be parsed; those values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(url) = lookup("DOSSIER_BASE_URL") {
            self.service.base_url = url;
        }
        if let Some(model) = lookup("DOSSIER_DEFAULT_MODEL") {
            self.models.default = model;
        }
        if let Some(path) = lookup("DOSSIER_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("DOSSIER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = lookup("DOSSIER_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }

        parse_override(&lookup, "DOSSIER_LOG_JSON", &mut self.logging.json, &mut warnings);
        parse_override(
            &lookup,
            "DOSSIER_MAX_PARALLEL_PHASES",
            &mut self.concurrency.max_parallel_phases,
            &mut warnings,
        );
        parse_override(
            &lookup,
            "DOSSIER_MAX_PARALLEL_ITEMS",
            &mut self.concurrency.max_parallel_items,
            &mut warnings,
        );
        parse_override(
            &lookup,
            "DOSSIER_MAX_ATTEMPTS",
            &mut self.retry.max_attempts,
            &mut warnings,
        );
        parse_override(
            &lookup,
            "DOSSIER_STALL_TIMEOUT_SECS",
            &mut self.timeouts.stall_timeout_secs,
            &mut warnings,
        );

        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.service.base_url.trim().is_empty() {
            warnings.push("service.base_url is empty".to_string());
        }
        if self.models.default.trim().is_empty() {
            warnings.push("models.default is empty".to_string());
        }

        if self.concurrency.max_parallel_phases == 0 {
            warnings.push(
                "concurrency.max_parallel_phases is 0; it must be at least 1 (1 is used)"
                    .to_string(),
            );
        }
        if self.concurrency.max_parallel_items == 0 {
            warnings.push(
                "concurrency.max_parallel_items is 0; it must be at least 1 (1 is used)"
                    .to_string(),
            );
        }

        if self.retry.max_attempts == 0 {
            warnings.push("retry.max_attempts is 0; one attempt is always made".to_string());
        }
        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            warnings.push(format!(
                "retry.backoff_multiplier {} is below 1.0; 1.0 is used",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            warnings.push(format!(
                "retry.max_backoff_ms ({}) is smaller than retry.initial_backoff_ms ({})",
                self.retry.max_backoff_ms, self.retry.initial_backoff_ms
            ));
        }

        if self.timeouts.stall_timeout_secs == 0 || self.timeouts.attempt_timeout_secs == 0 {
            warnings.push("timeouts must be greater than 0".to_string());
        } else if self.timeouts.stall_timeout_secs > self.timeouts.attempt_timeout_secs {
            warnings.push(format!(
                "timeouts.stall_timeout_secs ({}) exceeds timeouts.attempt_timeout_secs ({})",
                self.timeouts.stall_timeout_secs, self.timeouts.attempt_timeout_secs
            ));
        }

        if self.chunking.chunk_chars == 0 {
            warnings.push("chunking.chunk_chars is 0".to_string());
        } else if self.chunking.overlap_chars >= self.chunking.chunk_chars {
            warnings.push(format!(
                "chunking.overlap_chars ({}) must be smaller than chunking.chunk_chars ({})",
                self.chunking.overlap_chars, self.chunking.chunk_chars
            ));
        }
        if self.chunking.threshold_chars < self.chunking.chunk_chars {
            warnings.push(format!(
                "chunking.threshold_chars ({}) is smaller than chunking.chunk_chars ({})",
                self.chunking.threshold_chars, self.chunking.chunk_chars
            ));
        }

        if self.context.default_budget_chars < MIN_USEFUL_BUDGET {
            warnings.push(format!(
                "context.default_budget_chars ({}) cannot hold a single tagged segment",
                self.context.default_budget_chars
            ));
        }

        warnings
    }

    pub fn model_selector(&self) -> ModelSelector {
        ModelSelector {
            default: self.models.default.clone(),
            surface: self.models.surface.clone(),
            standard: self.models.standard.clone(),
            deep: self.models.deep.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_initial_backoff(Duration::from_millis(self.retry.initial_backoff_ms))
            .with_multiplier(self.retry.backoff_multiplier)
            .with_max_backoff(Duration::from_millis(self.retry.max_backoff_ms))
            .with_accept_partial(self.retry.accept_partial)
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig::new(
            self.chunking.threshold_chars,
            self.chunking.chunk_chars,
            self.chunking.overlap_chars,
        )
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_parallel_phases: self.concurrency.max_parallel_phases.max(1),
            max_parallel_items: self.concurrency.max_parallel_items.max(1),
            context_budget: self.context.default_budget_chars,
            stale_after: Duration::from_secs(self.recovery.stale_after_secs),
            heartbeat_timeout: Duration::from_secs(self.recovery.heartbeat_timeout_secs.max(2)),
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.stall_timeout_secs.max(1))
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.attempt_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.service.connect_timeout_secs)
    }
}

/// Provenance tags alone take roughly this many characters.
const MIN_USEFUL_BUDGET: usize = 128;

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
    warnings: &mut Vec<String>,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warnings.push(format!("Ignoring {}={:?}: not a valid value", key, raw)),
        }
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct DossierConfig {
    pub project_dir: PathBuf,
    pub dossier_dir: PathBuf,
    pub toml: DossierToml,
    /// Warnings raised while layering, such as unparsable env values
    pub load_warnings: Vec<String>,
}

impl DossierConfig {
    /// Load `.dossier/dossier.toml` under `project_dir` and apply the
    /// environment. `.env` in the project directory is loaded first.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let dossier_dir = project_dir.join(DOSSIER_DIR);

        // A missing .env is fine
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let mut toml = DossierToml::load_or_default(&dossier_dir)?;
        let load_warnings = toml.apply_env();

        Ok(Self {
            project_dir,
            dossier_dir,
            toml,
            load_warnings,
        })
    }

    /// Apply CLI overrides on top of file and environment.
    pub fn with_cli_overrides(
        mut self,
        db_path: Option<PathBuf>,
        max_parallel_phases: Option<usize>,
        max_parallel_items: Option<usize>,
        model: Option<String>,
    ) -> Self {
        if let Some(path) = db_path {
            self.toml.storage.db_path = path;
        }
        if let Some(n) = max_parallel_phases {
            self.toml.concurrency.max_parallel_phases = n;
        }
        if let Some(n) = max_parallel_items {
            self.toml.concurrency.max_parallel_items = n;
        }
        if let Some(model) = model {
            self.toml.models.default = model;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.dossier_dir.join(CONFIG_FILE)
    }

    /// Database path, resolved against the project directory.
    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.toml.storage.db_path)
    }

    /// Log directory, resolved against the project directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.dir.as_deref().map(|d| self.resolve(d))
    }

    /// API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.toml.service.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }

    /// All warnings: layering problems plus validation.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.load_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }

    /// Write a default `dossier.toml` unless one exists. Returns the path
    /// and whether a file was written.
    pub fn init(project_dir: &Path) -> Result<(PathBuf, bool)> {
        let dossier_dir = project_dir.join(DOSSIER_DIR);
        std::fs::create_dir_all(&dossier_dir)
            .with_context(|| format!("Failed to create {}", dossier_dir.display()))?;
        let path = dossier_dir.join(CONFIG_FILE);
        if path.exists() {
            return Ok((path, false));
        }
        DossierToml::default().save(&path)?;
        Ok((path, true))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}
