use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "dossier")]
#[command(version, about = "Plan-driven document analysis engine")]
pub struct Cli {
    /// Log at debug level (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// SQLite database path. Overrides dossier.toml.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Default model. Overrides dossier.toml.
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value = "3150")]
        port: u16,

        /// Enable dev mode (CORS permissive)
        #[arg(long)]
        dev: bool,

        /// Do not recover orphaned jobs on start
        #[arg(long)]
        no_resume: bool,
    },
    /// Validate a plan file and print its phases by wave
    Validate {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,
    },
    /// Run a plan in-process, wait for it and print the results
    Run {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,

        /// Input document; repeat for several
        #[arg(short, long = "doc")]
        docs: Vec<PathBuf>,

        /// Stop launching phases after the first failure
        #[arg(long)]
        fail_fast: bool,

        /// Use the scripted client and an in-memory store instead of the service
        #[arg(long)]
        dry_run: bool,

        /// Maximum concurrent phases
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Maximum concurrent items per phase
        #[arg(long)]
        max_items: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a job's progress
    Status {
        job_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Print a job's phase results
    Results {
        job_id: String,

        #[arg(long)]
        json: bool,
    },
    /// Request cancellation of a job
    Cancel { job_id: String },
    /// Resume or fail jobs left running by a previous process
    Recover,
    /// List jobs
    Jobs,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default dossier.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // `config init` must work before a configuration exists
    if let Commands::Config {
        command: Some(ConfigCommands::Init),
    } = &cli.command
    {
        return cmd::cmd_config_init(&project_dir);
    }

    let config = cmd::load_config(&cli, &project_dir)?;
    let _telemetry = cmd::init_telemetry(&config, cli.verbose)?;

    match &cli.command {
        Commands::Serve {
            host,
            port,
            dev,
            no_resume,
        } => cmd::cmd_serve(&config, host, *port, *dev, *no_resume).await?,
        Commands::Validate { plan } => cmd::cmd_validate(plan)?,
        Commands::Run {
            plan,
            docs,
            fail_fast,
            dry_run,
            max_parallel,
            max_items,
            json,
        } => {
            let options = cmd::RunOptions {
                fail_fast: *fail_fast,
                dry_run: *dry_run,
                max_parallel: *max_parallel,
                max_items: *max_items,
                json: *json,
            };
            cmd::cmd_run(config, plan, docs, options).await?;
        }
        Commands::Status { job_id, json } => cmd::cmd_status(&config, job_id, *json).await?,
        Commands::Results { job_id, json } => cmd::cmd_results(&config, job_id, *json).await?,
        Commands::Cancel { job_id } => cmd::cmd_cancel(&config, job_id).await?,
        Commands::Recover => cmd::cmd_recover(&config).await?,
        Commands::Jobs => cmd::cmd_jobs(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
