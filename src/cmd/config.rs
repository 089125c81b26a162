//! Configuration view and validation commands: `dossier config`.

use std::path::Path;

use anyhow::Result;

use dossier::config::DossierConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &DossierConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Dossier Configuration");
            println!("=====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No dossier.toml found at {}; showing defaults.", config_path.display());
            }
            println!("Effective values (with env/CLI overrides):");
            println!();
            print!("{}", config.toml.to_toml()?);
            println!();
            println!("Database: {}", config.db_path().display());
            println!(
                "API key ({}): {}",
                config.toml.service.api_key_env,
                if config.api_key().is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => cmd_config_init(&config.project_dir)?,
    }

    Ok(())
}

/// Write a default `.dossier/dossier.toml`.
pub fn cmd_config_init(project_dir: &Path) -> Result<()> {
    let (path, written) = DossierConfig::init(project_dir)?;
    if !written {
        println!("dossier.toml already exists at {}", path.display());
        println!("Delete it first if you want to recreate it.");
        return Ok(());
    }

    println!("Created dossier.toml at {}", path.display());
    println!();
    println!("You can now customize:");
    println!("  - [service] base_url, api_key_env");
    println!("  - [models] default and per-depth models");
    println!("  - [concurrency] max_parallel_phases, max_parallel_items");
    println!();
    Ok(())
}
