//! HTTP server command: `dossier serve`.

use anyhow::Result;

use dossier::config::DossierConfig;
use dossier::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: &DossierConfig,
    host: &str,
    port: u16,
    dev: bool,
    no_resume: bool,
) -> Result<()> {
    let manager = super::build_manager(config, false)?;
    let server = ServerConfig {
        host: host.to_string(),
        port,
        dev_mode: dev,
        resume_on_start: config.toml.recovery.resume_on_start && !no_resume,
    };
    start_server(manager, server).await
}
