//! inspectd - HTTP daemon for chamber inspection
//!
//! This daemon:
//! 1. Loads configuration (`CHAMBER_CONFIG` file + `CHAMBER_*` env)
//! 2. Opens the detection store and the configured detector
//! 3. Serves the inspection API until Ctrl-C

use anyhow::{anyhow, Result};
use std::io::IsTerminal;
use std::sync::mpsc;

use chamber_inspect::api::{ApiConfig, ApiServer};
use chamber_inspect::{InspectConfig, Pipeline};

#[path = "../ui.rs"]
mod ui;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ui = ui::Ui::from_args(
        &std::env::var("CHAMBER_UI").unwrap_or_else(|_| "plain".to_string()),
        std::io::stderr().is_terminal(),
        !std::io::stdout().is_terminal(),
    );

    let config = ui.run_stage("Load configuration", InspectConfig::load)?;
    let pipeline = ui.run_stage("Open store and detector", || Pipeline::from_config(&config))?;
    let api_handle = ui.run_stage("Start API server", || {
        ApiServer::new(ApiConfig::from(&config.api), pipeline).spawn()
    })?;
    log::info!(
        "inspectd v{} serving {} ({} mode, {} workers)",
        env!("CARGO_PKG_VERSION"),
        config.db_path,
        config.store_mode,
        config.api.workers
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("inspectd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
