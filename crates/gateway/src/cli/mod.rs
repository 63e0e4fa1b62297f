//! CLI surface: `serve` (the default) and `doctor`.

pub mod doctor;

use clap::{Parser, Subcommand};
use ts_domain::config::Config;

#[derive(Parser)]
#[command(name = "tenderstream", version, about = "TenderStream event-streaming gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the HTTP/SSE server (default if no subcommand is given).
    Serve,
    /// Run startup checks without starting the server.
    Doctor,
    /// Print the resolved configuration.
    Version,
}

/// Load configuration from the path named by `TS_CONFIG` (default
/// `config.toml`), falling back to defaults if the file doesn't exist.
pub fn load_config() -> anyhow::Result<(Config, String)> {
    let path = std::env::var("TS_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = match std::fs::read_to_string(&path) {
        Ok(raw) => toml::from_str(&raw)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };
    Ok((config, path))
}
