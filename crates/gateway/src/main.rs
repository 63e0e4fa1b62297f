//! Binary entry point: CLI dispatch, tracing init, and the HTTP server
//! that wires the gateway's `AppState` into an axum router.

mod api;
mod bootstrap;
mod cli;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use ts_domain::config::Config;
use ts_streaming::graph::UnconfiguredGraph;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    match args.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &config_path)?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("tenderstream {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command; the
/// other subcommands print plain stdout for operator readability).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ts_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("TenderStream starting");

    // No real LLM-driven planner ships with this crate (spec's "opaque
    // driver that yields step snapshots" is a collaborator boundary, not
    // something this crate implements) — until one is wired in, every
    // run fails fast with a clear message rather than hanging.
    let graph: Arc<dyn ts_streaming::graph::AgentGraph> = Arc::new(UnconfiguredGraph);

    let state = bootstrap::build_app_state(config.clone(), graph).context("building app state")?;
    bootstrap::spawn_registry_sweep(state.clone());
    bootstrap::spawn_event_ttl_sweep(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any);

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(%addr, "TenderStream listening");
    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}
