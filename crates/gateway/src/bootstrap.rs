//! `AppState` construction and background-task spawning, extracted from
//! `main.rs` so `serve` and `doctor` can share the same boot path.

use std::sync::Arc;

use ts_domain::config::{Config, ConfigSeverity};
use ts_streaming::graph::AgentGraph;
use ts_streaming::message::{JsonlMessageStore, MessageStore};
use ts_streaming::persistence::{EventStore, JsonlEventStore};
use ts_streaming::Registry;

use crate::state::AppState;

/// Validate config and wire up every subsystem. `graph` is injected by the
/// caller since the real agent graph implementation lives outside this
/// crate's scope; `serve`/`doctor` each decide what to pass.
pub fn build_app_state(config: Arc<Config>, graph: Arc<dyn AgentGraph>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let events: Arc<dyn EventStore> = Arc::new(JsonlEventStore::new(
        &config.store.path,
        config.store.write_retries,
        config.store.write_backoff_base_ms,
    ));
    tracing::info!(path = %config.store.path.display(), "event store ready");

    let messages_path = config.store.path.join("messages.jsonl");
    let messages: Arc<dyn MessageStore> = Arc::new(JsonlMessageStore::new(messages_path)?);
    tracing::info!("message store ready");

    let registry = Arc::new(Registry::new());
    tracing::info!("agent registry ready");

    Ok(AppState { config, events, messages, graph, registry })
}

/// Periodically evict completed, unwatched agent tasks from the registry.
/// Mirrors the teacher's pattern of a bare `tokio::spawn`ed `loop { tick }`
/// background task per subsystem that needs periodic maintenance.
pub fn spawn_registry_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(state.config.registry.sweep_interval_secs.max(1)));
        let max_age = std::time::Duration::from_secs(state.config.registry.sweep_max_age_secs);
        loop {
            interval.tick().await;
            let evicted = state.registry.cleanup_old_tasks(max_age);
            if evicted > 0 {
                tracing::debug!(evicted, "swept completed agent tasks from registry");
            }
        }
    });
}

/// Periodically expire event logs older than `store.event_ttl_secs`,
/// standing in for a document store's TTL index (spec.md §3/§6). A no-op
/// background task when no TTL is configured, rather than conditionally
/// spawning, so the shape matches `spawn_registry_sweep` regardless of
/// config.
pub fn spawn_event_ttl_sweep(state: AppState) {
    let Some(ttl_secs) = state.config.store.event_ttl_secs else {
        tracing::debug!("event TTL sweep disabled (store.event_ttl_secs unset)");
        return;
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            state.config.store.event_ttl_sweep_interval_secs.max(1),
        ));
        let ttl = std::time::Duration::from_secs(ttl_secs);
        loop {
            interval.tick().await;
            match state.events.sweep_expired(ttl).await {
                Ok(swept) if swept > 0 => tracing::debug!(swept, "swept expired event logs"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "event TTL sweep failed"),
            }
        }
    });
}
