//! Shared application state passed to every HTTP handler.

use std::sync::Arc;

use ts_domain::config::Config;
use ts_streaming::message::MessageStore;
use ts_streaming::persistence::EventStore;
use ts_streaming::{graph::AgentGraph, Registry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub events: Arc<dyn EventStore>,
    pub messages: Arc<dyn MessageStore>,
    pub graph: Arc<dyn AgentGraph>,
    pub registry: Arc<Registry>,
}
