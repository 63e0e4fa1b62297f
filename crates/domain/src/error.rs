/// Shared error type used across the streaming substrate crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event store: {0}")]
    Store(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already running: {0}")]
    AlreadyRunning(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
