use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub emitter: EmitterConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Backpressure ceiling applied to the whole router via
    /// `tower::limit::ConcurrencyLimitLayer`.
    #[serde(default = "d_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            max_concurrent_requests: d_max_concurrent_requests(),
        }
    }
}

fn d_host() -> String {
    "0.0.0.0".into()
}

fn d_port() -> u16 {
    8080
}

fn d_max_concurrent_requests() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for the per-message event JSONL files.
    #[serde(default = "d_store_path")]
    pub path: PathBuf,
    /// Number of retries for a failed append before giving up and
    /// buffering the event in the in-memory failed-event list.
    #[serde(default = "d_3")]
    pub write_retries: u32,
    /// Base backoff in milliseconds; doubles on each subsequent retry
    /// (100, 200, 400 for the default 3 retries).
    #[serde(default = "d_100")]
    pub write_backoff_base_ms: u64,
    /// Events older than this are eligible for the TTL sweep, in seconds.
    /// `None` disables the sweep.
    #[serde(default)]
    pub event_ttl_secs: Option<u64>,
    /// How often the TTL sweep runs, in seconds. Irrelevant when
    /// `event_ttl_secs` is `None`.
    #[serde(default = "d_ttl_sweep_interval_secs")]
    pub event_ttl_sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: d_store_path(),
            write_retries: d_3(),
            write_backoff_base_ms: d_100(),
            event_ttl_secs: None,
            event_ttl_sweep_interval_secs: d_ttl_sweep_interval_secs(),
        }
    }
}

fn d_ttl_sweep_interval_secs() -> u64 {
    3600
}

fn d_store_path() -> PathBuf {
    PathBuf::from("./data/events")
}

fn d_3() -> u32 {
    3
}

fn d_100() -> u64 {
    100
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitterConfig {
    /// Bounded MPSC queue capacity per in-flight message.
    #[serde(default = "d_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: d_queue_capacity(),
        }
    }
}

fn d_queue_capacity() -> usize {
    1000
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// How often to emit a heartbeat STATUS event while a step is in
    /// flight, in seconds.
    #[serde(default = "d_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Target word count per CONTENT chunk when streaming final output.
    #[serde(default = "d_chunk_words")]
    pub content_chunk_words: usize,
    /// Delay between successive CONTENT chunks, in milliseconds, so
    /// clients render prose as a smooth stream rather than one paste.
    #[serde(default = "d_chunk_delay_ms")]
    pub content_chunk_delay_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: d_heartbeat_secs(),
            content_chunk_words: d_chunk_words(),
            content_chunk_delay_ms: d_chunk_delay_ms(),
        }
    }
}

fn d_heartbeat_secs() -> u64 {
    15
}

fn d_chunk_words() -> usize {
    10
}

fn d_chunk_delay_ms() -> u64 {
    30
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Interval between sweeps of the task map, in seconds.
    #[serde(default = "d_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Maximum age of a terminal (completed/failed/interrupted) task
    /// before the sweep evicts it, in seconds.
    #[serde(default = "d_sweep_max_age_secs")]
    pub sweep_max_age_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: d_sweep_interval_secs(),
            sweep_max_age_secs: d_sweep_max_age_secs(),
        }
    }
}

fn d_sweep_interval_secs() -> u64 {
    60
}

fn d_sweep_max_age_secs() -> u64 {
    3600
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Watcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// How often the watcher polls persistence for new events, in
    /// milliseconds.
    #[serde(default = "d_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum time a watcher will wait for a running agent to produce
    /// an `END` event before giving up, in seconds.
    #[serde(default = "d_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Size of the dedup-by-id ring kept by each watcher.
    #[serde(default = "d_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: d_poll_interval_ms(),
            max_wait_secs: d_max_wait_secs(),
            dedup_capacity: d_dedup_capacity(),
        }
    }
}

fn d_poll_interval_ms() -> u64 {
    500
}

fn d_max_wait_secs() -> u64 {
    3600
}

fn d_dedup_capacity() -> usize {
    256
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// An empty vec means everything looks good; any `Error`-severity
    /// issue should block startup.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.max_concurrent_requests".into(),
                message: "max_concurrent_requests must be greater than 0".into(),
            });
        }

        if self.emitter.queue_capacity == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "emitter.queue_capacity".into(),
                message: "queue_capacity must be greater than 0".into(),
            });
        }

        if self.driver.heartbeat_interval_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "driver.heartbeat_interval_secs".into(),
                message: "heartbeat disabled (0) — clients relying on keepalives may time out"
                    .into(),
            });
        }

        if self.store.write_retries == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "store.write_retries".into(),
                message: "write_retries is 0 — a single transient failure will drop an event"
                    .into(),
            });
        }

        if self.registry.sweep_max_age_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "registry.sweep_max_age_secs".into(),
                message: "sweep_max_age_secs is 0 — completed tasks are evicted immediately"
                    .into(),
            });
        }

        if self.store.event_ttl_secs.is_some() && self.store.event_ttl_sweep_interval_secs == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "store.event_ttl_sweep_interval_secs".into(),
                message: "event_ttl_secs is set but sweep_interval is 0".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        let issues = config.validate();
        assert!(issues.iter().all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = Config::default();
        config.server.port = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = Config::default();
        let raw = toml::to_string(&config).expect("serialize");
        let parsed: Config = toml::from_str(&raw).expect("parse");
        assert_eq!(parsed.server.port, config.server.port);
    }
}
