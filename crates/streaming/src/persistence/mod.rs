//! Durable, append-only event log. The driver writes every event here
//! before the emitter queue is allowed to consider it delivered; the
//! watcher reads only from here, never from the emitter directly.
//!
//! Storage is one JSONL file per `message_id`, JSONL-plus-in-memory-index,
//! carrying an atomically allocated `seq` per message instead of a single
//! global sequence.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use ts_domain::{Error, Result};

use crate::event::{generate_event_id, parse_seq_from_id, PersistedEvent, StreamEvent};

/// Default number of events returned by `get_events` when the caller
/// doesn't specify a limit.
pub const DEFAULT_PAGE_LIMIT: usize = 1000;
/// No caller, however it asks, can pull more than this in one call.
pub const MAX_PAGE_LIMIT: usize = 10_000;

/// Where the durable log lives and how appends are retried.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `event` under `message_id`/`chat_id`, allocating the next
    /// `seq` for that message atomically. Retries transient I/O failures
    /// with exponential backoff before giving up.
    async fn append(
        &self,
        message_id: &str,
        chat_id: &str,
        event: StreamEvent,
    ) -> Result<PersistedEvent>;

    /// Read events for `message_id`, optionally resuming after `since_id`
    /// (the embedded seq is used as the resume cursor; a malformed or
    /// unparseable `since_id` means "from the beginning"), capped at
    /// `limit` (clamped to `MAX_PAGE_LIMIT`).
    async fn get_events(
        &self,
        message_id: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>>;

    async fn get_event_count(&self, message_id: &str) -> Result<usize>;

    async fn delete_events(&self, message_id: &str) -> Result<()>;

    /// Delete every message's event log whose most recent event is older
    /// than `ttl`. Stands in for a document store's TTL index (spec.md
    /// §3/§6): a completed conversation's events age out without
    /// affecting replay for anything still live. Returns the number of
    /// messages swept.
    async fn sweep_expired(&self, ttl: std::time::Duration) -> Result<usize>;
}

/// Per-message atomic sequence allocation. Counters are created lazily
/// and kept for the life of the process; a restart re-derives the next
/// seq from the file's last line rather than trusting this map, so it's
/// safe for this to be purely in-memory.
struct SeqCounters {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl SeqCounters {
    fn new() -> Self {
        Self { counters: Mutex::new(HashMap::new()) }
    }

    fn counter_for(&self, message_id: &str, initial: u64) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock();
        counters
            .entry(message_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(initial)))
            .clone()
    }
}

pub struct JsonlEventStore {
    root: PathBuf,
    write_retries: u32,
    write_backoff_base_ms: u64,
    seq_counters: SeqCounters,
}

impl JsonlEventStore {
    pub fn new(root: impl Into<PathBuf>, write_retries: u32, write_backoff_base_ms: u64) -> Self {
        let root = root.into();
        std::fs::create_dir_all(&root).ok();
        Self {
            root,
            write_retries,
            write_backoff_base_ms,
            seq_counters: SeqCounters::new(),
        }
    }

    fn path_for(&self, message_id: &str) -> PathBuf {
        self.root.join(format!("{message_id}.jsonl"))
    }

    /// Determine the next seq to allocate for `message_id` by reading the
    /// last line of its file, if any. Only consulted the first time a
    /// message is seen in this process.
    fn initial_seq(path: &Path) -> u64 {
        let Ok(content) = std::fs::read_to_string(path) else {
            return 0;
        };
        content
            .lines()
            .last()
            .and_then(|line| serde_json::from_str::<PersistedEvent>(line).ok())
            .map(|e| e.seq + 1)
            .unwrap_or(0)
    }

    fn append_line(path: &Path, event: &PersistedEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{json}")
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn append(
        &self,
        message_id: &str,
        chat_id: &str,
        event: StreamEvent,
    ) -> Result<PersistedEvent> {
        let path = self.path_for(message_id);
        let initial = Self::initial_seq(&path);
        let counter = self.seq_counters.counter_for(message_id, initial);
        let seq = counter.fetch_add(1, Ordering::SeqCst);

        let now = chrono::Utc::now();
        let id = generate_event_id(seq, now.timestamp_millis());
        let persisted = PersistedEvent {
            v: crate::event::SCHEMA_VERSION,
            event,
            id,
            ts: now,
            message_id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            seq,
        };

        let mut attempt = 0;
        loop {
            match Self::append_line(&path, &persisted) {
                Ok(()) => return Ok(persisted),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.write_retries {
                        return Err(Error::Store(format!(
                            "failed to persist event for {message_id} after {attempt} attempts: {e}"
                        )));
                    }
                    let backoff = self.write_backoff_base_ms * (1 << (attempt - 1));
                    warn!(
                        message_id,
                        attempt, backoff_ms = backoff, error = %e, "retrying event append"
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn get_events(
        &self,
        message_id: &str,
        since_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>> {
        let path = self.path_for(message_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let since_seq = since_id.and_then(parse_seq_from_id);
        if since_id.is_some() && since_seq.is_none() {
            warn!(message_id, since_id, "malformed since_id, replaying from the beginning");
        }

        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let events: Vec<PersistedEvent> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<PersistedEvent>(line).ok())
            .filter(|e| since_seq.map_or(true, |since| e.seq > since))
            .take(limit)
            .collect();
        Ok(events)
    }

    async fn get_event_count(&self, message_id: &str) -> Result<usize> {
        let path = self.path_for(message_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content.lines().count()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete_events(&self, message_id: &str) -> Result<()> {
        let path = self.path_for(message_id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.seq_counters.counters.lock().remove(message_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn sweep_expired(&self, ttl: std::time::Duration) -> Result<usize> {
        let now = chrono::Utc::now();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut swept = 0;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(last_ts) = Self::last_event_ts(&path) else { continue };
            let age = now.signed_duration_since(last_ts);
            if age.to_std().map(|age| age > ttl).unwrap_or(false) {
                let message_id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if std::fs::remove_file(&path).is_ok() {
                    self.seq_counters.counters.lock().remove(message_id);
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }
}

impl JsonlEventStore {
    fn last_event_ts(path: &Path) -> Option<chrono::DateTime<chrono::Utc>> {
        let content = std::fs::read_to_string(path).ok()?;
        content
            .lines()
            .last()
            .and_then(|line| serde_json::from_str::<PersistedEvent>(line).ok())
            .map(|e| e.ts)
    }
}
