//! One watcher per connected SSE client. A watcher never reads from the
//! emitter — only from persistence — so reconnects, multiple concurrent
//! viewers of the same message, and server restarts mid-run all resolve
//! to the same simple story: read what's there, then poll for more.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::{PersistedEvent, StreamEvent};
use crate::persistence::EventStore;
use crate::registry::Registry;

/// Inputs for a single watcher loop.
pub struct WatcherConfig {
    pub message_id: String,
    /// Resume cursor — the last event ID the client has already seen
    /// (e.g. from `Last-Event-ID`). `None` replays from the start.
    pub since_id: Option<String>,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub dedup_capacity: usize,
}

/// A bounded FIFO of recently-seen event IDs, used to drop duplicates a
/// poll might re-read at a page boundary.
struct SeenIds {
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    fn insert_if_new(&mut self, id: &str) -> bool {
        if self.order.iter().any(|seen| seen == id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            self.order.pop_front();
        }
        self.order.push_back(id.to_string());
        true
    }
}

/// Poll persistence for new events belonging to `config.message_id` and
/// forward each new one through `on_event`, until one of:
/// - an `END` event is read
/// - the registry reports the task is no longer running and one final
///   drain after that finds nothing new
/// - `max_wait` elapses with the task still running
/// - `on_event` returns `false` (client disconnected)
pub async fn watch<S, F>(
    store: &S,
    registry: &Arc<Registry>,
    config: WatcherConfig,
    mut on_event: F,
) where
    S: EventStore + ?Sized,
    F: FnMut(&PersistedEvent) -> bool,
{
    registry.register_watcher(&config.message_id);
    let _guard = WatcherGuard { registry, message_id: &config.message_id };

    let mut last_event_id = config.since_id.clone();
    let mut seen = SeenIds::new(config.dedup_capacity);
    let started = Instant::now();
    let mut saw_not_running_once = false;

    loop {
        let events = match store
            .get_events(&config.message_id, last_event_id.as_deref(), 100)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                debug!(message_id = %config.message_id, error = %e, "watcher read failed");
                Vec::new()
            }
        };

        let mut saw_end = false;
        let mut any_new = false;
        for event in &events {
            if !seen.insert_if_new(&event.id) {
                continue;
            }
            any_new = true;
            last_event_id = Some(event.id.clone());
            if matches!(event.event, StreamEvent::End { .. }) {
                saw_end = true;
            }
            if !on_event(event) {
                return;
            }
        }

        if saw_end {
            return;
        }

        let running = registry.is_running(&config.message_id);
        if !running {
            if saw_not_running_once && !any_new {
                // One extra drain already happened with nothing new; the
                // task is done and persistence has nothing left to say.
                return;
            }
            saw_not_running_once = true;
        }

        if started.elapsed() >= config.max_wait {
            debug!(message_id = %config.message_id, "watcher timed out waiting for END");
            return;
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

struct WatcherGuard<'a> {
    registry: &'a Arc<Registry>,
    message_id: &'a str,
}

impl Drop for WatcherGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister_watcher(self.message_id);
    }
}
