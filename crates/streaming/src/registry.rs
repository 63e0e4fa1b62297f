//! Process-wide registry of in-flight agent tasks, keyed by `message_id`.
//!
//! A bare `tokio::spawn` already detaches a task's lifetime from whatever
//! future spawned it (dropping the request's future does not cancel the
//! spawned task), so the "shielding" the original registry does explicitly
//! is automatic here. What the registry still owns on top of that: the
//! `JoinHandle` (never awaited from a request handler), an idempotent
//! start, a completion flag set exactly once regardless of exit path, and
//! watcher reference counting so the periodic sweep knows which completed
//! tasks are safe to evict.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A single in-flight (or recently finished) agent run.
pub struct AgentTask {
    pub message_id: String,
    pub chat_id: String,
    started_at: Instant,
    completed: AtomicBool,
    completed_at: Mutex<Option<Instant>>,
    watcher_count: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AgentTask {
    pub fn is_running(&self) -> bool {
        !self.completed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time since completion, or `None` if still running.
    pub fn time_since_completion(&self) -> Option<Duration> {
        self.completed_at.lock().map(|at| at.elapsed())
    }

    fn mark_completed(&self) {
        // Only the first caller across all exit paths records the
        // completion instant; later callers (there shouldn't be any, but
        // a belt-and-suspenders panic-hook-plus-normal-return race is
        // cheap to guard against) are no-ops.
        if !self.completed.swap(true, Ordering::AcqRel) {
            *self.completed_at.lock() = Some(Instant::now());
        }
    }
}

/// Snapshot of registry-wide counters, surfaced for an admin/observability
/// endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    pub active_count: usize,
    pub total_tasks: usize,
    pub total_watchers: usize,
}

pub struct Registry {
    tasks: Mutex<HashMap<String, Arc<AgentTask>>>,
    watchers: Mutex<HashMap<String, u64>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Start an agent run for `message_id`, spawning `fut` as a detached
    /// task. If a task for `message_id` is already registered and still
    /// running, this is a no-op and returns `false` (idempotent start);
    /// otherwise spawns a fresh task and returns `true`.
    pub fn start_agent<F>(
        self: &Arc<Self>,
        message_id: impl Into<String>,
        chat_id: impl Into<String>,
        fut: F,
    ) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let message_id = message_id.into();
        let chat_id = chat_id.into();

        let mut tasks = self.tasks.lock();
        if let Some(existing) = tasks.get(&message_id) {
            if existing.is_running() {
                return false;
            }
        }

        let task = Arc::new(AgentTask {
            message_id: message_id.clone(),
            chat_id,
            started_at: Instant::now(),
            completed: AtomicBool::new(false),
            completed_at: Mutex::new(None),
            watcher_count: AtomicU64::new(0),
            handle: Mutex::new(None),
        });

        let task_for_wrapper = task.clone();
        let handle = tokio::spawn(async move {
            // `fut` itself is responsible for writing its own ERROR/END
            // events; this wrapper only guarantees the registry always
            // learns the task finished, including on panic.
            let result = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
            if let Err(panic) = result {
                warn!(
                    message_id = %task_for_wrapper.message_id,
                    "agent task panicked: {:?}",
                    panic_message(&panic)
                );
            }
            task_for_wrapper.mark_completed();
        });
        *task.handle.lock() = Some(handle);

        info!(message_id = %message_id, "agent task started");
        tasks.insert(message_id, task);
        true
    }

    pub fn is_running(&self, message_id: &str) -> bool {
        self.tasks
            .lock()
            .get(message_id)
            .map(|t| t.is_running())
            .unwrap_or(false)
    }

    pub fn get_task(&self, message_id: &str) -> Option<Arc<AgentTask>> {
        self.tasks.lock().get(message_id).cloned()
    }

    /// Register one watcher for `message_id`. Callers decrement with
    /// `unregister_watcher` when the corresponding SSE connection ends.
    pub fn register_watcher(&self, message_id: &str) {
        *self.watchers.lock().entry(message_id.to_string()).or_insert(0) += 1;
    }

    /// Unregister one watcher. Once the count reaches zero the entry is
    /// removed entirely rather than left at zero.
    pub fn unregister_watcher(&self, message_id: &str) {
        let mut watchers = self.watchers.lock();
        if let Some(count) = watchers.get_mut(message_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                watchers.remove(message_id);
            }
        }
    }

    pub fn watcher_count(&self, message_id: &str) -> u64 {
        self.watchers.lock().get(message_id).copied().unwrap_or(0)
    }

    pub fn list_running(&self) -> Vec<String> {
        self.tasks
            .lock()
            .values()
            .filter(|t| t.is_running())
            .map(|t| t.message_id.clone())
            .collect()
    }

    pub fn get_active_count(&self) -> usize {
        self.tasks.lock().values().filter(|t| t.is_running()).count()
    }

    pub fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.lock();
        RegistryStats {
            active_count: tasks.values().filter(|t| t.is_running()).count(),
            total_tasks: tasks.len(),
            total_watchers: self.watchers.lock().values().sum::<u64>() as usize,
        }
    }

    /// Evict completed tasks that finished more than `max_age` ago and
    /// have no registered watchers left.
    pub fn cleanup_old_tasks(&self, max_age: Duration) -> usize {
        let mut tasks = self.tasks.lock();
        let watchers = self.watchers.lock();
        let before = tasks.len();
        tasks.retain(|message_id, task| {
            if task.is_running() {
                return true;
            }
            if watchers.contains_key(message_id) {
                return true;
            }
            match task.time_since_completion() {
                Some(age) => age < max_age,
                None => true,
            }
        });
        before - tasks.len()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_agent_runs_and_marks_completed() {
        let registry = Arc::new(Registry::new());
        let started = registry.start_agent("m1", "c1", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
        });
        assert!(started);
        assert!(registry.is_running("m1"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_running("m1"));
    }

    #[tokio::test]
    async fn start_agent_is_idempotent_while_running() {
        let registry = Arc::new(Registry::new());
        registry.start_agent("m1", "c1", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let started_again = registry.start_agent("m1", "c1", async {});
        assert!(!started_again);
    }

    #[tokio::test]
    async fn start_agent_restarts_after_completion() {
        let registry = Arc::new(Registry::new());
        registry.start_agent("m1", "c1", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.is_running("m1"));
        let restarted = registry.start_agent("m1", "c1", async {});
        assert!(restarted);
    }

    #[tokio::test]
    async fn panicking_task_still_marks_completed() {
        let registry = Arc::new(Registry::new());
        registry.start_agent("m1", "c1", async {
            panic!("boom");
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_running("m1"));
    }

    #[test]
    fn watcher_refcounting_cleans_up_on_empty() {
        let registry = Registry::new();
        registry.register_watcher("m1");
        registry.register_watcher("m1");
        assert_eq!(registry.watcher_count("m1"), 2);
        registry.unregister_watcher("m1");
        assert_eq!(registry.watcher_count("m1"), 1);
        registry.unregister_watcher("m1");
        assert_eq!(registry.watcher_count("m1"), 0);
        assert!(!registry.watchers.lock().contains_key("m1"));
    }

    #[tokio::test]
    async fn cleanup_evicts_only_old_completed_unwatched_tasks() {
        let registry = Arc::new(Registry::new());
        registry.start_agent("done", "c1", async {});
        registry.start_agent("running", "c1", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let evicted = registry.cleanup_old_tasks(Duration::from_millis(0));
        assert_eq!(evicted, 1);
        assert!(registry.get_task("done").is_none());
        assert!(registry.get_task("running").is_some());
    }

    #[tokio::test]
    async fn cleanup_spares_completed_tasks_with_active_watchers() {
        let registry = Arc::new(Registry::new());
        registry.start_agent("m1", "c1", async {});
        registry.register_watcher("m1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let evicted = registry.cleanup_old_tasks(Duration::from_millis(0));
        assert_eq!(evicted, 0);
        assert!(registry.get_task("m1").is_some());
    }
}
