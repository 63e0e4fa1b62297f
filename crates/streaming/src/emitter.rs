//! The per-message event emitter: a bounded channel the driver writes to
//! and persistence drains. It is handed explicitly to whatever needs it
//! (the driver, the registry) rather than threaded through task-local or
//! process-global state, so a message's emitter lifetime is exactly the
//! lifetime of its `Arc`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::event::StreamEvent;

/// Handed to the driver. Cloning is cheap (it's a channel sender plus a
/// couple of `Arc<AtomicU64>` counters); every clone feeds the same
/// bounded queue.
#[derive(Clone)]
pub struct Emitter {
    message_id: String,
    tx: mpsc::Sender<StreamEvent>,
    dropped_status: Arc<AtomicU64>,
    dropped_other: Arc<AtomicU64>,
}

/// The receiving half, owned by whatever drains the queue into
/// persistence (normally the driver's own writer loop).
pub struct EmitterReceiver {
    pub rx: mpsc::Receiver<StreamEvent>,
}

/// Counters surfaced for diagnostics; STATUS drops are expected and
/// benign, non-STATUS drops indicate the queue capacity is too small for
/// the traffic it's seeing.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmitterStats {
    pub dropped_status: u64,
    pub dropped_other: u64,
}

impl Emitter {
    /// Create a bounded emitter/receiver pair for a single in-flight
    /// message. `capacity` should come from `EmitterConfig::queue_capacity`.
    pub fn new(message_id: impl Into<String>, capacity: usize) -> (Self, EmitterReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let emitter = Emitter {
            message_id: message_id.into(),
            tx,
            dropped_status: Arc::new(AtomicU64::new(0)),
            dropped_other: Arc::new(AtomicU64::new(0)),
        };
        (emitter, EmitterReceiver { rx })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Submit an event to the queue. Never blocks: on a full queue a
    /// `STATUS` event is dropped silently (and counted), any other event
    /// is dropped too but logged as a warning, since losing it means a
    /// gap in the durable log.
    ///
    /// By construction the queue should only ever hold a handful of
    /// events (persistence drains it continuously); a full queue means
    /// the store is stalled, not that traffic is unusually bursty.
    pub fn emit(&self, event: StreamEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if event.droppable() {
                    self.dropped_status.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.dropped_other.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %self.message_id,
                        event_type = event.type_name(),
                        "emitter queue full, dropping non-droppable event"
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(message_id = %self.message_id, "emitter receiver closed, event discarded");
            }
        }
    }

    pub fn stats(&self) -> EmitterStats {
        EmitterStats {
            dropped_status: self.dropped_status.load(Ordering::Relaxed),
            dropped_other: self.dropped_other.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_and_receives_in_order() {
        let (emitter, mut rx) = Emitter::new("m1", 10);
        emitter.emit(StreamEvent::Start);
        emitter.emit(StreamEvent::ContentStart);
        assert!(matches!(rx.rx.recv().await.unwrap(), StreamEvent::Start));
        assert!(matches!(rx.rx.recv().await.unwrap(), StreamEvent::ContentStart));
    }

    #[tokio::test]
    async fn full_queue_drops_status_silently_and_counts_it() {
        let (emitter, _rx) = Emitter::new("m1", 1);
        emitter.emit(StreamEvent::Status { text: "a".into() });
        emitter.emit(StreamEvent::Status { text: "b".into() });
        assert_eq!(emitter.stats().dropped_status, 1);
        assert_eq!(emitter.stats().dropped_other, 0);
    }

    #[tokio::test]
    async fn full_queue_drops_non_status_and_counts_it_separately() {
        let (emitter, _rx) = Emitter::new("m1", 1);
        emitter.emit(StreamEvent::ContentStart);
        emitter.emit(StreamEvent::ContentEnd);
        assert_eq!(emitter.stats().dropped_other, 1);
        assert_eq!(emitter.stats().dropped_status, 0);
    }

    #[tokio::test]
    async fn closed_receiver_does_not_panic_on_emit() {
        let (emitter, rx) = Emitter::new("m1", 4);
        drop(rx);
        emitter.emit(StreamEvent::Start);
    }

    #[tokio::test]
    async fn clone_shares_the_same_queue_and_counters() {
        let (emitter, mut rx) = Emitter::new("m1", 1);
        let clone = emitter.clone();
        clone.emit(StreamEvent::Start);
        emitter.emit(StreamEvent::ContentStart);
        assert_eq!(emitter.stats().dropped_other, 1);
        assert!(matches!(rx.rx.recv().await.unwrap(), StreamEvent::Start));
    }
}
