//! Streaming/execution substrate: the durable event log an agent driver
//! writes to and arbitrarily many SSE watchers read from, decoupled from
//! each other by persistence rather than a direct channel.

pub mod context;
pub mod driver;
pub mod emitter;
pub mod event;
pub mod graph;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod sanitizer;
pub mod watcher;

pub use emitter::{Emitter, EmitterReceiver, EmitterStats};
pub use event::{PersistedEvent, StreamEvent};
pub use registry::Registry;
