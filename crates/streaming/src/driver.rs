//! The agent driver: bridges one opaque `AgentGraph` run into the durable
//! event log, immune to whichever (if any) HTTP client is watching.
//!
//! State machine: `Start -> Running -> {Completed, Interrupted, Failed}`.
//! `Start` is a single persisted event; `Running` is the select loop below,
//! consuming graph steps and any directly-emitted tool/subagent events
//! concurrently; the terminal states are each exactly one `END` event.
//!
//! Two independent robustness layers sit under this: the `EventStore`
//! itself retries a failed append with exponential backoff (see
//! `persistence::JsonlEventStore`); `RobustWriter` below adds a second,
//! driver-level linear-backoff retry on top, and buffers anything that
//! still fails so it can be flushed once more from the driver's exit path
//! — including the panic path, via the `catch_unwind` in `drive`.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tracing::{error, warn};

use ts_domain::config::DriverConfig;

use crate::context;
use crate::emitter::{Emitter, EmitterReceiver};
use crate::event::{AgentType, EndStatus, PersistedEvent, StreamEvent};
use crate::graph::{AgentGraph, GraphContext, GraphStep};
use crate::message::{MessageStatus, MessageStore};
use crate::persistence::EventStore;

/// Wraps an `EventStore` with a linear-backoff retry on top of the
/// store's own exponential backoff, and an in-memory buffer for events
/// that fail even that. `flush_failed_events` is always called from the
/// driver's exit path, so a transient store outage delays events rather
/// than silently losing them.
pub struct RobustWriter<S: EventStore + ?Sized> {
    store: Arc<S>,
    retries: u32,
    backoff_ms: u64,
    failed: Mutex<Vec<(String, String, StreamEvent)>>,
}

impl<S: EventStore + ?Sized> RobustWriter<S> {
    pub fn new(store: Arc<S>, retries: u32, backoff_ms: u64) -> Self {
        Self { store, retries, backoff_ms, failed: Mutex::new(Vec::new()) }
    }

    /// Persist `event`, retrying transient failures linearly. Returns
    /// `None` (after buffering the event) if every attempt failed.
    pub async fn persist(
        &self,
        message_id: &str,
        chat_id: &str,
        event: StreamEvent,
    ) -> Option<PersistedEvent> {
        let mut attempt = 0;
        loop {
            match self.store.append(message_id, chat_id, event.clone()).await {
                Ok(persisted) => return Some(persisted),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.retries {
                        error!(
                            message_id,
                            event_type = event.type_name(),
                            error = %e,
                            "event append failed after retries, buffering for flush"
                        );
                        self.failed.lock().push((
                            message_id.to_string(),
                            chat_id.to_string(),
                            event,
                        ));
                        return None;
                    }
                    warn!(
                        message_id,
                        attempt, error = %e, "retrying event persist at driver layer"
                    );
                    tokio::time::sleep(Duration::from_millis(self.backoff_ms * attempt as u64))
                        .await;
                }
            }
        }
    }

    /// Make one more attempt at everything currently buffered. Anything
    /// that still fails is logged and dropped — by this point it has
    /// already failed the store's own retries plus this writer's retries
    /// once already.
    pub async fn flush_failed_events(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.failed.lock());
        for (message_id, chat_id, event) in pending {
            if let Err(e) = self.store.append(&message_id, &chat_id, event.clone()).await {
                error!(
                    message_id,
                    event_type = event.type_name(),
                    error = %e,
                    "event permanently lost after flush retry"
                );
            }
        }
    }
}

struct RunOutcome {
    status: EndStatus,
    tool_calls: u32,
    final_text: Option<String>,
    error: Option<String>,
    interrupt: Option<(String, serde_json::Value)>,
}

/// Drive one agent run to completion, persisting every event along the
/// way. This is the future handed to `Registry::start_agent`; it never
/// panics out from under its caller (an internal `catch_unwind` turns a
/// graph/middleware panic into a `FAILED` run) and it always flushes
/// whatever the `RobustWriter` is still holding before returning.
pub async fn drive<S>(
    store: Arc<S>,
    messages: Arc<dyn MessageStore>,
    graph: Arc<dyn AgentGraph>,
    config: DriverConfig,
    emitter_capacity: usize,
    chat_id: String,
    message_id: String,
    query: String,
    metadata: serde_json::Value,
) where
    S: EventStore + ?Sized + 'static,
{
    // The store already retries its own writes with exponential backoff
    // (see `StoreConfig`); this second layer uses a small fixed linear
    // policy rather than exposing a second tunable for the same concern.
    let writer = RobustWriter::new(store, 2, 50);

    let _ = messages
        .update(&message_id, Box::new(|m| m.status = MessageStatus::Running))
        .await;

    let start = Instant::now();
    writer.persist(&message_id, &chat_id, StreamEvent::Start).await;

    let run = AssertUnwindSafe(run_checked(
        &writer,
        graph,
        config.clone(),
        emitter_capacity,
        chat_id.clone(),
        message_id.clone(),
        query,
        metadata,
    ))
    .catch_unwind()
    .await;

    let outcome = match run {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(&panic);
            error!(message_id = %message_id, "agent driver panicked: {message}");
            RunOutcome {
                status: EndStatus::Failed,
                tool_calls: 0,
                final_text: None,
                error: Some(message),
                interrupt: None,
            }
        }
    };

    finalize(&writer, &messages, &chat_id, &message_id, start, &config, outcome).await;
    writer.flush_failed_events().await;
}

/// Tender-scope preflight: rejects a run whose message-level `tender_id`
/// metadata disagrees with the thread's own scope. Stands in for the
/// real document/vector-store scope check (out of scope for this crate);
/// see the driver entry in DESIGN.md.
fn preflight_tender_scope(metadata: &serde_json::Value) -> Option<String> {
    let tender_id = metadata.get("tender_id").and_then(|v| v.as_str());
    let thread_scope = metadata.get("thread_scope").and_then(|v| v.as_str());
    match (tender_id, thread_scope) {
        (Some(tender_id), Some(scope)) if tender_id != scope => Some(format!(
            "message scoped to tender '{tender_id}' conflicts with thread scope '{scope}'"
        )),
        _ => None,
    }
}

async fn run_checked<S: EventStore + ?Sized>(
    writer: &RobustWriter<S>,
    graph: Arc<dyn AgentGraph>,
    config: DriverConfig,
    emitter_capacity: usize,
    chat_id: String,
    message_id: String,
    query: String,
    metadata: serde_json::Value,
) -> RunOutcome {
    if let Some(reason) = preflight_tender_scope(&metadata) {
        return RunOutcome {
            status: EndStatus::Failed,
            tool_calls: 0,
            final_text: None,
            error: Some(reason),
            interrupt: None,
        };
    }

    // Enhance the query with any pinned tender summary and populate the
    // virtual filesystem + cluster id unconditionally, so a downstream
    // checkpoint never drops them for lack of a pinned tender.
    let assembly = context::assemble(&query, &metadata);

    let (emitter, mut receiver) = Emitter::new(message_id.clone(), emitter_capacity);
    let ctx = GraphContext {
        chat_id: chat_id.clone(),
        message_id: message_id.clone(),
        query: assembly.enhanced_query,
        metadata,
        virtual_fs: assembly.virtual_fs,
        cluster_id: assembly.cluster_id,
        emitter,
    };
    let mut steps = graph.run(ctx).await;

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    heartbeat.tick().await; // first tick fires immediately; consume it

    let mut tool_calls: u32 = 0;
    let mut status = EndStatus::Completed;
    let mut final_text = None;
    let mut error_message = None;
    let mut interrupt = None;
    // Internal assistant-message ids already emitted as THINKING, so a
    // graph that re-yields the same in-progress message (common while it
    // streams a single turn token-by-token) doesn't produce duplicates.
    let mut seen_thinking_ids: HashSet<String> = HashSet::new();
    // Once the emitter's last sender drops, `recv()` resolves to `None`
    // on every poll — stop selecting on it rather than busy-spin while
    // still waiting for a terminal step.
    let mut emitter_open = true;

    loop {
        tokio::select! {
            biased;

            maybe_event = receiver.rx.recv(), if emitter_open => {
                match maybe_event {
                    Some(event) => {
                        if matches!(event, StreamEvent::ToolEnd { .. }) {
                            tool_calls += 1;
                        }
                        writer.persist(&message_id, &chat_id, event).await;
                    }
                    None => {
                        emitter_open = false;
                    }
                }
            }

            maybe_step = steps.next() => {
                match maybe_step {
                    Some(GraphStep::Assistant { internal_id, text, has_tool_calls }) => {
                        if !has_tool_calls {
                            if let Some(text) = text {
                                if seen_thinking_ids.insert(internal_id) {
                                    writer
                                        .persist(
                                            &message_id,
                                            &chat_id,
                                            StreamEvent::Thinking {
                                                text,
                                                agent_type: AgentType::Main,
                                                agent_id: None,
                                                parent_call_id: None,
                                            },
                                        )
                                        .await;
                                }
                            }
                        }
                    }
                    Some(GraphStep::Plan(items)) => {
                        writer.persist(&message_id, &chat_id, StreamEvent::Plan { items }).await;
                    }
                    Some(GraphStep::Interrupt { tool_name, payload }) => {
                        interrupt = Some((tool_name, payload));
                        status = EndStatus::Interrupted;
                        break;
                    }
                    Some(GraphStep::Final { text }) => {
                        final_text = Some(text);
                        status = EndStatus::Completed;
                        break;
                    }
                    Some(GraphStep::Failed { message }) => {
                        error_message = Some(message);
                        status = EndStatus::Failed;
                        break;
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                writer
                    .persist(&message_id, &chat_id, StreamEvent::Status { text: "working".into() })
                    .await;
            }
        }
    }

    drain_remaining(&mut receiver, writer, &message_id, &chat_id, &mut tool_calls).await;

    RunOutcome { status, tool_calls, final_text, error: error_message, interrupt }
}

/// Drain whatever the emitter's queue is still holding, without waiting
/// for more — called once the step stream has told us the run is over.
async fn drain_remaining<S: EventStore + ?Sized>(
    receiver: &mut EmitterReceiver,
    writer: &RobustWriter<S>,
    message_id: &str,
    chat_id: &str,
    tool_calls: &mut u32,
) {
    while let Ok(event) = receiver.rx.try_recv() {
        if matches!(event, StreamEvent::ToolEnd { .. }) {
            *tool_calls += 1;
        }
        writer.persist(message_id, chat_id, event).await;
    }
}

async fn persist_content_chunks<S: EventStore + ?Sized>(
    writer: &RobustWriter<S>,
    message_id: &str,
    chat_id: &str,
    text: &str,
    words_per_chunk: usize,
    delay: Duration,
) {
    writer.persist(message_id, chat_id, StreamEvent::ContentStart).await;

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        writer
            .persist(message_id, chat_id, StreamEvent::Content { md: String::new() })
            .await;
    } else {
        for (i, chunk) in words.chunks(words_per_chunk.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(delay).await;
            }
            writer
                .persist(message_id, chat_id, StreamEvent::Content { md: chunk.join(" ") })
                .await;
        }
    }

    writer.persist(message_id, chat_id, StreamEvent::ContentEnd).await;
}

async fn finalize<S: EventStore + ?Sized>(
    writer: &RobustWriter<S>,
    messages: &Arc<dyn MessageStore>,
    chat_id: &str,
    message_id: &str,
    start: Instant,
    config: &DriverConfig,
    outcome: RunOutcome,
) {
    if let Some(error) = &outcome.error {
        writer
            .persist(message_id, chat_id, StreamEvent::Error { error: error.clone() })
            .await;
    }

    let thread_id = format!("chat_{chat_id}");

    if matches!(outcome.status, EndStatus::Interrupted) {
        if let Some((tool_name, payload)) = &outcome.interrupt {
            let question = payload.get("question").cloned().unwrap_or(serde_json::Value::Null);
            let context = payload.get("context").cloned().unwrap_or(serde_json::Value::Null);
            let status_payload = serde_json::json!({
                "interrupt": true,
                "tool": tool_name,
                "question": question,
                "context": context,
                "thread_id": thread_id,
                "instructions": "Human input required. Use resume endpoint to continue.",
            });
            let text = serde_json::to_string(&status_payload)
                .unwrap_or_else(|_| format!("waiting for human input: {tool_name}"));
            writer.persist(message_id, chat_id, StreamEvent::Status { text }).await;
        }
    }

    if matches!(outcome.status, EndStatus::Completed) {
        if let Some(text) = &outcome.final_text {
            persist_content_chunks(
                writer,
                message_id,
                chat_id,
                text,
                config.content_chunk_words,
                Duration::from_millis(config.content_chunk_delay_ms),
            )
            .await;
        }
    }

    let ms_total = start.elapsed().as_millis() as u64;
    writer
        .persist(
            message_id,
            chat_id,
            StreamEvent::End { status: outcome.status, ms_total, tool_calls: outcome.tool_calls },
        )
        .await;

    let message_status = match outcome.status {
        EndStatus::Completed => MessageStatus::Completed,
        // No terminal "interrupted" message status (spec.md §3): the run
        // stays `Running` with `interrupted=true` metadata until resumed.
        EndStatus::Interrupted => MessageStatus::Running,
        EndStatus::Failed => MessageStatus::Failed,
    };
    let final_text = outcome.final_text.clone();
    let error = outcome.error.clone();
    let interrupted = matches!(outcome.status, EndStatus::Interrupted);
    let interrupt_payload = outcome.interrupt.clone().map(|(tool_name, payload)| {
        serde_json::json!({
            "tool": tool_name,
            "question": payload.get("question").cloned().unwrap_or(serde_json::Value::Null),
            "context": payload.get("context").cloned().unwrap_or(serde_json::Value::Null),
            "thread_id": thread_id,
        })
    });
    let resume_thread_id = interrupted.then(|| thread_id.clone());

    let _ = messages
        .update(
            message_id,
            Box::new(move |m| {
                m.status = message_status;
                m.final_text = final_text;
                m.error = error;
                m.interrupted = interrupted;
                if resume_thread_id.is_some() {
                    m.thread_id = resume_thread_id;
                }
                m.interrupt_payload = interrupt_payload;
            }),
        )
        .await;
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
    use crate::event::{PlanItem, PlanItemStatus, ToolStatus};
    use crate::graph::{ScriptedAction, ScriptedGraph};
    use crate::persistence::JsonlEventStore;
    use crate::registry::Registry;
    use std::path::PathBuf;

    fn test_config() -> DriverConfig {
        DriverConfig {
            heartbeat_interval_secs: 3600,
            content_chunk_words: 3,
            content_chunk_delay_ms: 0,
        }
    }

    fn test_store() -> (Arc<JsonlEventStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Arc::new(JsonlEventStore::new(dir.path(), 3, 1)), dir)
    }

    fn test_messages(dir: &tempfile::TempDir) -> Arc<dyn MessageStore> {
        let path: PathBuf = dir.path().join("messages.jsonl");
        Arc::new(crate::message::JsonlMessageStore::new(path).unwrap())
    }

    #[tokio::test]
    async fn happy_path_produces_start_content_and_end() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Final {
            text: "one two three four five".into(),
        })]));

        drive(
            store.clone(),
            messages.clone(),
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event.type_name()).collect();
        assert_eq!(names.first(), Some(&"START"));
        assert!(names.contains(&"CONTENT_START"));
        assert!(names.contains(&"CONTENT"));
        assert!(names.contains(&"CONTENT_END"));
        assert_eq!(names.last(), Some(&"END"));

        let message = messages.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert_eq!(message.final_text.as_deref(), Some("one two three four five"));
    }

    #[tokio::test]
    async fn tool_pipeline_events_are_persisted_and_counted() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![
            ScriptedAction::Emit(StreamEvent::ToolStart {
                call_id: "t1".into(),
                name: "search_tender_corpus".into(),
                args_summary: "query='x'".into(),
                args_display: None,
            }),
            ScriptedAction::Emit(StreamEvent::ToolEnd {
                call_id: "t1".into(),
                name: "search_tender_corpus".into(),
                status: ToolStatus::Ok,
                ms: 5,
                result_summary: "Found 3 results".into(),
            }),
            ScriptedAction::Yield(GraphStep::Final { text: "done".into() }),
        ]));

        drive(
            store.clone(),
            messages,
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event.type_name()).collect();
        assert!(names.contains(&"TOOL_START"));
        assert!(names.contains(&"TOOL_END"));

        let end = events.iter().find(|e| matches!(e.event, StreamEvent::End { .. })).unwrap();
        if let StreamEvent::End { tool_calls, .. } = &end.event {
            assert_eq!(*tool_calls, 1);
        }
    }

    #[tokio::test]
    async fn plan_steps_are_persisted() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![
            ScriptedAction::Yield(GraphStep::Plan(vec![PlanItem {
                id: "p1".into(),
                text: "search".into(),
                status: PlanItemStatus::Pending,
            }])),
            ScriptedAction::Yield(GraphStep::Final { text: "done".into() }),
        ]));

        drive(
            store.clone(),
            messages,
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        assert!(events.iter().any(|e| matches!(e.event, StreamEvent::Plan { .. })));
    }

    #[tokio::test]
    async fn hitl_interrupt_leaves_the_message_running_with_metadata() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Interrupt {
            tool_name: "ask_human".into(),
            payload: serde_json::json!({ "question": "which tender?" }),
        })]));

        drive(
            store.clone(),
            messages.clone(),
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        let end = events.iter().find(|e| matches!(e.event, StreamEvent::End { .. })).unwrap();
        assert!(matches!(end.event, StreamEvent::End { status: EndStatus::Interrupted, .. }));

        let status = events
            .iter()
            .find_map(|e| match &e.event {
                StreamEvent::Status { text } if text.contains("interrupt") => Some(text.clone()),
                _ => None,
            })
            .unwrap();
        let status_json: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status_json["interrupt"], true);
        assert_eq!(status_json["question"], "which tender?");
        assert_eq!(status_json["thread_id"], "chat_c1");

        let message = messages.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Running);
        assert!(!message.status.is_terminal());
        assert!(message.interrupted);
        assert_eq!(message.thread_id.as_deref(), Some("chat_c1"));
        assert!(message.interrupt_payload.is_some());
    }

    #[tokio::test]
    async fn repeated_assistant_internal_id_is_not_re_emitted_as_thinking() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![
            ScriptedAction::Yield(GraphStep::Assistant {
                internal_id: "a1".into(),
                text: Some("considering the tender deadline".into()),
                has_tool_calls: false,
            }),
            ScriptedAction::Yield(GraphStep::Assistant {
                internal_id: "a1".into(),
                text: Some("considering the tender deadline and scope".into()),
                has_tool_calls: false,
            }),
            ScriptedAction::Yield(GraphStep::Final { text: "done".into() }),
        ]));

        drive(
            store.clone(),
            messages,
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        let thinking_count = events.iter().filter(|e| matches!(e.event, StreamEvent::Thinking { .. })).count();
        assert_eq!(thinking_count, 1);
    }

    #[tokio::test]
    async fn fatal_error_ends_the_run_as_failed() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Failed {
            message: "llm provider unreachable".into(),
        })]));

        drive(
            store.clone(),
            messages.clone(),
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        assert!(events.iter().any(|e| matches!(e.event, StreamEvent::Error { .. })));
        let end = events.iter().find(|e| matches!(e.event, StreamEvent::End { .. })).unwrap();
        assert!(matches!(end.event, StreamEvent::End { status: EndStatus::Failed, .. }));

        let message = messages.get("m1").await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn tender_scope_mismatch_fails_before_invoking_the_graph() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        // A graph that would panic if it were ever invoked.
        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Final {
            text: "should never run".into(),
        })]));

        let metadata = serde_json::json!({ "tender_id": "T1", "thread_scope": "T2" });

        drive(
            store.clone(),
            messages.clone(),
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            metadata,
        )
        .await;

        let events = store.get_events("m1", None, 1000).await.unwrap();
        let end = events.iter().find(|e| matches!(e.event, StreamEvent::End { .. })).unwrap();
        assert!(matches!(end.event, StreamEvent::End { status: EndStatus::Failed, .. }));
        assert!(!events.iter().any(|e| e.event.type_name() == "CONTENT"));
    }

    #[tokio::test]
    async fn two_watchers_see_the_same_persisted_events() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Final {
            text: "done".into(),
        })]));

        drive(
            store.clone(),
            messages,
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let registry = Arc::new(Registry::new());
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let (sa, sb) = (seen_a.clone(), seen_b.clone());

        let watch_a = crate::watcher::watch(
            &*store,
            &registry,
            crate::watcher::WatcherConfig {
                message_id: "m1".into(),
                since_id: None,
                poll_interval: Duration::from_millis(5),
                max_wait: Duration::from_secs(5),
                dedup_capacity: 64,
            },
            move |e| {
                sa.lock().push(e.event.type_name().to_string());
                true
            },
        );
        let watch_b = crate::watcher::watch(
            &*store,
            &registry,
            crate::watcher::WatcherConfig {
                message_id: "m1".into(),
                since_id: None,
                poll_interval: Duration::from_millis(5),
                max_wait: Duration::from_secs(5),
                dedup_capacity: 64,
            },
            move |e| {
                sb.lock().push(e.event.type_name().to_string());
                true
            },
        );
        tokio::join!(watch_a, watch_b);

        assert_eq!(*seen_a.lock(), *seen_b.lock());
        assert_eq!(seen_a.lock().last(), Some(&"END".to_string()));
    }

    #[tokio::test]
    async fn reconnecting_watcher_resumes_from_since_id_without_duplicates() {
        let (store, dir) = test_store();
        let messages = test_messages(&dir);
        messages
            .create(crate::message::Message::new_user_turn("m1", "c1", "hello"))
            .await
            .unwrap();

        let graph = Arc::new(ScriptedGraph::new(vec![ScriptedAction::Yield(GraphStep::Final {
            text: "one two three four five six".into(),
        })]));

        drive(
            store.clone(),
            messages,
            graph,
            test_config(),
            16,
            "c1".into(),
            "m1".into(),
            "hello".into(),
            serde_json::Value::Null,
        )
        .await;

        let registry = Arc::new(Registry::new());
        let all_events = store.get_events("m1", None, 1000).await.unwrap();
        let midpoint = all_events[all_events.len() / 2].id.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        crate::watcher::watch(
            &*store,
            &registry,
            crate::watcher::WatcherConfig {
                message_id: "m1".into(),
                since_id: Some(midpoint.clone()),
                poll_interval: Duration::from_millis(5),
                max_wait: Duration::from_secs(5),
                dedup_capacity: 64,
            },
            move |e| {
                seen2.lock().push(e.id.clone());
                true
            },
        )
        .await;

        assert!(!seen.lock().contains(&midpoint));
        assert!(!seen.lock().is_empty());
    }
}
