//! The agent graph collaborator boundary.
//!
//! The planner/executor pipeline itself is out of scope for this crate
//! (spec's "opaque driver that yields step snapshots"); what lives here is
//! only the seam the driver talks to, plus a scripted test double that
//! stands in for a real graph in unit tests.
//!
//! Tool-call and sub-agent instrumentation is modeled as middleware that
//! holds the same [`Emitter`] the driver handed to the graph at call time
//! (the `GraphContext`) — an explicit context object, not a task-local or
//! process-global, per the REDESIGN FLAGS in spec.md §9.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;

use crate::emitter::Emitter;
use crate::event::PlanItem;

/// Everything a graph invocation needs, handed to it by value for the
/// lifetime of one run. `query` is already the *enhanced* query (tender
/// summary folded in by `context::assemble`); `virtual_fs` and
/// `cluster_id` are the other two pieces of initial agent state spec.md
/// §4.5 step 2 calls out, set unconditionally so a downstream checkpoint
/// never drops them for lack of a pinned tender.
pub struct GraphContext {
    pub chat_id: String,
    pub message_id: String,
    pub query: String,
    pub metadata: serde_json::Value,
    pub virtual_fs: BTreeMap<String, String>,
    pub cluster_id: Option<String>,
    pub emitter: Emitter,
}

/// One observation surfaced by the agent graph's step stream. The driver
/// inspects only these; everything else (tool dispatch, sub-agent
/// delegation, planning internals) is middleware writing directly to the
/// `GraphContext`'s emitter.
#[derive(Debug, Clone)]
pub enum GraphStep {
    /// A (possibly partial) assistant message surfaced by the graph.
    /// `has_tool_calls` distinguishes tool-call-only messages (never
    /// emitted as `THINKING`) from textual reasoning.
    Assistant {
        internal_id: String,
        text: Option<String>,
        has_tool_calls: bool,
    },
    /// A plan update.
    Plan(Vec<PlanItem>),
    /// The graph is requesting human input. `payload` most commonly
    /// carries `{question, context}`.
    Interrupt {
        tool_name: String,
        payload: serde_json::Value,
    },
    /// The graph finished normally; carries the final assistant text.
    Final { text: String },
    /// The graph hit an unrecoverable error.
    Failed { message: String },
}

pub type BoxGraphStream = Pin<Box<dyn futures_core::Stream<Item = GraphStep> + Send>>;

/// The opaque collaborator: something that, given a context, produces a
/// step stream. A real implementation wraps the LLM-driven planner;
/// `ScriptedGraph` below is a deterministic test double.
#[async_trait]
pub trait AgentGraph: Send + Sync {
    async fn run(&self, ctx: GraphContext) -> BoxGraphStream;
}

/// One action in a scripted run: either yield a step to the driver, push
/// an event directly onto the context's emitter (simulating tool/subagent
/// middleware), or pause (simulating think time, useful for exercising
/// the driver's heartbeat).
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    Emit(crate::event::StreamEvent),
    Yield(GraphStep),
    Sleep(std::time::Duration),
}

/// A fixed, deterministic [`AgentGraph`] used by driver tests: replays a
/// canned sequence of actions against whatever emitter the driver hands
/// it, regardless of `query`/`metadata`.
pub struct ScriptedGraph {
    actions: Vec<ScriptedAction>,
}

impl ScriptedGraph {
    pub fn new(actions: Vec<ScriptedAction>) -> Self {
        Self { actions }
    }
}

#[async_trait]
impl AgentGraph for ScriptedGraph {
    async fn run(&self, ctx: GraphContext) -> BoxGraphStream {
        let actions = self.actions.clone();
        Box::pin(async_stream::stream! {
            let emitter = ctx.emitter;
            for action in actions {
                match action {
                    ScriptedAction::Emit(event) => emitter.emit(event),
                    ScriptedAction::Sleep(d) => tokio::time::sleep(d).await,
                    ScriptedAction::Yield(step) => yield step,
                }
            }
        })
    }
}

/// Placeholder used when no real agent graph has been wired in yet.
/// Immediately fails every run rather than hanging — the real planner is
/// out of scope for this crate and is expected to be supplied by
/// whatever embeds it.
pub struct UnconfiguredGraph;

#[async_trait]
impl AgentGraph for UnconfiguredGraph {
    async fn run(&self, _ctx: GraphContext) -> BoxGraphStream {
        Box::pin(async_stream::stream! {
            yield GraphStep::Failed {
                message: "no agent graph configured".into(),
            };
        })
    }
}
