//! The closed event model: one durable observation per agent step.
//!
//! `StreamEvent` is the public, wire-facing shape (tagged union, schema
//! version `v`). `PersistedEvent` wraps it with the fields persistence adds
//! (`message_id`, `chat_id`, `seq`) once an event has actually been written
//! to the log.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: u32 = 2;

/// Status of a single plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanItemStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub id: String,
    pub text: String,
    pub status: PlanItemStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndStatus {
    Completed,
    Interrupted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Main,
    Subagent,
}

/// The closed set of observable agent events. Tagged on `type`; unknown
/// fields on deserialize are ignored per the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamEvent {
    Start,
    Plan {
        items: Vec<PlanItem>,
    },
    Thinking {
        text: String,
        agent_type: AgentType,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_call_id: Option<String>,
    },
    ToolStart {
        call_id: String,
        name: String,
        args_summary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args_display: Option<String>,
    },
    ToolEnd {
        call_id: String,
        name: String,
        status: ToolStatus,
        ms: u64,
        result_summary: String,
    },
    SubagentStart {
        agent_id: String,
        parent_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    SubagentEnd {
        agent_id: String,
        parent_call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ms: Option<u64>,
    },
    ContentStart,
    Content {
        md: String,
    },
    ContentEnd,
    Status {
        text: String,
    },
    /// Deprecated alias of `Thinking`. Accepted on read; never emitted.
    Rationale {
        text: String,
    },
    End {
        status: EndStatus,
        ms_total: u64,
        tool_calls: u32,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    /// Whether this variant may be silently dropped by the emitter's
    /// bounded queue under backpressure.
    pub fn droppable(&self) -> bool {
        matches!(self, StreamEvent::Status { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::Start => "START",
            StreamEvent::Plan { .. } => "PLAN",
            StreamEvent::Thinking { .. } => "THINKING",
            StreamEvent::ToolStart { .. } => "TOOL_START",
            StreamEvent::ToolEnd { .. } => "TOOL_END",
            StreamEvent::SubagentStart { .. } => "SUBAGENT_START",
            StreamEvent::SubagentEnd { .. } => "SUBAGENT_END",
            StreamEvent::ContentStart => "CONTENT_START",
            StreamEvent::Content { .. } => "CONTENT",
            StreamEvent::ContentEnd => "CONTENT_END",
            StreamEvent::Status { .. } => "STATUS",
            StreamEvent::Rationale { .. } => "RATIONALE",
            StreamEvent::End { .. } => "END",
            StreamEvent::Error { .. } => "ERROR",
        }
    }
}

/// An event as it exists once persisted: envelope fields plus the typed
/// payload. This is what `EventStore` reads and writes and what the
/// watcher rehydrates into the public wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub v: u32,
    #[serde(flatten)]
    pub event: StreamEvent,
    pub id: String,
    pub ts: chrono::DateTime<chrono::Utc>,
    pub message_id: String,
    pub chat_id: String,
    pub seq: u64,
}

/// Generate an event ID of the form `{timestamp_ms}_{seq:04d}_{random8hex}`.
///
/// Lexicographic order matches chronological order for a given `message_id`
/// only because `seq` is the atomically-allocated per-message counter,
/// zero-padded to a fixed width.
pub fn generate_event_id(seq: u64, now_ms: i64) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{now_ms}_{seq:04}_{}", &random[..8])
}

/// Parse the `seq` embedded in an event ID. Returns `None` if the ID
/// doesn't match the expected `{ts}_{seq}_{rand}` shape — callers treat
/// that as "replay from the beginning".
pub fn parse_seq_from_id(id: &str) -> Option<u64> {
    id.split('_').nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_seq() {
        let id = generate_event_id(42, 1_700_000_000_000);
        assert_eq!(parse_seq_from_id(&id), Some(42));
    }

    #[test]
    fn id_format_is_fixed_width() {
        let id = generate_event_id(7, 0);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "0007");
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn malformed_id_parses_to_none() {
        assert_eq!(parse_seq_from_id("not-an-event-id"), None);
        assert_eq!(parse_seq_from_id(""), None);
    }

    #[test]
    fn status_is_droppable_others_are_not() {
        assert!(StreamEvent::Status { text: "hi".into() }.droppable());
        assert!(!StreamEvent::Start.droppable());
        assert!(!StreamEvent::Error { error: "x".into() }.droppable());
    }

    #[test]
    fn serializes_with_screaming_snake_tag() {
        let ev = StreamEvent::ToolStart {
            call_id: "c1".into(),
            name: "search".into(),
            args_summary: "query='x'".into(),
            args_display: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "TOOL_START");
        assert!(json.get("args_display").is_none());
    }

    #[test]
    fn rationale_deserializes_but_is_never_constructed_by_emit_helpers() {
        let raw = r#"{"type":"RATIONALE","text":"legacy"}"#;
        let ev: StreamEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(ev, StreamEvent::Rationale { .. }));
    }
}
