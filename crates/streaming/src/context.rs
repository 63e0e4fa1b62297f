//! Context assembly: the driver's `Running` state (spec.md §4.5 step 2)
//! builds the agent's initial state before invoking the graph. Grounded in
//! the teacher's `ContextPackBuilder` (`src/context/builder.rs`), which
//! reads a fixed set of workspace files in order and assembles them into a
//! system prompt; generalized here to the three pre-loaded tender context
//! files a subagent-passing middleware filters down to in the original
//! Python implementation (`tender_summary.md`, `file_index.json`,
//! `cluster_id.txt`).
//!
//! These seed values are set unconditionally — present as empty entries
//! when the caller supplies nothing — so a downstream checkpoint of the
//! graph state never silently drops them.

use std::collections::BTreeMap;

pub const TENDER_SUMMARY_PATH: &str = "/workspace/context/tender_summary.md";
pub const FILE_INDEX_PATH: &str = "/workspace/context/file_index.json";
pub const CLUSTER_ID_PATH: &str = "/workspace/context/cluster_id.txt";

/// The initial agent state the driver hands the graph: the user's query,
/// enhanced with a tender summary when one is pinned, plus a virtual
/// filesystem of pre-loaded context files and a cluster identifier used to
/// scope retrieval tools.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembly {
    pub enhanced_query: String,
    /// Workspace-path -> file content, always populated with all three
    /// well-known paths (empty string when the caller didn't supply one).
    pub virtual_fs: BTreeMap<String, String>,
    pub cluster_id: Option<String>,
}

/// Build the initial agent state from the raw query plus whatever the
/// request's `metadata` bag carries. Recognized metadata keys:
/// `tender_summary` (string), `file_index` (any JSON value, stored as its
/// compact string form), `cluster_id` (string).
pub fn assemble(query: &str, metadata: &serde_json::Value) -> ContextAssembly {
    let tender_summary = metadata.get("tender_summary").and_then(|v| v.as_str());
    let file_index = metadata.get("file_index");
    let cluster_id = metadata
        .get("cluster_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut virtual_fs = BTreeMap::new();
    virtual_fs.insert(TENDER_SUMMARY_PATH.to_string(), tender_summary.unwrap_or("").to_string());
    virtual_fs.insert(
        FILE_INDEX_PATH.to_string(),
        file_index.map(|v| v.to_string()).unwrap_or_default(),
    );
    virtual_fs.insert(CLUSTER_ID_PATH.to_string(), cluster_id.clone().unwrap_or_default());

    let enhanced_query = match tender_summary {
        Some(summary) if !summary.is_empty() => {
            format!("{query}\n\n---\nTender summary:\n{summary}")
        }
        _ => query.to_string(),
    };

    ContextAssembly { enhanced_query, virtual_fs, cluster_id }
}
