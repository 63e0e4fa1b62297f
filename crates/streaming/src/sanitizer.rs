//! Redacts tool call arguments and results before they're allowed into a
//! persisted event. Argument whitelisting is a data-driven table keyed by
//! tool name, not per-tool match arms, so adding a tool's *args* means
//! adding a table row. Result summaries are terser, tool-specific phrases
//! ("Found N results", "Updated file") rather than a generic field dump,
//! so those stay a small per-tool match.

use ts_domain::util::truncate_str;

const FIELD_MAX: usize = 100;
const ERROR_MAX: usize = 200;

/// Which argument fields are safe to surface for a given tool, and in
/// what order they should be joined into a one-line summary. An empty
/// `fields` slice means the tool is known but has nothing safe to show.
struct ArgWhitelist {
    tool: &'static str,
    fields: &'static [&'static str],
}

const ARG_WHITELISTS: &[ArgWhitelist] = &[
    ArgWhitelist { tool: "search_tender_corpus", fields: &["query"] },
    ArgWhitelist { tool: "get_file_content", fields: &["file_id"] },
    ArgWhitelist { tool: "web_search", fields: &["query"] },
    ArgWhitelist { tool: "read_file", fields: &["file_path"] },
    ArgWhitelist { tool: "write_file", fields: &["file_path"] },
    ArgWhitelist { tool: "edit_file", fields: &["file_path"] },
    ArgWhitelist { tool: "ls", fields: &[] },
    ArgWhitelist { tool: "write_todos", fields: &[] },
    ArgWhitelist { tool: "task", fields: &["subagent_type"] },
];

fn arg_whitelist(tool: &str) -> Option<&'static ArgWhitelist> {
    ARG_WHITELISTS.iter().find(|w| w.tool == tool)
}

/// Build the one-line `args_summary` shown in a `TOOL_START` event.
///
/// Only whitelisted fields for the named tool are consulted; everything
/// else in `args` is invisible to the summary regardless of content.
/// String values are single-quoted, other JSON scalars render bare.
pub fn sanitize_args(tool: &str, args: &serde_json::Value) -> String {
    let Some(whitelist) = arg_whitelist(tool) else {
        return "(redacted)".to_string();
    };
    if whitelist.fields.is_empty() {
        return "(no args)".to_string();
    }
    let parts: Vec<String> = whitelist
        .fields
        .iter()
        .filter_map(|field| {
            args.get(field).map(|v| match v {
                serde_json::Value::String(s) => format!("{field}='{}'", truncate_str(s, FIELD_MAX)),
                other => format!("{field}={}", truncate_str(&render_value(other), FIELD_MAX)),
            })
        })
        .collect();
    if parts.is_empty() {
        "(no args)".to_string()
    } else {
        parts.join(", ")
    }
}

/// Build the one-line `result_summary` shown in a `TOOL_END` event.
///
/// Tools not in the result whitelist below, and tools whose result
/// carries none of the expected fields, fall back to a generic
/// "Completed"/"Read file" style phrase rather than leaking raw fields.
pub fn sanitize_result(tool: &str, result: &serde_json::Value) -> String {
    if result_signals_error(result) {
        return "Failed".to_string();
    }
    match tool {
        "search_tender_corpus" => match result.get("num_results").and_then(|v| v.as_u64()) {
            Some(n) => format!("Found {n} results"),
            None => "Found results".to_string(),
        },
        "get_file_content" | "read_file" => match result.get("line_count").and_then(|v| v.as_u64()) {
            Some(n) => format!("Read {n} lines"),
            None => "Read file".to_string(),
        },
        "write_file" | "edit_file" => "Updated file".to_string(),
        "ls" => match result.get("num_files").and_then(|v| v.as_u64()) {
            Some(n) => format!("Listed {n} items"),
            None => "Listed directory".to_string(),
        },
        "web_search" => "Found web results".to_string(),
        _ => "Completed".to_string(),
    }
}

/// Sanitize a tool error message for display: strip any leading
/// filesystem path, keep only the first line, cap the length.
pub fn sanitize_error(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("");
    let stripped = match first_line.rsplit_once('/') {
        Some((_, tail)) if first_line.contains(": ") => tail,
        _ => first_line,
    };
    truncate_str(stripped, ERROR_MAX)
}

/// Whether a raw tool result signals failure: an `error` key present (with
/// a truthy value) or a `status` field equal to `"error"`/`"failed"`.
fn result_signals_error(result: &serde_json::Value) -> bool {
    let has_error_field = result
        .get("error")
        .map(|v| !matches!(v, serde_json::Value::Null | serde_json::Value::Bool(false)))
        .unwrap_or(false);
    let status_says_error = result
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.eq_ignore_ascii_case("error") || s.eq_ignore_ascii_case("failed"))
        .unwrap_or(false);
    has_error_field || status_says_error
}

fn render_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_tool_args_are_fully_redacted() {
        assert_eq!(sanitize_args("delete_database", &json!({"table": "users"})), "(redacted)");
    }

    #[test]
    fn known_tool_surfaces_only_whitelisted_fields_with_quoted_strings() {
        let args = json!({"query": "water treatment plants", "internal_flag": true});
        let summary = sanitize_args("search_tender_corpus", &args);
        assert_eq!(summary, "query='water treatment plants'");
        assert!(!summary.contains("internal_flag"));
    }

    #[test]
    fn tool_with_empty_whitelist_always_reports_no_args() {
        assert_eq!(sanitize_args("ls", &json!({"path": "/tmp"})), "(no args)");
        assert_eq!(sanitize_args("write_todos", &json!({"todos": ["a", "b"]})), "(no args)");
    }

    #[test]
    fn missing_whitelisted_field_is_skipped_not_blank() {
        let args = json!({"other": "x"});
        assert_eq!(sanitize_args("read_file", &args), "(no args)");
    }

    #[test]
    fn empty_args_yields_placeholder() {
        assert_eq!(sanitize_args("read_file", &json!({})), "(no args)");
    }

    #[test]
    fn long_field_value_is_truncated() {
        let long = "x".repeat(200);
        let args = json!({"query": long});
        let summary = sanitize_args("web_search", &args);
        assert!(summary.len() < 200 + "query='".len());
        assert!(summary.ends_with("...'"));
    }

    #[test]
    fn numeric_arg_is_not_quoted() {
        assert_eq!(sanitize_args("task", &json!({"subagent_type": "researcher"})), "subagent_type='researcher'");
    }

    #[test]
    fn unknown_tool_result_falls_back_to_completed() {
        assert_eq!(sanitize_result("delete_database", &json!({"rows": 9999})), "Completed");
    }

    #[test]
    fn search_result_reports_found_count() {
        let result = json!({"num_results": 12});
        assert_eq!(sanitize_result("search_tender_corpus", &result), "Found 12 results");
    }

    #[test]
    fn search_result_without_count_falls_back() {
        assert_eq!(sanitize_result("search_tender_corpus", &json!({"sources": []})), "Found results");
    }

    #[test]
    fn read_file_reports_line_count() {
        let result = json!({"line_count": 42});
        assert_eq!(sanitize_result("read_file", &result), "Read 42 lines");
        assert_eq!(sanitize_result("get_file_content", &result), "Read 42 lines");
    }

    #[test]
    fn write_and_edit_file_report_updated() {
        assert_eq!(sanitize_result("write_file", &json!({"success": true})), "Updated file");
        assert_eq!(sanitize_result("edit_file", &json!({"success": true})), "Updated file");
    }

    #[test]
    fn ls_reports_item_count() {
        assert_eq!(sanitize_result("ls", &json!({"num_files": 7})), "Listed 7 items");
    }

    #[test]
    fn web_search_reports_found_web_results() {
        assert_eq!(sanitize_result("web_search", &json!({"num_results": 3})), "Found web results");
    }

    #[test]
    fn result_with_error_field_reports_failed_even_for_known_tools() {
        let result = json!({"error": "timeout", "num_results": 0});
        assert_eq!(sanitize_result("search_tender_corpus", &result), "Failed");
    }

    #[test]
    fn result_with_error_status_reports_failed() {
        let result = json!({"status": "error"});
        assert_eq!(sanitize_result("write_file", &result), "Failed");
    }

    #[test]
    fn null_error_field_does_not_count_as_failure() {
        let result = json!({"error": null, "num_results": 3});
        assert_eq!(sanitize_result("search_tender_corpus", &result), "Found 3 results");
    }

    #[test]
    fn error_message_strips_path_and_keeps_first_line() {
        let msg = "/var/data/tenders/2024/file.pdf: permission denied\nfull traceback here...";
        assert_eq!(sanitize_error(msg), "file.pdf: permission denied");
    }

    #[test]
    fn error_message_without_path_is_unchanged_but_capped() {
        let msg = "connection refused";
        assert_eq!(sanitize_error(msg), "connection refused");
    }

    #[test]
    fn error_message_over_cap_is_truncated() {
        let msg = "a".repeat(300);
        assert_eq!(sanitize_error(&msg).len(), ERROR_MAX + 3);
    }
}
