//! Duplicate-query detection.
//!
//! A per-task index of how many times each query string has been sent to
//! each `(agent, tool)` pair. The orchestrator consults it before executing
//! a tool call and rolls back repeats; counts are recorded only *after* a
//! call actually executes, so a rolled-back attempt does not poison the
//! index.

use serde_json::Value;
use std::collections::HashMap;

/// The sub-agent pseudo-tool; its dedup key is the subtask text.
pub const SUB_AGENT_TOOL: &str = "search_and_browse";

/// Extract the dedup key for a tool call, or `None` for tools that have no
/// meaningful notion of a repeated query (e.g. code execution).
///
/// Tool-specific: web search keys on the query string, page fetch on the
/// URL, sub-agent invocation on the subtask text.
pub fn extract_query(tool_name: &str, args: &Value) -> Option<String> {
    let field = if tool_name == SUB_AGENT_TOOL {
        args.get("subtask")
    } else if tool_name.contains("search") {
        args.get("q")
            .or_else(|| args.get("query"))
            .or_else(|| args.get("keyword"))
    } else if ["scrape", "browse", "fetch", "visit"]
        .iter()
        .any(|w| tool_name.contains(w))
    {
        args.get("url")
    } else {
        None
    };

    field
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Per-task duplicate-query index: `(agent, tool) → query → count`.
///
/// Counts are monotonic non-decreasing for the lifetime of the task.
#[derive(Debug, Default)]
pub struct QueryIndex {
    counts: HashMap<(String, String), HashMap<String, u32>>,
}

impl QueryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times this exact query (after trimming) has already been
    /// executed by this `(agent, tool)` pair.
    pub fn count(&self, agent: &str, tool: &str, query: &str) -> u32 {
        self.counts
            .get(&(agent.to_string(), tool.to_string()))
            .and_then(|m| m.get(query.trim()))
            .copied()
            .unwrap_or(0)
    }

    /// Record one executed query. Call only after the tool call ran.
    pub fn record(&mut self, agent: &str, tool: &str, query: &str) {
        *self
            .counts
            .entry((agent.to_string(), tool.to_string()))
            .or_default()
            .entry(query.trim().to_string())
            .or_insert(0) += 1;
    }

    /// Sum of all counts; equals the number of executed tool calls whose
    /// extractor returned a key.
    pub fn total(&self) -> u64 {
        self.counts
            .values()
            .flat_map(|m| m.values())
            .map(|&c| c as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_search_query() {
        assert_eq!(
            extract_query("google_search", &json!({"q": " rust "})),
            Some("rust".to_string())
        );
        assert_eq!(
            extract_query("web_search", &json!({"query": "tokio"})),
            Some("tokio".to_string())
        );
        assert_eq!(
            extract_query("image_search", &json!({"keyword": "crab"})),
            Some("crab".to_string())
        );
    }

    #[test]
    fn test_extract_fetch_url() {
        assert_eq!(
            extract_query("scrape_page", &json!({"url": "https://example.com"})),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            extract_query("visit_webpage", &json!({"url": "https://example.com"})),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn test_extract_sub_agent_subtask() {
        assert_eq!(
            extract_query(SUB_AGENT_TOOL, &json!({"subtask": "find the census figure"})),
            Some("find the census figure".to_string())
        );
    }

    #[test]
    fn test_extract_none_for_other_tools() {
        assert_eq!(extract_query("python", &json!({"code": "print(1)"})), None);
    }

    #[test]
    fn test_extract_none_for_missing_field() {
        assert_eq!(extract_query("google_search", &json!({"limit": 5})), None);
        assert_eq!(extract_query("google_search", &json!({"q": "   "})), None);
    }

    #[test]
    fn test_count_and_record() {
        let mut index = QueryIndex::new();
        assert_eq!(index.count("main", "google_search", "rust"), 0);

        index.record("main", "google_search", "rust");
        assert_eq!(index.count("main", "google_search", "rust"), 1);

        // Trimming makes these the same key.
        index.record("main", "google_search", "  rust ");
        assert_eq!(index.count("main", "google_search", "rust"), 2);
    }

    #[test]
    fn test_counts_are_scoped_per_agent_and_tool() {
        let mut index = QueryIndex::new();
        index.record("main", "google_search", "rust");
        assert_eq!(index.count("sub-browsing", "google_search", "rust"), 0);
        assert_eq!(index.count("main", "scrape_page", "rust"), 0);
    }

    #[test]
    fn test_total_matches_recorded_calls() {
        let mut index = QueryIndex::new();
        index.record("main", "google_search", "a");
        index.record("main", "google_search", "a");
        index.record("main", "scrape_page", "https://x");
        assert_eq!(index.total(), 3);
    }
}
