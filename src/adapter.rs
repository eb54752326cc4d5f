//! Conversion of orchestrator events into OpenAI-style SSE chunks.
//!
//! Two adapters share the chunk types:
//!
//! - [`V2Adapter`] produces the extended format: each chunk's `delta`
//!   additionally carries a task-tree coordinate (`taskid`,
//!   `parent_taskid`, `index`, `content_type`, `taskstat`, `task_content`).
//!   Blocks form a tree rooted at a `research_process_block`; the root's
//!   `:result` chunk is held back until the task ends, so every stream the
//!   client sees is a well-formed tree.
//! - [`V1Adapter`] is the degenerate case: it emits only the plain
//!   `role:"assistant"` content stream.
//!
//! Both adapters are pure state machines: event in, zero or more chunks
//! out, no channel back to the orchestrator.

use crate::events::{AgentEvent, Outcome};
use crate::types::AgentRole;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Root label shown while the task runs.
const ROOT_LABEL: &str = "collecting and analyzing information";

/// Content types of the extended stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ProcessBlock,
    ThinkBlock,
    WebSearchKeyword,
    WebSearch,
    WebBrowse,
    TextBlock,
    Completed,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::ProcessBlock => "research_process_block",
            ContentType::ThinkBlock => "research_think_block",
            ContentType::WebSearchKeyword => "research_web_search_keyword",
            ContentType::WebSearch => "research_web_search",
            ContentType::WebBrowse => "research_web_browse",
            ContentType::TextBlock => "research_text_block",
            ContentType::Completed => "research_completed",
        }
    }
}

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Start,
    Process,
    Result,
}

impl BlockState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Start => "message_start",
            BlockState::Process => "message_process",
            BlockState::Result => "message_result",
        }
    }
}

// ============================================================================
// CHUNK WIRE FORMAT
// ============================================================================

/// One SSE chunk in OpenAI `chat.completion.chunk` shape.
#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Delta payload. The plain OpenAI fields come first; everything after
/// `taskstat` is the V2 extension.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taskstat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_taskid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taskid: Option<String>,
}

/// Remove raw think tags leaked by the underlying model.
fn clean_text(text: &str) -> String {
    text.replace("<think>", "").replace("</think>", "")
}

// ============================================================================
// V2 ADAPTER
// ============================================================================

/// What a tool invocation is currently pending as, between `tool_started`
/// and its success/failure event.
enum PendingTool {
    Search { keyword: String },
    Browse { url: String },
    Other { tool: String },
}

/// Per-connection state for the extended stream.
pub struct V2Adapter {
    completion_id: String,
    model: String,
    created: i64,
    /// Monotonic source for taskids.
    task_seq: u64,
    /// Monotonic, strictly increasing index over non-root chunks.
    current_index: u64,
    root_taskid: Option<String>,
    root_closed: bool,
    /// Open non-root blocks: taskid → content type. Used to close cleanly.
    open_blocks: HashMap<String, ContentType>,
    /// The currently open think block, if any.
    think_taskid: Option<String>,
    pending_tool: Option<PendingTool>,
    /// Agent nesting depth; sub-agent lifecycle events must not re-open or
    /// close the root.
    depth: u32,
    final_emitted: bool,
}

impl V2Adapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            completion_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            task_seq: 0,
            current_index: 0,
            root_taskid: None,
            root_closed: false,
            open_blocks: HashMap::new(),
            think_taskid: None,
            pending_tool: None,
            depth: 0,
            final_emitted: false,
        }
    }

    fn next_taskid(&mut self) -> String {
        self.task_seq += 1;
        format!("{}-t{:04}", self.completion_id, self.task_seq)
    }

    fn next_index(&mut self) -> u64 {
        self.current_index += 1;
        self.current_index
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&str>) -> ChatChunk {
        ChatChunk {
            id: self.completion_id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    fn block_chunk(
        &mut self,
        taskid: &str,
        content_type: ContentType,
        state: BlockState,
        payload: Option<String>,
    ) -> ChatChunk {
        let index = self.next_index();
        self.chunk(
            ChunkDelta {
                role: Some("task".to_string()),
                taskstat: Some(state.as_str().to_string()),
                content_type: Some(content_type.as_str().to_string()),
                parent_taskid: self.root_taskid.clone(),
                index: Some(index),
                task_content: payload,
                taskid: Some(taskid.to_string()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    /// Emit a complete `start`/`process`*/`result` block in one go.
    fn emit_block(
        &mut self,
        content_type: ContentType,
        label: Option<String>,
        payloads: &[String],
    ) -> Vec<ChatChunk> {
        let taskid = self.next_taskid();
        let mut out = vec![self.block_chunk(&taskid, content_type, BlockState::Start, label)];
        for payload in payloads {
            out.push(self.block_chunk(
                &taskid,
                content_type,
                BlockState::Process,
                Some(payload.clone()),
            ));
        }
        out.push(self.block_chunk(&taskid, content_type, BlockState::Result, None));
        out
    }

    fn open_think(&mut self) -> Vec<ChatChunk> {
        if self.think_taskid.is_some() {
            return Vec::new();
        }
        let taskid = self.next_taskid();
        self.think_taskid = Some(taskid.clone());
        self.open_blocks.insert(taskid.clone(), ContentType::ThinkBlock);
        vec![self.block_chunk(&taskid, ContentType::ThinkBlock, BlockState::Start, None)]
    }

    fn close_think(&mut self) -> Vec<ChatChunk> {
        let Some(taskid) = self.think_taskid.take() else {
            return Vec::new();
        };
        self.open_blocks.remove(&taskid);
        vec![self.block_chunk(&taskid, ContentType::ThinkBlock, BlockState::Result, None)]
    }

    fn close_root(&mut self) -> Vec<ChatChunk> {
        if self.root_closed {
            return Vec::new();
        }
        let Some(root) = self.root_taskid.clone() else {
            return Vec::new();
        };
        self.root_closed = true;
        let index = self.next_index();
        vec![self.chunk(
            ChunkDelta {
                role: Some("task".to_string()),
                taskstat: Some(BlockState::Result.as_str().to_string()),
                content_type: Some(ContentType::ProcessBlock.as_str().to_string()),
                index: Some(index),
                taskid: Some(root),
                ..ChunkDelta::default()
            },
            None,
        )]
    }

    fn assistant_content(&self, content: &str) -> ChatChunk {
        self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(content.to_string()),
                ..ChunkDelta::default()
            },
            None,
        )
    }

    fn finish_chunk(&self) -> ChatChunk {
        self.chunk(ChunkDelta::default(), Some("stop"))
    }

    /// The terminal sequence: close everything, mark the research as
    /// completed, release the held root `:result`, then the plain
    /// assistant answer and the stop chunk.
    fn emit_terminal(&mut self, answer: &str, outcome_label: &str) -> Vec<ChatChunk> {
        let mut out = self.close_think();
        let completed = self.emit_block(
            ContentType::Completed,
            Some(outcome_label.to_string()),
            &[],
        );
        out.extend(completed);
        out.extend(self.close_root());
        out.push(self.assistant_content(answer));
        out.push(self.finish_chunk());
        self.final_emitted = true;
        out
    }

    /// Transform one event into zero or more chunks.
    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<ChatChunk> {
        match event {
            AgentEvent::AgentStarted { agent, .. } => {
                self.depth += 1;
                if *agent == AgentRole::Main && self.root_taskid.is_none() {
                    let root = self.next_taskid();
                    self.root_taskid = Some(root.clone());
                    // Root start carries index 0; children count up from 1.
                    return vec![self.chunk(
                        ChunkDelta {
                            role: Some("task".to_string()),
                            taskstat: Some(BlockState::Start.as_str().to_string()),
                            content_type: Some(ContentType::ProcessBlock.as_str().to_string()),
                            index: Some(0),
                            task_content: Some(ROOT_LABEL.to_string()),
                            taskid: Some(root),
                            ..ChunkDelta::default()
                        },
                        None,
                    )];
                }
                Vec::new()
            }

            AgentEvent::LlmChunk { text } => {
                let cleaned = clean_text(text);
                if cleaned.is_empty() {
                    return Vec::new();
                }
                let mut out = self.open_think();
                let taskid = self
                    .think_taskid
                    .clone()
                    .expect("open_think just ensured a think block");
                out.push(self.block_chunk(
                    &taskid,
                    ContentType::ThinkBlock,
                    BlockState::Process,
                    Some(cleaned),
                ));
                out
            }

            AgentEvent::ToolStarted { tool, args, .. } => {
                let mut out = self.close_think();
                if let Some(keyword) = search_keyword(tool, args) {
                    out.extend(self.emit_block(
                        ContentType::WebSearchKeyword,
                        Some(keyword.clone()),
                        &[keyword.clone()],
                    ));
                    self.pending_tool = Some(PendingTool::Search { keyword });
                } else if let Some(url) = browse_url(tool, args) {
                    self.pending_tool = Some(PendingTool::Browse { url });
                } else {
                    self.pending_tool = Some(PendingTool::Other { tool: tool.clone() });
                }
                out
            }

            AgentEvent::ToolSucceeded { payload, .. } => match self.pending_tool.take() {
                Some(PendingTool::Search { .. }) => {
                    let results = parse_search_results(payload);
                    let label = format!("found {} results", results.len());
                    let lines: Vec<String> = results
                        .iter()
                        .map(|r| serde_json::to_string(r).unwrap_or_default())
                        .collect();
                    self.emit_block(ContentType::WebSearch, Some(label), &lines)
                }
                Some(PendingTool::Browse { url }) => {
                    let page = parse_browse_payload(payload, &url);
                    let line = serde_json::to_string(&page).unwrap_or_default();
                    self.emit_block(ContentType::WebBrowse, None, &[line])
                }
                Some(PendingTool::Other { tool }) => {
                    let preview: String = payload.chars().take(500).collect();
                    self.emit_block(ContentType::TextBlock, Some(tool), &[preview])
                }
                None => Vec::new(),
            },

            AgentEvent::ToolFailed { .. } => {
                self.pending_tool = None;
                self.close_think()
            }

            AgentEvent::SubAgentStarted { .. } | AgentEvent::SubAgentEnded { .. } => {
                self.close_think()
            }

            AgentEvent::FinalizationStarted => self.close_think(),

            AgentEvent::FinalAnswer { text } => {
                // Only the main agent's final answer terminates the stream;
                // a sub-agent's is just its tool result.
                if self.depth == 1 && !self.final_emitted {
                    self.emit_terminal(&clean_text(text), "completed")
                } else {
                    Vec::new()
                }
            }

            AgentEvent::AgentEnded { outcome } => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth > 0 || self.final_emitted {
                    return Vec::new();
                }
                // Failure path: an error-shaped think block, then the same
                // terminal sequence with an empty answer.
                let mut out = self.close_think();
                out.extend(self.emit_block(
                    ContentType::ThinkBlock,
                    None,
                    &[format!("The task could not be completed: {}.", outcome.as_str())],
                ));
                out.extend(self.emit_terminal("", outcome.as_str()));
                out
            }

            AgentEvent::LlmStarted
            | AgentEvent::LlmEnded { .. }
            | AgentEvent::ParseResult { .. }
            | AgentEvent::Rollback { .. } => Vec::new(),
        }
    }

    /// Safety net for streams that end without a terminal event (e.g. the
    /// producing task panicked): closes whatever is open so the client
    /// still sees a well-formed tree.
    pub fn finish(&mut self) -> Vec<ChatChunk> {
        if self.final_emitted || self.root_taskid.is_none() {
            return Vec::new();
        }
        let mut out = self.close_think();
        out.extend(self.emit_block(
            ContentType::ThinkBlock,
            None,
            &[format!(
                "The task could not be completed: {}.",
                Outcome::Fatal.as_str()
            )],
        ));
        out.extend(self.emit_terminal("", Outcome::Fatal.as_str()));
        out
    }
}

// ============================================================================
// V1 ADAPTER
// ============================================================================

/// The degenerate adapter: plain assistant content only.
pub struct V1Adapter {
    inner: V2Adapter,
}

impl V1Adapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            inner: V2Adapter::new(model),
        }
    }

    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<ChatChunk> {
        // Reuse the V2 state machine and keep only plain-content chunks, so
        // nesting and terminal bookkeeping stay identical.
        self.inner
            .on_event(event)
            .into_iter()
            .filter(|c| {
                c.choices.iter().any(|choice| {
                    choice.delta.taskstat.is_none()
                        && (choice.delta.content.is_some() || choice.finish_reason.is_some())
                })
            })
            .collect()
    }

    pub fn finish(&mut self) -> Vec<ChatChunk> {
        self.inner
            .finish()
            .into_iter()
            .filter(|c| {
                c.choices.iter().any(|choice| {
                    choice.delta.taskstat.is_none()
                        && (choice.delta.content.is_some() || choice.finish_reason.is_some())
                })
            })
            .collect()
    }
}

// ============================================================================
// TOOL PAYLOAD INTERPRETATION
// ============================================================================

fn search_keyword(tool: &str, args: &Value) -> Option<String> {
    if !tool.contains("search") || tool == crate::dedup::SUB_AGENT_TOOL {
        return None;
    }
    args.get("q")
        .or_else(|| args.get("query"))
        .or_else(|| args.get("keyword"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn browse_url(tool: &str, args: &Value) -> Option<String> {
    if !["scrape", "browse", "fetch", "visit"]
        .iter()
        .any(|w| tool.contains(w))
    {
        return None;
    }
    args.get("url").and_then(Value::as_str).map(str::to_string)
}

/// One row of a search-results block.
#[derive(Debug, Serialize)]
struct SearchRow {
    index: usize,
    title: String,
    link: String,
}

/// Interpret a search tool's payload. JSON (an array, or an object with a
/// `results` array) is preferred; plain text degrades to one row per
/// non-empty line.
fn parse_search_results(payload: &str) -> Vec<SearchRow> {
    let parsed: Option<Vec<Value>> = serde_json::from_str::<Value>(payload)
        .ok()
        .and_then(|v| match v {
            Value::Array(items) => Some(items),
            Value::Object(mut map) => map.remove("results").and_then(|r| match r {
                Value::Array(items) => Some(items),
                _ => None,
            }),
            _ => None,
        });

    match parsed {
        Some(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| SearchRow {
                index: i,
                title: item
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                link: item
                    .get("link")
                    .or_else(|| item.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect(),
        None => payload
            .lines()
            .filter(|l| !l.trim().is_empty())
            .enumerate()
            .map(|(i, line)| SearchRow {
                index: i,
                title: line.trim().to_string(),
                link: String::new(),
            })
            .collect(),
    }
}

/// Payload of a browse block.
#[derive(Debug, Serialize)]
struct BrowseRow {
    index: usize,
    title: String,
    link: String,
    snippet: String,
    sitename: String,
}

fn parse_browse_payload(payload: &str, url: &str) -> BrowseRow {
    let parsed: Value = serde_json::from_str(payload).unwrap_or(Value::Null);
    let get = |key: &str| -> String {
        parsed
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let snippet = if parsed.is_null() {
        payload.chars().take(300).collect()
    } else {
        get("snippet")
    };
    BrowseRow {
        index: 0,
        title: get("title"),
        link: if get("link").is_empty() {
            url.to_string()
        } else {
            get("link")
        },
        snippet,
        sitename: get("sitename"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started() -> AgentEvent {
        AgentEvent::AgentStarted {
            agent: AgentRole::Main,
            task_text: "q".to_string(),
        }
    }

    fn delta(chunk: &ChatChunk) -> &ChunkDelta {
        &chunk.choices[0].delta
    }

    #[test]
    fn test_root_opens_on_agent_started() {
        let mut adapter = V2Adapter::new("agent");
        let chunks = adapter.on_event(&started());
        assert_eq!(chunks.len(), 1);
        let d = delta(&chunks[0]);
        assert_eq!(d.taskstat.as_deref(), Some("message_start"));
        assert_eq!(d.content_type.as_deref(), Some("research_process_block"));
        assert_eq!(d.task_content.as_deref(), Some(ROOT_LABEL));
        assert_eq!(d.index, Some(0));
        assert!(d.parent_taskid.is_none());
    }

    #[test]
    fn test_llm_chunks_open_one_think_block() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());

        let first = adapter.on_event(&AgentEvent::LlmChunk {
            text: "thinking…".to_string(),
        });
        // start + process
        assert_eq!(first.len(), 2);
        assert_eq!(delta(&first[0]).taskstat.as_deref(), Some("message_start"));
        assert_eq!(
            delta(&first[1]).task_content.as_deref(),
            Some("thinking…")
        );

        let second = adapter.on_event(&AgentEvent::LlmChunk {
            text: " more".to_string(),
        });
        // same block, process only
        assert_eq!(second.len(), 1);
        assert_eq!(delta(&second[0]).taskid, delta(&first[0]).taskid);
    }

    #[test]
    fn test_think_tags_stripped() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        let chunks = adapter.on_event(&AgentEvent::LlmChunk {
            text: "<think>hidden</think>visible".to_string(),
        });
        let payload = delta(chunks.last().unwrap()).task_content.clone().unwrap();
        assert!(!payload.contains("<think>"));
        assert!(payload.contains("hidden"));
        assert!(payload.contains("visible"));
    }

    #[test]
    fn test_search_tool_sequence() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        adapter.on_event(&AgentEvent::LlmChunk {
            text: "let me search".to_string(),
        });

        let start_chunks = adapter.on_event(&AgentEvent::ToolStarted {
            server: "search".to_string(),
            tool: "google_search".to_string(),
            args: json!({"q": "rust"}),
        });
        // think result + keyword start/process/result
        assert_eq!(start_chunks.len(), 4);
        assert_eq!(
            delta(&start_chunks[0]).content_type.as_deref(),
            Some("research_think_block")
        );
        assert_eq!(
            delta(&start_chunks[0]).taskstat.as_deref(),
            Some("message_result")
        );
        assert_eq!(
            delta(&start_chunks[1]).content_type.as_deref(),
            Some("research_web_search_keyword")
        );
        assert_eq!(delta(&start_chunks[1]).task_content.as_deref(), Some("rust"));

        let payload = json!([
            {"title": "The Rust Language", "link": "https://rust-lang.org"},
            {"title": "Rust Book", "link": "https://doc.rust-lang.org/book"}
        ])
        .to_string();
        let result_chunks = adapter.on_event(&AgentEvent::ToolSucceeded {
            tool: "google_search".to_string(),
            payload,
        });
        // search start + 2 process lines + result
        assert_eq!(result_chunks.len(), 4);
        assert_eq!(
            delta(&result_chunks[0]).task_content.as_deref(),
            Some("found 2 results")
        );
        let line: Value =
            serde_json::from_str(delta(&result_chunks[1]).task_content.as_ref().unwrap()).unwrap();
        assert_eq!(line["index"], 0);
        assert_eq!(line["title"], "The Rust Language");
        assert_eq!(line["link"], "https://rust-lang.org");
    }

    #[test]
    fn test_final_answer_sequence() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        adapter.on_event(&AgentEvent::LlmChunk {
            text: "answering".to_string(),
        });
        let chunks = adapter.on_event(&AgentEvent::FinalAnswer {
            text: "42".to_string(),
        });

        // think result, completed start+result, root result, assistant, stop
        let kinds: Vec<Option<String>> = chunks
            .iter()
            .map(|c| delta(c).content_type.clone())
            .collect();
        assert_eq!(kinds[0].as_deref(), Some("research_think_block"));
        assert_eq!(kinds[1].as_deref(), Some("research_completed"));
        assert_eq!(kinds[2].as_deref(), Some("research_completed"));
        assert_eq!(kinds[3].as_deref(), Some("research_process_block"));
        assert!(kinds[4].is_none());
        assert_eq!(delta(&chunks[4]).content.as_deref(), Some("42"));
        assert_eq!(chunks[5].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_indices_strictly_increasing() {
        let mut adapter = V2Adapter::new("agent");
        let mut all = adapter.on_event(&started());
        all.extend(adapter.on_event(&AgentEvent::LlmChunk {
            text: "x".to_string(),
        }));
        all.extend(adapter.on_event(&AgentEvent::ToolStarted {
            server: "search".to_string(),
            tool: "google_search".to_string(),
            args: json!({"q": "a"}),
        }));
        all.extend(adapter.on_event(&AgentEvent::ToolSucceeded {
            tool: "google_search".to_string(),
            payload: "one line".to_string(),
        }));
        all.extend(adapter.on_event(&AgentEvent::FinalAnswer {
            text: "done".to_string(),
        }));

        let indices: Vec<u64> = all.iter().filter_map(|c| delta(c).index).collect();
        for pair in indices.windows(2) {
            assert!(pair[1] > pair[0], "indices not increasing: {:?}", indices);
        }
    }

    #[test]
    fn test_sub_agent_final_answer_does_not_terminate() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        // Nested agent lifecycle.
        adapter.on_event(&AgentEvent::SubAgentStarted {
            subtask: "s".to_string(),
        });
        adapter.on_event(&AgentEvent::AgentStarted {
            agent: AgentRole::SubBrowsing,
            task_text: "s".to_string(),
        });
        let sub_final = adapter.on_event(&AgentEvent::FinalAnswer {
            text: "partial".to_string(),
        });
        assert!(sub_final.is_empty());
        adapter.on_event(&AgentEvent::AgentEnded {
            outcome: Outcome::Success,
        });

        // Main final answer still terminates normally.
        let chunks = adapter.on_event(&AgentEvent::FinalAnswer {
            text: "whole".to_string(),
        });
        assert!(chunks
            .iter()
            .any(|c| delta(c).content.as_deref() == Some("whole")));
    }

    #[test]
    fn test_failure_emits_error_think_and_empty_answer() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        let chunks = adapter.on_event(&AgentEvent::AgentEnded {
            outcome: Outcome::TooManyRollbacks,
        });

        let think_payload = chunks
            .iter()
            .find_map(|c| {
                let d = delta(c);
                (d.content_type.as_deref() == Some("research_think_block")
                    && d.taskstat.as_deref() == Some("message_process"))
                .then(|| d.task_content.clone().unwrap())
            })
            .unwrap();
        assert!(think_payload.contains("too_many_rollbacks"));

        let assistant = chunks
            .iter()
            .find(|c| delta(c).content.is_some())
            .unwrap();
        assert_eq!(delta(assistant).content.as_deref(), Some(""));
        assert!(chunks
            .iter()
            .any(|c| c.choices[0].finish_reason.as_deref() == Some("stop")));
    }

    #[test]
    fn test_every_start_gets_a_result() {
        let mut adapter = V2Adapter::new("agent");
        let mut all = adapter.on_event(&started());
        all.extend(adapter.on_event(&AgentEvent::LlmChunk {
            text: "x".to_string(),
        }));
        all.extend(adapter.on_event(&AgentEvent::FinalAnswer {
            text: "y".to_string(),
        }));

        use std::collections::HashSet;
        let mut started_ids = HashSet::new();
        let mut resulted_ids = HashSet::new();
        for c in &all {
            let d = delta(c);
            if let (Some(stat), Some(taskid)) = (&d.taskstat, &d.taskid) {
                match stat.as_str() {
                    "message_start" => {
                        started_ids.insert(taskid.clone());
                    }
                    "message_result" => {
                        resulted_ids.insert(taskid.clone());
                    }
                    _ => {}
                }
            }
        }
        assert_eq!(started_ids, resulted_ids);
    }

    #[test]
    fn test_v1_adapter_content_only() {
        let mut adapter = V1Adapter::new("agent");
        assert!(adapter.on_event(&started()).is_empty());
        assert!(adapter
            .on_event(&AgentEvent::LlmChunk {
                text: "thinking".to_string()
            })
            .is_empty());
        let chunks = adapter.on_event(&AgentEvent::FinalAnswer {
            text: "42".to_string(),
        });
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("42"));
        assert_eq!(chunks[1].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_finish_closes_abandoned_stream() {
        let mut adapter = V2Adapter::new("agent");
        adapter.on_event(&started());
        adapter.on_event(&AgentEvent::LlmChunk {
            text: "x".to_string(),
        });
        let chunks = adapter.finish();
        assert!(chunks
            .iter()
            .any(|c| c.choices[0].finish_reason.as_deref() == Some("stop")));
        // Root result present.
        assert!(chunks.iter().any(|c| {
            let d = delta(c);
            d.content_type.as_deref() == Some("research_process_block")
                && d.taskstat.as_deref() == Some("message_result")
        }));
    }

    #[test]
    fn test_parse_search_results_fallback_lines() {
        let rows = parse_search_results("first hit\nsecond hit\n");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].title, "second hit");
    }

    #[test]
    fn test_parse_browse_payload_plain_text() {
        let row = parse_browse_payload("some page text", "https://example.com");
        assert_eq!(row.link, "https://example.com");
        assert_eq!(row.snippet, "some page text");
    }
}
