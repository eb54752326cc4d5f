//! Shared fixtures for integration tests: scripted LLMs and stub tool
//! servers, so scenarios run without any network.

use async_trait::async_trait;
use deep_research_agent::prelude::*;
use deep_research_agent::CancelToken;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A model whose responses come from a closure over the call index.
pub struct ScriptedModel {
    script: Box<dyn Fn(usize, &[Message]) -> String + Send + Sync>,
    calls: AtomicUsize,
    max_context: usize,
    /// Every system prompt the model was shown, in call order.
    pub system_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(
        script: impl Fn(usize, &[Message]) -> String + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            max_context: 100_000,
            system_prompts: Mutex::new(Vec::new()),
        })
    }

    /// Replay a fixed sequence; the last response repeats once exhausted.
    pub fn sequence(responses: &[&str]) -> Arc<Self> {
        let responses: Vec<String> = responses.iter().map(|s| s.to_string()).collect();
        Self::new(move |i, _| {
            responses
                .get(i)
                .or_else(|| responses.last())
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn with_context(script: impl Fn(usize, &[Message]) -> String + Send + Sync + 'static, max_context: usize) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            max_context,
            system_prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        messages: &[Message],
        _max_tokens: u32,
    ) -> deep_research_agent::Result<Completion> {
        let i = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(system) = messages.first().filter(|m| m.role == MessageRole::System) {
            self.system_prompts
                .lock()
                .unwrap()
                .push(system.content.clone());
        }
        let text = (self.script)(i, messages);
        let prompt_tokens: usize = messages.iter().map(|m| self.estimate_tokens(&m.content)).sum();
        Ok(Completion {
            prompt_tokens: prompt_tokens as u32,
            completion_tokens: self.estimate_tokens(&text) as u32,
            text,
        })
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }

    fn max_context_length(&self) -> usize {
        self.max_context
    }
}

/// Catalog with a search tool and a page-fetch tool.
pub fn search_catalog() -> Vec<ToolCatalogEntry> {
    vec![
        ToolCatalogEntry {
            server_name: "search".to_string(),
            tool_name: "google_search".to_string(),
            description: "Web search".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"q": {"type": "string"}},
                "required": ["q"]
            }),
        },
        ToolCatalogEntry {
            server_name: "browse".to_string(),
            tool_name: "scrape_page".to_string(),
            description: "Fetch a web page".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        },
    ]
}

/// Tool dispatcher with fixed per-tool payloads. Records every invocation,
/// and can fire a cancellation token after each call.
pub struct StubTools {
    catalog: Vec<ToolCatalogEntry>,
    payloads: HashMap<String, String>,
    pub invocations: Mutex<Vec<(String, Value)>>,
    cancel_after_call: Option<CancelToken>,
}

impl StubTools {
    pub fn new(payloads: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            catalog: search_catalog(),
            payloads: payloads
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            invocations: Mutex::new(Vec::new()),
            cancel_after_call: None,
        })
    }

    /// Like [`new`](Self::new), but fires `cancel` once a call completes,
    /// simulating a client that disconnects mid-task.
    pub fn cancelling(payloads: &[(&str, &str)], cancel: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            catalog: search_catalog(),
            payloads: payloads
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            invocations: Mutex::new(Vec::new()),
            cancel_after_call: Some(cancel),
        })
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolDispatch for StubTools {
    fn catalog(&self) -> &[ToolCatalogEntry] {
        &self.catalog
    }

    async fn invoke(&self, _server: &str, tool: &str, args: &Value) -> ToolResult {
        self.invocations
            .lock()
            .unwrap()
            .push((tool.to_string(), args.clone()));
        let result = match self.payloads.get(tool) {
            Some(payload) => ToolResult::ok(tool, payload.clone()),
            None => ToolResult::err(tool, "no stubbed payload", ErrorKind::Server),
        };
        if let Some(cancel) = &self.cancel_after_call {
            cancel.cancel();
        }
        result
    }
}

/// A complete tool-call message in the protocol grammar.
pub fn tool_call_text(server: &str, tool: &str, args: &Value) -> String {
    format!(
        "Let me look that up.\n\n<use_mcp_tool>\n<server_name>{}</server_name>\n<tool_name>{}</tool_name>\n<arguments>\n{}\n</arguments>\n</use_mcp_tool>",
        server, tool, args
    )
}

/// Run one main-agent task over the given stubs and return the report plus
/// the full event trace.
pub async fn run_task(
    llm: Arc<ScriptedModel>,
    tools: Arc<StubTools>,
    settings: Settings,
    task: &str,
) -> (TaskReport, Vec<AgentEvent>) {
    let cancel = tools
        .cancel_after_call
        .clone()
        .unwrap_or_default();
    let (sink, rx) = EventSink::channel();
    let orchestrator = Orchestrator::new(
        AgentRole::Main,
        llm.clone(),
        llm,
        tools,
        Arc::new(settings),
        sink,
        cancel,
    );
    let report = orchestrator.run(task).await;
    (report, drain(rx))
}

pub fn drain(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
