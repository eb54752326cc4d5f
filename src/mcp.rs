//! Remote tool invocation over the MCP protocol.
//!
//! Every tool in this system is remote: an MCP server exposes `tools/list`
//! and `tools/call` over HTTP JSON-RPC, and the [`ToolManager`] aggregates
//! one [`McpEndpoint`] per configured server into a single catalog.
//!
//! Failures are never surfaced as `Err`: the orchestrator needs the failure
//! *category* to pick a guard, so [`invoke`](ToolDispatch::invoke) always
//! returns a [`ToolResult`] and encodes the category in
//! [`ErrorKind`](crate::types::ErrorKind):
//!
//! - `Transport` / `RateLimited`: transient, propagated verbatim; retrying
//!   is the orchestrator's decision, not this layer's
//! - `Schema`: unknown server/tool or arguments rejected by the declared
//!   schema; fatal for the call, not for the task
//! - `Server`: the tool ran and reported an error
//! - `Timeout`: the call missed its deadline

use crate::types::{ErrorKind, ToolCatalogEntry, ToolResult};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Marker appended to tool output truncated in demo mode.
const TRUNCATION_MARKER: &str = "\n…[truncated]";

/// The seam between the orchestrator and remote tools.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// The catalog loaded from all connected servers.
    fn catalog(&self) -> &[ToolCatalogEntry];

    /// Invoke `tool` on `server` with the given arguments.
    ///
    /// Never returns `Err`; failures are encoded in the result.
    async fn invoke(&self, server: &str, tool: &str, args: &Value) -> ToolResult;
}

// ============================================================================
// MCP WIRE FORMAT
// ============================================================================

/// Tool definition returned by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
struct McpToolDef {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct McpListToolsResult {
    #[serde(default)]
    tools: Vec<McpToolDef>,
}

/// Content item in MCP responses.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum McpContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        #[allow(dead_code)]
        data: String,
    },
    #[serde(rename = "resource")]
    Resource { uri: String },
}

/// Result of `tools/call`.
#[derive(Debug, Clone, Deserialize)]
struct McpCallResult {
    #[serde(default)]
    content: Vec<McpContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

impl McpCallResult {
    fn to_text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                McpContent::Text { text } => text.clone(),
                // Binary content is out of scope; keep a marker so the LLM
                // knows something was elided.
                McpContent::Image { .. } => "[image content not supported]".to_string(),
                McpContent::Resource { uri } => format!("[resource: {}]", uri),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

// ============================================================================
// SINGLE-SERVER ENDPOINT
// ============================================================================

/// One MCP server reached over HTTP JSON-RPC.
pub struct McpEndpoint {
    server_name: String,
    endpoint: String,
    http: reqwest::Client,
}

impl McpEndpoint {
    pub fn new(server_name: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            server_name: server_name.into(),
            endpoint: endpoint.into(),
            http,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::api(format!("MCP error {}: {}", status, text)));
        }

        let parsed: JsonRpcResponse = response.json().await.map_err(Error::Http)?;
        if let Some(err) = parsed.error {
            return Err(Error::tool(format!("rpc error {}: {}", err.code, err.message)));
        }
        parsed
            .result
            .ok_or_else(|| Error::tool("rpc response missing result"))
    }

    /// Fetch the tool list from this server.
    pub async fn list_tools(&self) -> Result<Vec<ToolCatalogEntry>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let listed: McpListToolsResult = serde_json::from_value(result)?;
        Ok(listed
            .tools
            .into_iter()
            .map(|t| ToolCatalogEntry {
                server_name: self.server_name.clone(),
                tool_name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect())
    }

    /// Invoke one tool, classifying any failure.
    pub async fn call_tool(&self, tool: &str, args: &Value) -> ToolResult {
        let params = json!({ "name": tool, "arguments": args });
        match self.rpc("tools/call", params).await {
            Ok(result) => match serde_json::from_value::<McpCallResult>(result) {
                Ok(call) if call.is_error => {
                    ToolResult::err(tool, call.to_text(), ErrorKind::Server)
                }
                Ok(call) => ToolResult::ok(tool, call.to_text()),
                Err(e) => ToolResult::err(
                    tool,
                    format!("malformed tool response: {}", e),
                    ErrorKind::Server,
                ),
            },
            Err(e) => ToolResult::err(tool, e.to_string(), classify(&e)),
        }
    }
}

/// Map a client error to the tool failure taxonomy.
fn classify(error: &Error) -> ErrorKind {
    match error {
        Error::Http(e) if e.is_timeout() => ErrorKind::Timeout,
        Error::Http(_) => ErrorKind::Transport,
        Error::Timeout => ErrorKind::Timeout,
        Error::Api(msg) if msg.contains("429") => ErrorKind::RateLimited,
        Error::Api(_) => ErrorKind::Server,
        Error::Tool(_) => ErrorKind::Server,
        Error::Json(_) => ErrorKind::Server,
        _ => ErrorKind::Transport,
    }
}

// ============================================================================
// TOOL MANAGER
// ============================================================================

/// Aggregates all configured MCP servers behind one catalog.
///
/// A manager belongs to exactly one pipeline instance; its connections are
/// never shared across concurrently running tasks.
pub struct ToolManager {
    endpoints: Vec<McpEndpoint>,
    catalog: Vec<ToolCatalogEntry>,
    /// Truncate tool output beyond this many characters (demo mode).
    max_result_chars: Option<usize>,
}

impl ToolManager {
    /// Connect to the given `(server_name, endpoint)` pairs and load their
    /// catalogs. A server that fails to list its tools is skipped with a
    /// warning rather than failing startup.
    pub async fn connect(
        servers: &[(String, String)],
        timeout: Duration,
        max_result_chars: Option<usize>,
    ) -> Result<Self> {
        let mut endpoints = Vec::new();
        let mut catalog = Vec::new();

        for (name, endpoint) in servers {
            let ep = McpEndpoint::new(name.clone(), endpoint.clone(), timeout)?;
            match ep.list_tools().await {
                Ok(tools) => {
                    tracing::info!(server = %name, tools = tools.len(), "connected MCP server");
                    catalog.extend(tools);
                    endpoints.push(ep);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "skipping unreachable MCP server");
                }
            }
        }

        Ok(Self {
            endpoints,
            catalog,
            max_result_chars,
        })
    }

    /// Build a manager from parts without contacting the network.
    pub fn from_parts(
        endpoints: Vec<McpEndpoint>,
        catalog: Vec<ToolCatalogEntry>,
        max_result_chars: Option<usize>,
    ) -> Self {
        Self {
            endpoints,
            catalog,
            max_result_chars,
        }
    }

    fn find_entry(&self, server: &str, tool: &str) -> Option<&ToolCatalogEntry> {
        self.catalog
            .iter()
            .find(|e| e.server_name == server && e.tool_name == tool)
    }

    fn truncate(&self, mut result: ToolResult) -> ToolResult {
        if let Some(limit) = self.max_result_chars {
            if result.content.len() > limit {
                let mut cut = limit;
                while !result.content.is_char_boundary(cut) {
                    cut -= 1;
                }
                result.content.truncate(cut);
                result.content.push_str(TRUNCATION_MARKER);
            }
        }
        result
    }
}

/// Check declared required arguments. Anything deeper than presence of the
/// `required` keys is left to the server.
fn validate_required(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for key in required.iter().filter_map(Value::as_str) {
        if args.get(key).is_none() {
            return Err(format!("missing required argument '{}'", key));
        }
    }
    Ok(())
}

#[async_trait]
impl ToolDispatch for ToolManager {
    fn catalog(&self) -> &[ToolCatalogEntry] {
        &self.catalog
    }

    async fn invoke(&self, server: &str, tool: &str, args: &Value) -> ToolResult {
        let Some(entry) = self.find_entry(server, tool) else {
            return ToolResult::err(
                tool,
                format!("unknown tool {}/{}", server, tool),
                ErrorKind::Schema,
            );
        };

        if let Err(msg) = validate_required(&entry.input_schema, args) {
            return ToolResult::err(tool, msg, ErrorKind::Schema);
        }

        let Some(endpoint) = self.endpoints.iter().find(|e| e.server_name() == server) else {
            return ToolResult::err(
                tool,
                format!("server {} not connected", server),
                ErrorKind::Schema,
            );
        };

        self.truncate(endpoint.call_tool(tool, args).await)
    }
}
