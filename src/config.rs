//! Configuration for the orchestration service.
//!
//! Settings come from two layers: an optional TOML file and environment
//! variables, with the environment taking precedence. The recognized
//! environment variables are:
//!
//! - `BASE_URL`, `API_KEY`, `MODEL_NAME`: dialogue LLM endpoint
//! - `SUMMARY_LLM_BASE_URL`, `SUMMARY_LLM_MODEL_NAME`, `SUMMARY_LLM_API_KEY`:
//!   summarizer endpoint (falls back to the dialogue endpoint when unset)
//! - `PIPELINE_POOL_SIZE`: number of orchestrator instances
//! - `MAX_CONCURRENT_REQUESTS`: global semaphore size
//! - `MAX_HISTORY_TOKENS`: compaction threshold
//! - `CONTEXT_COMPRESSION_ENABLED`: enables periodic compaction
//!
//! Per-agent loop bounds live under `[agent.main_agent]` / `[agent.sub_agent]`
//! tables; per-tool toggles under `[tools.<name>]`.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

/// Endpoint + model for one LLM.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// OpenAI-compatible endpoint URL, e.g. `http://localhost:8000/v1`.
    pub base_url: String,
    /// Bearer token. Local servers usually accept anything.
    pub api_key: String,
    /// Model identifier at the endpoint.
    pub model_name: String,
    /// Context window of the model in tokens.
    pub max_context_length: usize,
    /// Per-call HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: "not-needed".to_string(),
            model_name: String::new(),
            max_context_length: 128_000,
            request_timeout_secs: 300,
        }
    }
}

/// Loop bounds and context strategy for one agent role.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Main loop bound: turns per attempt.
    pub max_turns: u32,
    /// Sliding-window size over tool results. `-1` keeps the full history;
    /// `N >= 0` keeps the most recent N tool results verbatim and demotes
    /// the rest to placeholders.
    pub keep_tool_result: i64,
    /// Periodic compaction period in turns; `0` disables compaction.
    pub context_compress_limit: u32,
    /// Maximum end-to-end attempts (first run + retries with injected
    /// failure experience).
    pub max_attempts: u32,
    /// Completion budget reserved per LLM call, in tokens.
    pub reserved_completion_tokens: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            keep_tool_result: -1,
            context_compress_limit: 0,
            max_attempts: 2,
            reserved_completion_tokens: 4096,
        }
    }
}

/// The two agent roles' settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsSettings {
    pub main_agent: AgentSettings,
    pub sub_agent: AgentSettings,
}

/// Per-tool toggle and endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSettings {
    /// Whether the tool's server is contacted at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// MCP endpoint URL for the tool's server.
    pub endpoint: String,
}

fn default_true() -> bool {
    true
}

/// Full service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Dialogue LLM.
    pub llm: LlmSettings,
    /// Summarizer LLM. When its `base_url` is empty the dialogue endpoint
    /// is reused.
    pub summary_llm: LlmSettings,
    /// Number of pre-initialized orchestrator instances.
    pub pipeline_pool_size: usize,
    /// Global concurrency bound; must be at least `pipeline_pool_size`.
    pub max_concurrent_requests: usize,
    /// History-size threshold that arms compaction.
    pub max_history_tokens: usize,
    /// Enables the periodic-compaction context strategy.
    pub context_compression_enabled: bool,
    /// Per-role loop bounds.
    pub agent: AgentsSettings,
    /// Per-tool configuration keyed by server name.
    pub tools: BTreeMap<String, ToolSettings>,
    /// Listen address for the HTTP surface.
    pub listen_addr: String,
    /// Global per-task timeout in seconds.
    pub task_timeout_secs: u64,
    /// Per-tool-call timeout in seconds.
    pub tool_timeout_secs: u64,
    /// Grace period for draining active tasks on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
    /// When set, tool results longer than this many characters are truncated
    /// with a marker suffix (demo mode).
    pub max_tool_result_chars: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            summary_llm: LlmSettings::default(),
            pipeline_pool_size: 4,
            max_concurrent_requests: 8,
            max_history_tokens: 60_000,
            context_compression_enabled: false,
            agent: AgentsSettings::default(),
            tools: BTreeMap::new(),
            listen_addr: "0.0.0.0:8000".to_string(),
            task_timeout_secs: 1800,
            tool_timeout_secs: 120,
            shutdown_grace_secs: 30,
            max_tool_result_chars: None,
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::config(format!("cannot read {}: {}", p.display(), e))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| Error::config(format!("{}: {}", p.display(), e)))?
            }
            None => Settings::default(),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Apply environment-variable overrides.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = env::var("API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = env::var("MODEL_NAME") {
            self.llm.model_name = v;
        }
        if let Ok(v) = env::var("SUMMARY_LLM_BASE_URL") {
            self.summary_llm.base_url = v;
        }
        if let Ok(v) = env::var("SUMMARY_LLM_MODEL_NAME") {
            self.summary_llm.model_name = v;
        }
        if let Ok(v) = env::var("SUMMARY_LLM_API_KEY") {
            self.summary_llm.api_key = v;
        }
        if let Some(v) = parse_env("PIPELINE_POOL_SIZE") {
            self.pipeline_pool_size = v;
        }
        if let Some(v) = parse_env("MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = v;
        }
        if let Some(v) = parse_env("MAX_HISTORY_TOKENS") {
            self.max_history_tokens = v;
        }
        if let Ok(v) = env::var("CONTEXT_COMPRESSION_ENABLED") {
            self.context_compression_enabled =
                matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<()> {
        if self.llm.base_url.is_empty() {
            return Err(Error::config("llm.base_url (or BASE_URL) is required"));
        }
        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://")
        {
            return Err(Error::config("llm.base_url must start with http:// or https://"));
        }
        if self.llm.model_name.trim().is_empty() {
            return Err(Error::config("llm.model_name (or MODEL_NAME) is required"));
        }
        if self.pipeline_pool_size == 0 {
            return Err(Error::config("pipeline_pool_size must be at least 1"));
        }
        if self.max_concurrent_requests < self.pipeline_pool_size {
            return Err(Error::config(
                "max_concurrent_requests must be >= pipeline_pool_size",
            ));
        }
        for (name, tool) in &self.tools {
            if tool.enabled && tool.endpoint.is_empty() {
                return Err(Error::config(format!(
                    "tools.{}.endpoint is required when enabled",
                    name
                )));
            }
        }
        Ok(())
    }

    /// The summarizer settings, falling back to the dialogue LLM endpoint
    /// when no dedicated summarizer is configured.
    pub fn effective_summary_llm(&self) -> LlmSettings {
        if self.summary_llm.base_url.is_empty() {
            let mut s = self.llm.clone();
            if !self.summary_llm.model_name.is_empty() {
                s.model_name = self.summary_llm.model_name.clone();
            }
            s
        } else {
            self.summary_llm.clone()
        }
    }

    /// Settings for the given agent role.
    pub fn agent_settings(&self, role: crate::types::AgentRole) -> &AgentSettings {
        match role {
            crate::types::AgentRole::Main => &self.agent.main_agent,
            crate::types::AgentRole::SubBrowsing => &self.agent.sub_agent,
        }
    }

    /// Enabled tool servers as `(name, endpoint)` pairs.
    pub fn enabled_tools(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .filter(|(_, t)| t.enabled)
            .map(|(name, t)| (name.clone(), t.endpoint.clone()))
            .collect()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
