//! # Deep Research Agent
//!
//! A streaming agent orchestration engine: a ReAct loop over remote MCP
//! tools, exposed through an OpenAI-compatible SSE chat-completions API.
//!
//! ## Overview
//!
//! One HTTP request becomes one *task*. A task is served by an
//! [`Orchestrator`] leased from a bounded [`PipelinePool`]: the orchestrator
//! alternates LLM calls and remote tool invocations until one of seven
//! guards terminates the loop, then produces a boxed final answer. Its
//! progress streams to the client as Server-Sent Events, either as a plain
//! assistant content stream (`/v1`) or as a tree-structured research
//! transcript (`/v2`).
//!
//! ## Key Pieces
//!
//! - **Bounded loop with rollback**: malformed tool calls, refusals,
//!   duplicate queries, and failed invocations pop the offending turn and
//!   re-prompt; five consecutive rollbacks abort the attempt.
//! - **Context budget management**: keep-all, sliding-window, or periodic
//!   compaction strategies over the message history, with a predictive
//!   overflow check before each turn's result is committed.
//! - **Retry with failure experience**: a failed attempt is post-mortemed
//!   by the model itself, and the analysis is injected into the next
//!   attempt's system prompt.
//! - **Sub-agents**: a tool call can spawn a nested browsing orchestrator
//!   whose final summary becomes the tool result.
//! - **Bounded concurrency**: a global semaphore plus a pool of
//!   pre-initialized instances serve many tasks in parallel, each task
//!   internally sequential.
//!
//! ## Architecture
//!
//! ```text
//! HTTP request ──▶ PipelinePool ──▶ Orchestrator ──▶ AgentEvent channel
//!                                      │  ▲                  │
//!                                LLM ◀─┘  └─▶ MCP tools      ▼
//!                                                     V1/V2 adapter ──▶ SSE
//! ```
//!
//! The orchestrator and the adapter never hold pointers to each other; the
//! one-way event channel is the only link.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Event → SSE chunk transformation (plain V1 and tree-structured V2).
mod adapter;

/// Service configuration: TOML file plus environment overrides.
mod config;

/// Token-budget strategies over the message history.
mod context;

/// Per-task duplicate-query index.
mod dedup;

/// Error types and conversions.
mod error;

/// Typed event stream between orchestrator and adapter.
mod events;

/// LLM client over an OpenAI-compatible endpoint.
mod llm;

/// Remote tool invocation over MCP.
mod mcp;

/// The ReAct loop: guards, rollback, finalization, sub-agents.
mod orchestrator;

/// Tool-call and boxed-answer extraction from raw LLM text.
mod parser;

/// Pipeline pool and the global concurrency limiter.
mod pool;

/// System/summary/failure-experience prompt composition.
mod prompts;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

/// HTTP surface: routes, SSE framing, graceful shutdown.
pub mod server;

/// Core data model: messages, tool calls, wire formats.
pub mod types;

// --- Streaming Adapters ---

pub use adapter::{BlockState, ChatChunk, ChunkChoice, ChunkDelta, ContentType, V1Adapter, V2Adapter};

// --- Configuration ---

pub use config::{AgentSettings, AgentsSettings, LlmSettings, Settings, ToolSettings};

// --- Context Management ---

pub use context::{ContextManager, ContextStrategy, DEMOTED_PLACEHOLDER};

// --- Duplicate Queries ---

pub use dedup::{extract_query, QueryIndex, SUB_AGENT_TOOL};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Events ---

pub use events::{AgentEvent, EventSink, Outcome, RollbackReason};

// --- LLM & Tools ---

pub use llm::{LanguageModel, LlmClient};
pub use mcp::{McpEndpoint, ToolDispatch, ToolManager};

// --- Orchestration ---

pub use orchestrator::{
    CancelToken, Orchestrator, TaskReport, EXTRA_ATTEMPTS_BUFFER, MAX_CONSECUTIVE_ROLLBACKS,
    SUB_AGENT_SERVER,
};

// --- Parsing & Prompts ---

pub use parser::{
    contains_protocol_tag, contains_refusal, extract_boxed, parse_tool_calls, strip_think_tags,
};
pub use prompts::{
    compose_summary_prompt, compose_system_prompt, FailureExperience, FAILURE_EXPERIENCE_HEADER,
};

// --- Pool ---

pub use pool::{PipelineInstance, PipelineLease, PipelinePool, PoolHealth};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The most commonly used types and functions in one import.
pub mod prelude {
    pub use crate::{
        AgentEvent, CancelToken, Error, EventSink, LanguageModel, Orchestrator, Outcome,
        PipelinePool, Result, Settings, TaskReport, ToolDispatch,
    };
    pub use crate::types::{
        AgentRole, Completion, ErrorKind, Message, MessageRole, ToolCall, ToolCatalogEntry,
        ToolResult,
    };
}
