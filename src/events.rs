//! Typed event stream between the orchestrator and the streaming adapter.
//!
//! The channel is strictly one-way: the orchestrator produces
//! [`AgentEvent`]s, the adapter consumes them. Neither side holds a pointer
//! to the other. Events are emitted in the order the orchestrator generates
//! them, and the channel preserves that order per task.

use crate::types::{AgentRole, ErrorKind};
use serde_json::Value;
use tokio::sync::mpsc;

/// Why a turn was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// Protocol tags present but no complete tool-call block.
    Format,
    /// The response contained a refusal phrase.
    Refusal,
    /// Tool-call arguments could not be parsed.
    Parse,
    /// The extracted query string was already executed.
    DuplicateQuery,
    /// The tool invocation failed.
    ToolError,
}

impl RollbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackReason::Format => "format",
            RollbackReason::Refusal => "refusal",
            RollbackReason::Parse => "parse",
            RollbackReason::DuplicateQuery => "duplicate_query",
            RollbackReason::ToolError => "tool_error",
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A boxed final answer was produced.
    Success,
    /// The turn budget was exhausted and no attempt recovered.
    MaxTurns,
    /// Five consecutive rollbacks aborted the loop.
    TooManyRollbacks,
    /// Unrecoverable error: transport exhaustion, timeout, or cancellation.
    Fatal,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::MaxTurns => "max_turns",
            Outcome::TooManyRollbacks => "too_many_rollbacks",
            Outcome::Fatal => "fatal",
        }
    }
}

/// Everything the orchestrator reports while running one task.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStarted {
        agent: AgentRole,
        task_text: String,
    },
    LlmStarted,
    LlmChunk {
        text: String,
    },
    LlmEnded {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    ParseResult {
        tool_calls: usize,
        boxed: Option<String>,
    },
    ToolStarted {
        server: String,
        tool: String,
        args: Value,
    },
    ToolSucceeded {
        tool: String,
        payload: String,
    },
    ToolFailed {
        tool: String,
        error_kind: ErrorKind,
        message: String,
    },
    Rollback {
        reason: RollbackReason,
    },
    SubAgentStarted {
        subtask: String,
    },
    SubAgentEnded {
        summary: String,
    },
    FinalizationStarted,
    FinalAnswer {
        text: String,
    },
    AgentEnded {
        outcome: Outcome,
    },
}

/// Sending half of the event stream.
///
/// A sink with no channel (`EventSink::null()`) swallows events; useful for
/// sub-steps that should not stream and for tests that only inspect the
/// task log.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards everything.
    pub fn null() -> Self {
        Self { tx: None }
    }

    /// Emit one event. A closed receiver is not an error here; task
    /// liveness is tracked by the cancellation flag, not the channel.
    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_preserves_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(AgentEvent::LlmStarted);
        sink.emit(AgentEvent::LlmChunk {
            text: "a".to_string(),
        });
        sink.emit(AgentEvent::LlmEnded {
            prompt_tokens: 1,
            completion_tokens: 1,
        });

        tokio_test::block_on(async {
            assert!(matches!(rx.recv().await, Some(AgentEvent::LlmStarted)));
            assert!(matches!(rx.recv().await, Some(AgentEvent::LlmChunk { .. })));
            assert!(matches!(rx.recv().await, Some(AgentEvent::LlmEnded { .. })));
        });
    }

    #[test]
    fn test_null_sink_swallows() {
        let sink = EventSink::null();
        sink.emit(AgentEvent::LlmStarted);
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_not_fatal() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(AgentEvent::LlmStarted);
    }

    #[test]
    fn test_labels() {
        assert_eq!(Outcome::TooManyRollbacks.as_str(), "too_many_rollbacks");
        assert_eq!(RollbackReason::DuplicateQuery.as_str(), "duplicate_query");
    }
}
