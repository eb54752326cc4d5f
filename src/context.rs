//! Context-budget management for a running task.
//!
//! One of three strategies is active per task, selected from configuration:
//!
//! 1. **Keep-all** (`keep_tool_result = -1`): full history. When the
//!    overflow predicate fires, the trailing `(assistant, tool-result)` pair
//!    is popped and the task is forced into finalization.
//! 2. **Sliding window** (`keep_tool_result = N >= 0`): after each tool
//!    result, all but the most recent N tool-result messages are demoted to
//!    a short placeholder. The system prompt and the user task are never
//!    demoted.
//! 3. **Periodic compaction** (`context_compress_limit = K > 0`): every K
//!    turns the summarizer rewrites the conversation prefix into one
//!    compressed user message and the loop restarts at turn 0.

use crate::llm::LanguageModel;
use crate::types::{Message, MessageRole, MessageTag};
use crate::Result;

/// Text that replaces a demoted tool result.
pub const DEMOTED_PLACEHOLDER: &str = "[Earlier tool result omitted to save context.]";

/// Fixed safety buffer in the overflow prediction formula, in tokens.
const OVERFLOW_SAFETY_BUFFER: usize = 1000;

/// Which context strategy a task runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStrategy {
    /// Keep the full history; force finalization on overflow.
    KeepAll,
    /// Keep the most recent N tool results verbatim, demote the rest.
    SlidingWindow(usize),
    /// Compact the conversation every K turns.
    PeriodicCompaction(u32),
}

impl ContextStrategy {
    /// Resolve the strategy from per-agent configuration. Compaction wins
    /// when enabled and configured; otherwise `keep_tool_result` decides.
    pub fn from_settings(
        keep_tool_result: i64,
        context_compress_limit: u32,
        compression_enabled: bool,
    ) -> Self {
        if compression_enabled && context_compress_limit > 0 {
            ContextStrategy::PeriodicCompaction(context_compress_limit)
        } else if keep_tool_result >= 0 {
            ContextStrategy::SlidingWindow(keep_tool_result as usize)
        } else {
            ContextStrategy::KeepAll
        }
    }
}

/// Token-budget enforcement over one task's message history.
pub struct ContextManager {
    strategy: ContextStrategy,
    reserved_completion_tokens: usize,
}

impl ContextManager {
    pub fn new(strategy: ContextStrategy, reserved_completion_tokens: usize) -> Self {
        Self {
            strategy,
            reserved_completion_tokens,
        }
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    /// Demote all but the most recent N tool results to placeholders.
    /// Only meaningful under the sliding-window strategy; a no-op otherwise.
    pub fn apply_window(&self, messages: &mut [Message]) {
        let ContextStrategy::SlidingWindow(keep) = self.strategy else {
            return;
        };

        let result_positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.tag == MessageTag::ToolResult)
            .map(|(i, _)| i)
            .collect();

        let demote_count = result_positions.len().saturating_sub(keep);
        for &pos in &result_positions[..demote_count] {
            messages[pos].content = DEMOTED_PLACEHOLDER.to_string();
            messages[pos].tag = MessageTag::DemotedToolResult;
        }
    }

    /// Overflow prediction for the *next* LLM call:
    ///
    /// ```text
    /// estimate = prompt_tokens_last + completion_tokens_last + user_tokens_last
    ///          + summary_tokens_estimate + reserved_completion_budget + 1000
    /// ```
    ///
    /// Declared when `estimate >= max_context_length`.
    pub fn predict_overflow(
        &self,
        model: &dyn LanguageModel,
        prompt_tokens_last: usize,
        completion_tokens_last: usize,
        last_user_text: &str,
        summary_prompt: &str,
    ) -> bool {
        let estimate = prompt_tokens_last
            + completion_tokens_last
            + model.estimate_tokens(last_user_text)
            + model.estimate_tokens(summary_prompt)
            + self.reserved_completion_tokens
            + OVERFLOW_SAFETY_BUFFER;
        estimate >= model.max_context_length()
    }

    /// Pop the trailing `(assistant, tool-result)` pair after an overflow.
    /// The history stays role-valid: it ends on the previous user message.
    pub fn pop_overflow_pair(&self, messages: &mut Vec<Message>) {
        if messages
            .last()
            .map(|m| m.tag == MessageTag::ToolResult || m.tag == MessageTag::DemotedToolResult)
            .unwrap_or(false)
        {
            messages.pop();
        }
        if messages
            .last()
            .map(|m| m.role == MessageRole::Assistant)
            .unwrap_or(false)
        {
            messages.pop();
        }
    }

    /// Whether this turn is a compaction boundary.
    pub fn should_compact(&self, turn: u32) -> bool {
        matches!(self.strategy, ContextStrategy::PeriodicCompaction(k) if turn > 0 && turn % k == 0)
    }

    /// Rewrite the conversation into `[system prompt, compressed user
    /// message]` using the summarizer. The caller restarts its loop at
    /// turn 0 afterwards.
    pub async fn compact(
        &self,
        messages: &mut Vec<Message>,
        summarizer: &dyn LanguageModel,
        max_tokens: u32,
    ) -> Result<()> {
        let mut transcript = String::new();
        for message in messages.iter().filter(|m| m.role != MessageRole::System) {
            let speaker = match message.role {
                MessageRole::Assistant => "assistant",
                _ => "user",
            };
            transcript.push_str(&format!("[{}]\n{}\n\n", speaker, message.content));
        }

        let request = vec![
            Message::system(
                "You compress research dialogues. Preserve the original task verbatim, \
                 every fact discovered so far with its source, and what remains to be done. \
                 Reply with the compressed briefing only.",
            ),
            Message::user(transcript),
        ];
        let completion = summarizer.generate(&request, max_tokens).await?;

        let system = messages
            .first()
            .filter(|m| m.role == MessageRole::System)
            .cloned();
        messages.clear();
        if let Some(system) = system {
            messages.push(system);
        }
        messages.push(Message::new(
            MessageRole::User,
            completion.text,
            MessageTag::Summary,
        ));
        Ok(())
    }
}
