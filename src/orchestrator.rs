//! The ReAct orchestration loop.
//!
//! One [`Orchestrator`] drives one task: it alternates LLM calls and tool
//! invocations, enforcing seven termination/rollback guards in a fixed
//! precedence:
//!
//! 1. max turns
//! 2. no tool calls (normal termination)
//! 3. format error (protocol tags without a complete block)
//! 4. refusal phrases
//! 5. duplicate query
//! 6. tool execution error
//! 7. context overflow
//!
//! Guards 3–6 roll the turn back: the trailing assistant message is popped,
//! the turn counter decremented, and the model re-prompted. Five consecutive
//! rollbacks abort the attempt. A finished attempt goes through finalization
//! (the boxed-answer summary call); a failed finalization produces a
//! post-mortem that is injected into the next attempt's system prompt.
//!
//! A main-agent call to the `search_and_browse` pseudo-tool spawns a nested
//! orchestrator with the browsing role, its own history, and its own turn
//! budget; the sub-agent's final summary becomes the tool result.

use crate::config::{AgentSettings, Settings};
use crate::context::{ContextManager, ContextStrategy};
use crate::dedup::{extract_query, QueryIndex, SUB_AGENT_TOOL};
use crate::events::{AgentEvent, EventSink, Outcome, RollbackReason};
use crate::llm::LanguageModel;
use crate::mcp::ToolDispatch;
use crate::parser;
use crate::prompts::{self, FailureExperience};
use crate::types::{
    AgentRole, Completion, ErrorKind, Message, MessageRole, ToolCall, ToolCatalogEntry,
    ToolResult,
};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Slack on top of `max_turns` for LLM calls spent on rolled-back turns.
/// `total_steps <= max_turns + EXTRA_ATTEMPTS_BUFFER` always holds.
pub const EXTRA_ATTEMPTS_BUFFER: u32 = 10;

/// An attempt aborts after this many consecutive rollbacks.
pub const MAX_CONSECUTIVE_ROLLBACKS: u32 = 5;

/// Pseudo-server that hosts the sub-agent tool in the main agent's catalog.
pub const SUB_AGENT_SERVER: &str = "agent";

/// Cooperative cancellation flag, checked between turns and between the
/// sub-steps of a turn (LLM call / parse / tool call).
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What one finished task reports back.
#[derive(Debug)]
pub struct TaskReport {
    pub outcome: Outcome,
    /// The boxed answer, `<think>`-stripped; `None` on failure.
    pub final_answer: Option<String>,
    /// Append-only event trace (streaming deltas excluded).
    pub task_log: Vec<AgentEvent>,
}

/// Why the main loop of an attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopEnd {
    /// Guard 2: the model answered without calling a tool.
    Normal,
    /// Guard 1: the turn budget ran out.
    MaxTurns,
    /// Guard 7: predicted overflow forced finalization.
    Overflow,
}

/// Result of one attempt.
enum AttemptEnd {
    /// Finalization produced a boxed answer.
    Answered(String),
    /// No boxed answer; carries the post-mortem when a retry follows.
    Failed {
        loop_end: LoopEnd,
        experience: Option<FailureExperience>,
    },
    /// Five consecutive rollbacks.
    Aborted,
}

/// Per-task state machine driving the dialogue LLM ↔ tools.
pub struct Orchestrator {
    role: AgentRole,
    llm: Arc<dyn LanguageModel>,
    summarizer: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolDispatch>,
    settings: Arc<Settings>,
    events: EventSink,
    cancel: CancelToken,
    /// One index per task, shared with nested sub-agents and keyed by
    /// `(agent, tool)`. Never shared across tasks.
    used_queries: Arc<std::sync::Mutex<QueryIndex>>,
    task_log: Vec<AgentEvent>,
}

impl Orchestrator {
    pub fn new(
        role: AgentRole,
        llm: Arc<dyn LanguageModel>,
        summarizer: Arc<dyn LanguageModel>,
        tools: Arc<dyn ToolDispatch>,
        settings: Arc<Settings>,
        events: EventSink,
        cancel: CancelToken,
    ) -> Self {
        Self {
            role,
            llm,
            summarizer,
            tools,
            settings,
            events,
            cancel,
            used_queries: Arc::new(std::sync::Mutex::new(QueryIndex::new())),
            task_log: Vec::new(),
        }
    }

    fn query_count(&self, tool: &str, query: &str) -> u32 {
        self.used_queries
            .lock()
            .expect("query index mutex poisoned")
            .count(self.role.as_str(), tool, query)
    }

    fn record_query(&self, tool: &str, query: &str) {
        self.used_queries
            .lock()
            .expect("query index mutex poisoned")
            .record(self.role.as_str(), tool, query);
    }

    fn agent_settings(&self) -> &AgentSettings {
        self.settings.agent_settings(self.role)
    }

    fn emit(&mut self, event: AgentEvent) {
        self.task_log.push(event.clone());
        self.events.emit(event);
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The catalog shown to this role: every remote tool, plus the
    /// sub-agent pseudo-tool for the main role only.
    fn full_catalog(&self) -> Vec<ToolCatalogEntry> {
        let mut catalog = self.tools.catalog().to_vec();
        if self.role == AgentRole::Main {
            catalog.push(sub_agent_entry());
        }
        catalog
    }

    /// Run the task to completion. Never panics and never returns `Err`;
    /// every failure mode is folded into the report's outcome.
    pub async fn run(mut self, task_text: &str) -> TaskReport {
        self.emit(AgentEvent::AgentStarted {
            agent: self.role,
            task_text: task_text.to_string(),
        });

        let max_attempts = self.agent_settings().max_attempts.max(1);
        let mut experiences: Vec<FailureExperience> = Vec::new();
        let mut intermediate_answers: Vec<String> = Vec::new();

        let mut last_loop_end = LoopEnd::MaxTurns;

        for attempt in 0..max_attempts {
            let is_last = attempt + 1 == max_attempts;
            let result = self
                .run_attempt(task_text, &experiences, &mut intermediate_answers, is_last)
                .await;

            match result {
                Ok(AttemptEnd::Answered(answer)) => {
                    self.emit(AgentEvent::FinalAnswer {
                        text: answer.clone(),
                    });
                    self.emit(AgentEvent::AgentEnded {
                        outcome: Outcome::Success,
                    });
                    return TaskReport {
                        outcome: Outcome::Success,
                        final_answer: Some(answer),
                        task_log: self.task_log,
                    };
                }
                Ok(AttemptEnd::Failed {
                    loop_end,
                    experience,
                }) => {
                    last_loop_end = loop_end;
                    if let Some(exp) = experience {
                        tracing::info!(
                            agent = self.role.as_str(),
                            attempt,
                            failure = %exp.failure_type,
                            "attempt failed, retrying with injected experience"
                        );
                        experiences.push(exp);
                    }
                }
                Ok(AttemptEnd::Aborted) => {
                    self.emit(AgentEvent::AgentEnded {
                        outcome: Outcome::TooManyRollbacks,
                    });
                    return TaskReport {
                        outcome: Outcome::TooManyRollbacks,
                        final_answer: None,
                        task_log: self.task_log,
                    };
                }
                Err(e) => {
                    tracing::warn!(agent = self.role.as_str(), error = %e, "task ended fatally");
                    self.emit(AgentEvent::AgentEnded {
                        outcome: Outcome::Fatal,
                    });
                    return TaskReport {
                        outcome: Outcome::Fatal,
                        final_answer: None,
                        task_log: self.task_log,
                    };
                }
            }
        }

        // All attempts failed. An answer boxed mid-run beats reporting
        // nothing at all.
        if let Some(answer) = intermediate_answers.last().cloned() {
            let answer = parser::strip_think_tags(&answer);
            self.emit(AgentEvent::FinalAnswer {
                text: answer.clone(),
            });
            self.emit(AgentEvent::AgentEnded {
                outcome: Outcome::Success,
            });
            return TaskReport {
                outcome: Outcome::Success,
                final_answer: Some(answer),
                task_log: self.task_log,
            };
        }

        let outcome = match last_loop_end {
            LoopEnd::Normal | LoopEnd::MaxTurns | LoopEnd::Overflow => Outcome::MaxTurns,
        };
        self.emit(AgentEvent::AgentEnded { outcome });
        TaskReport {
            outcome,
            final_answer: None,
            task_log: self.task_log,
        }
    }

    /// One attempt: the bounded main loop, then finalization.
    async fn run_attempt(
        &mut self,
        task_text: &str,
        experiences: &[FailureExperience],
        intermediate_answers: &mut Vec<String>,
        is_last_attempt: bool,
    ) -> Result<AttemptEnd> {
        let agent = self.agent_settings().clone();
        let max_turns = agent.max_turns;
        let catalog = self.full_catalog();

        // The system prompt is fixed for the whole attempt; it is only
        // regenerated here, when a new attempt begins.
        let system_prompt = prompts::compose_system_prompt(self.role, &catalog, experiences);
        let summary_prompt = prompts::compose_summary_prompt(self.role);

        let mut messages = vec![Message::system(system_prompt), Message::user(task_text)];

        // Sub-agents never compact (their budgets fit the window strategies).
        let compression = self.settings.context_compression_enabled && self.role == AgentRole::Main;
        let ctx = ContextManager::new(
            ContextStrategy::from_settings(
                agent.keep_tool_result,
                agent.context_compress_limit,
                compression,
            ),
            agent.reserved_completion_tokens as usize,
        );

        let mut turn: u32 = 0;
        let mut total_steps: u32 = 0;
        let mut consecutive_rollbacks: u32 = 0;
        let mut last_usage: (usize, usize) = (0, 0);
        let loop_end;

        loop {
            self.check_cancelled()?;

            // Guard 1: turn budget, plus the hard ceiling on LLM calls
            // spent across rolled-back turns.
            if turn >= max_turns {
                loop_end = LoopEnd::MaxTurns;
                break;
            }
            if total_steps >= max_turns + EXTRA_ATTEMPTS_BUFFER {
                loop_end = LoopEnd::MaxTurns;
                break;
            }

            if ctx.should_compact(turn) {
                tracing::debug!(agent = self.role.as_str(), turn, "compacting context");
                ctx.compact(
                    &mut messages,
                    self.summarizer.as_ref(),
                    agent.reserved_completion_tokens,
                )
                .await?;
                turn = 0;
                continue;
            }

            let completion = self
                .call_llm_streamed(&messages, agent.reserved_completion_tokens)
                .await?;
            total_steps += 1;
            turn += 1;
            last_usage = (
                completion.prompt_tokens as usize,
                completion.completion_tokens as usize,
            );
            messages.push(Message::assistant(completion.text.clone()));

            self.check_cancelled()?;

            let boxed = parser::extract_boxed(&completion.text);
            if let Some(b) = &boxed {
                intermediate_answers.push(b.clone());
            }
            let refusal = parser::contains_refusal(&completion.text);

            let calls = match parser::parse_tool_calls(&completion.text) {
                Ok(calls) => calls,
                Err(e) => {
                    tracing::warn!(agent = self.role.as_str(), error = %e, "unparseable tool call");
                    self.emit(AgentEvent::ParseResult {
                        tool_calls: 0,
                        boxed: boxed.clone(),
                    });
                    if self.rollback(
                        &mut messages,
                        &mut turn,
                        &mut consecutive_rollbacks,
                        RollbackReason::Parse,
                    ) {
                        continue;
                    }
                    return Ok(AttemptEnd::Aborted);
                }
            };

            self.emit(AgentEvent::ParseResult {
                tool_calls: calls.len(),
                boxed: boxed.clone(),
            });

            if calls.is_empty() {
                // Guard 3: the model tried to call a tool but mangled the
                // grammar. When a refusal phrase co-occurs, both are
                // logged; the rollback is recorded as a format error.
                if parser::contains_protocol_tag(&completion.text) {
                    if refusal {
                        tracing::warn!(
                            agent = self.role.as_str(),
                            "response carries both protocol tags and a refusal phrase"
                        );
                    }
                    if self.rollback(
                        &mut messages,
                        &mut turn,
                        &mut consecutive_rollbacks,
                        RollbackReason::Format,
                    ) {
                        continue;
                    }
                    return Ok(AttemptEnd::Aborted);
                }

                // Guard 4: refusal.
                if refusal {
                    if self.rollback(
                        &mut messages,
                        &mut turn,
                        &mut consecutive_rollbacks,
                        RollbackReason::Refusal,
                    ) {
                        continue;
                    }
                    return Ok(AttemptEnd::Aborted);
                }

                // Guard 2: a well-formed answer with no tool call ends the
                // loop on the success path.
                loop_end = LoopEnd::Normal;
                break;
            }

            // Guard 4 also covers responses that refuse while still
            // emitting a tool call.
            if refusal {
                if self.rollback(
                    &mut messages,
                    &mut turn,
                    &mut consecutive_rollbacks,
                    RollbackReason::Refusal,
                ) {
                    continue;
                }
                return Ok(AttemptEnd::Aborted);
            }

            if calls.len() > 1 {
                tracing::warn!(
                    agent = self.role.as_str(),
                    count = calls.len(),
                    "multiple tool-call blocks in one message; taking the first"
                );
            }
            let call = calls.into_iter().next().expect("calls is non-empty");

            // Guard 5: duplicate query. When the rollback budget is spent,
            // the duplicate is allowed through instead of aborting.
            let query = extract_query(&call.tool_name, &call.arguments);
            if let Some(q) = &query {
                if self.query_count(&call.tool_name, q) >= 1 {
                    if consecutive_rollbacks + 1 < MAX_CONSECUTIVE_ROLLBACKS {
                        let rolled = self.rollback(
                            &mut messages,
                            &mut turn,
                            &mut consecutive_rollbacks,
                            RollbackReason::DuplicateQuery,
                        );
                        debug_assert!(rolled);
                        continue;
                    }
                    tracing::debug!(
                        agent = self.role.as_str(),
                        query = %q,
                        "allowing duplicate query, rollback budget spent"
                    );
                }
            }

            self.check_cancelled()?;

            let result = if self.role == AgentRole::Main
                && call.server_name == SUB_AGENT_SERVER
                && call.tool_name == SUB_AGENT_TOOL
            {
                self.run_sub_agent(&call).await?
            } else {
                self.emit(AgentEvent::ToolStarted {
                    server: call.server_name.clone(),
                    tool: call.tool_name.clone(),
                    args: call.arguments.clone(),
                });
                self.tools
                    .invoke(&call.server_name, &call.tool_name, &call.arguments)
                    .await
            };

            // Duplicate-query counts move only after the call executed.
            if let Some(q) = &query {
                self.record_query(&call.tool_name, q);
            }

            // Guard 6: tool execution error.
            if result.is_error {
                self.emit(AgentEvent::ToolFailed {
                    tool: result.tool_name.clone(),
                    error_kind: result.error_kind,
                    message: result.content.clone(),
                });
                if self.rollback(
                    &mut messages,
                    &mut turn,
                    &mut consecutive_rollbacks,
                    RollbackReason::ToolError,
                ) {
                    continue;
                }
                return Ok(AttemptEnd::Aborted);
            }

            self.emit(AgentEvent::ToolSucceeded {
                tool: result.tool_name.clone(),
                payload: result.content.clone(),
            });
            consecutive_rollbacks = 0;

            messages.push(Message::tool_result(format!(
                "Result of {}/{}:\n{}",
                call.server_name, call.tool_name, result.content
            )));
            ctx.apply_window(&mut messages);

            // Guard 7: post-invocation overflow prediction.
            let last_user_text = messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if ctx.predict_overflow(
                self.llm.as_ref(),
                last_usage.0,
                last_usage.1,
                &last_user_text,
                &summary_prompt,
            ) {
                tracing::debug!(agent = self.role.as_str(), turn, "context overflow predicted");
                ctx.pop_overflow_pair(&mut messages);
                turn = max_turns;
                loop_end = LoopEnd::Overflow;
                break;
            }
        }

        self.finalize(
            messages,
            loop_end,
            &summary_prompt,
            agent.reserved_completion_tokens,
            intermediate_answers,
            is_last_attempt,
        )
        .await
    }

    /// Rollback protocol: pop the trailing assistant message, decrement the
    /// turn counter, bump the consecutive-rollback count. Returns `false`
    /// when the attempt must abort.
    fn rollback(
        &mut self,
        messages: &mut Vec<Message>,
        turn: &mut u32,
        consecutive_rollbacks: &mut u32,
        reason: RollbackReason,
    ) -> bool {
        if messages
            .last()
            .map(|m| m.role == MessageRole::Assistant)
            .unwrap_or(false)
        {
            messages.pop();
        }
        *turn = turn.saturating_sub(1);
        *consecutive_rollbacks += 1;
        self.emit(AgentEvent::Rollback { reason });
        tracing::debug!(
            agent = self.role.as_str(),
            reason = reason.as_str(),
            consecutive = *consecutive_rollbacks,
            "rolled back turn"
        );
        *consecutive_rollbacks < MAX_CONSECUTIVE_ROLLBACKS
    }

    /// Final-answer phase: one more LLM call with the summary prompt
    /// appended, then boxed-answer extraction. A failed extraction runs the
    /// post-mortem when another attempt will follow.
    async fn finalize(
        &mut self,
        mut messages: Vec<Message>,
        loop_end: LoopEnd,
        summary_prompt: &str,
        max_tokens: u32,
        intermediate_answers: &mut Vec<String>,
        is_last_attempt: bool,
    ) -> Result<AttemptEnd> {
        self.check_cancelled()?;
        self.emit(AgentEvent::FinalizationStarted);

        messages.push(Message::user(summary_prompt.to_string()));
        let completion = self.call_llm_streamed(&messages, max_tokens).await?;
        messages.push(Message::assistant(completion.text.clone()));

        if let Some(answer) = parser::extract_boxed(&completion.text) {
            return Ok(AttemptEnd::Answered(parser::strip_think_tags(&answer)));
        }

        // Record what the summary said even unboxed; it may be the best
        // fallback the task ever produces.
        let unboxed = parser::strip_think_tags(&completion.text);
        if loop_end == LoopEnd::Normal && !unboxed.is_empty() {
            intermediate_answers.push(unboxed);
        }

        let experience = if is_last_attempt {
            None
        } else {
            Some(self.post_mortem(&messages, max_tokens).await)
        };

        Ok(AttemptEnd::Failed {
            loop_end,
            experience,
        })
    }

    /// No-tools post-mortem over the failed attempt's conversation.
    /// A post-mortem that itself fails degrades to a canned experience
    /// rather than killing the retry.
    async fn post_mortem(&mut self, messages: &[Message], max_tokens: u32) -> FailureExperience {
        let mut request = messages.to_vec();
        request.push(Message::user(prompts::compose_postmortem_prompt()));

        match self.llm.generate(&request, max_tokens).await {
            Ok(completion) => prompts::parse_postmortem(&completion.text, "format_missed"),
            Err(e) => {
                tracing::warn!(agent = self.role.as_str(), error = %e, "post-mortem call failed");
                FailureExperience {
                    failure_type: "format_missed".to_string(),
                    what_happened: "the attempt ended without a boxed answer".to_string(),
                    useful_findings: "none".to_string(),
                }
            }
        }
    }

    /// Spawn the nested browsing orchestrator for one subtask.
    ///
    /// Written as a plain fn returning a boxed future (rather than
    /// `async fn`) so the recursive call into `run` below type-checks:
    /// `run` awaits this future, and this future recursively awaits
    /// `run` again, which the compiler can't prove `Send` for through
    /// two mutually-recursive opaque `impl Future` types.
    fn run_sub_agent<'a>(
        &'a mut self,
        call: &'a ToolCall,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ToolResult>> + Send + 'a>> {
        Box::pin(async move {
            let subtask = call
                .arguments
                .get("subtask")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            if subtask.is_empty() {
                return Ok(ToolResult::err(
                    SUB_AGENT_TOOL,
                    "missing required argument 'subtask'",
                    ErrorKind::Schema,
                ));
            }

            self.emit(AgentEvent::SubAgentStarted {
                subtask: subtask.clone(),
            });

            let mut sub = Orchestrator::new(
                AgentRole::SubBrowsing,
                self.llm.clone(),
                self.summarizer.clone(),
                self.tools.clone(),
                self.settings.clone(),
                self.events.clone(),
                self.cancel.clone(),
            );
            // The duplicate-query index spans the whole task, sub-agents
            // included.
            sub.used_queries = self.used_queries.clone();
            let report = sub.run(&subtask).await;

            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match report.final_answer {
                Some(summary) => {
                    self.emit(AgentEvent::SubAgentEnded {
                        summary: summary.clone(),
                    });
                    Ok(ToolResult::ok(SUB_AGENT_TOOL, summary))
                }
                None => {
                    let message = format!("sub-agent ended without an answer ({})", report.outcome.as_str());
                    self.emit(AgentEvent::SubAgentEnded {
                        summary: message.clone(),
                    });
                    Ok(ToolResult::err(SUB_AGENT_TOOL, message, ErrorKind::Server))
                }
            }
        })
    }

    /// One streamed LLM call, forwarding deltas as `LlmChunk` events.
    /// Deltas are not recorded in the task log; the assembled text lands in
    /// the message history.
    async fn call_llm_streamed(
        &mut self,
        messages: &[Message],
        max_tokens: u32,
    ) -> Result<Completion> {
        self.emit(AgentEvent::LlmStarted);

        let (tx, mut rx) = mpsc::channel::<String>(32);
        let llm = self.llm.clone();
        let generation = llm.generate_streamed(messages, max_tokens, tx);
        tokio::pin!(generation);

        let completion = loop {
            tokio::select! {
                result = &mut generation => break result?,
                Some(chunk) = rx.recv() => {
                    self.events.emit(AgentEvent::LlmChunk { text: chunk });
                }
            }
        };
        // The sender is dropped once generation returns; drain stragglers.
        while let Ok(chunk) = rx.try_recv() {
            self.events.emit(AgentEvent::LlmChunk { text: chunk });
        }

        self.emit(AgentEvent::LlmEnded {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
        });
        Ok(completion)
    }
}

/// Catalog entry for the sub-agent pseudo-tool.
fn sub_agent_entry() -> ToolCatalogEntry {
    ToolCatalogEntry {
        server_name: SUB_AGENT_SERVER.to_string(),
        tool_name: SUB_AGENT_TOOL.to_string(),
        description: "Delegate a focused web-research subtask to a browsing agent. \
                      Returns the agent's findings as text."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "subtask": {
                    "type": "string",
                    "description": "A self-contained description of what to find out"
                }
            },
            "required": ["subtask"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// A model that replays a fixed list of responses.
    struct Scripted {
        responses: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn generate(&self, _: &[Message], _: u32) -> Result<Completion> {
            let text = self
                .responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "\\boxed{out of script}".to_string());
            Ok(Completion {
                text,
                prompt_tokens: 10,
                completion_tokens: 10,
            })
        }

        fn estimate_tokens(&self, text: &str) -> usize {
            text.len() / 4
        }

        fn max_context_length(&self) -> usize {
            100_000
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolDispatch for NoTools {
        fn catalog(&self) -> &[ToolCatalogEntry] {
            &[]
        }

        async fn invoke(&self, _: &str, tool: &str, _: &serde_json::Value) -> ToolResult {
            ToolResult::err(tool, "no tools in this fixture", ErrorKind::Schema)
        }
    }

    fn orchestrator(llm: Arc<dyn LanguageModel>) -> Orchestrator {
        Orchestrator::new(
            AgentRole::Main,
            llm.clone(),
            llm,
            Arc::new(NoTools),
            Arc::new(Settings::default()),
            EventSink::null(),
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn test_direct_answer_success() {
        let llm = Scripted::new(&[
            "The sum is 4, no tools needed.",
            "The final answer is \\boxed{4}.",
        ]);
        let report = orchestrator(llm).run("What is 2+2?").await;
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.final_answer.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_refusal_rolls_back_then_recovers() {
        let llm = Scripted::new(&[
            "I'm sorry, but I can't do that.",
            "On reflection it is just arithmetic.",
            "\\boxed{4}",
        ]);
        let report = orchestrator(llm).run("What is 2+2?").await;
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.final_answer.as_deref(), Some("4"));

        let rollbacks = report
            .task_log
            .iter()
            .filter(|e| matches!(e, AgentEvent::Rollback { reason: RollbackReason::Refusal }))
            .count();
        assert_eq!(rollbacks, 1);
    }

    #[tokio::test]
    async fn test_five_consecutive_rollbacks_abort() {
        let llm = Scripted::new(&[
            "I'm sorry, but I can't.",
            "I'm sorry, but I can't.",
            "I'm sorry, but I can't.",
            "I'm sorry, but I can't.",
            "I'm sorry, but I can't.",
        ]);
        let report = orchestrator(llm).run("impossible").await;
        assert_eq!(report.outcome, Outcome::TooManyRollbacks);
        assert!(report.final_answer.is_none());

        let rollbacks = report
            .task_log
            .iter()
            .filter(|e| matches!(e, AgentEvent::Rollback { .. }))
            .count();
        assert_eq!(rollbacks, MAX_CONSECUTIVE_ROLLBACKS as usize);
    }

    #[tokio::test]
    async fn test_format_error_rolls_back() {
        let llm = Scripted::new(&[
            "<use_mcp_tool><server_name>search</server_name>", // mangled block
            "Fine, the answer is 4.",
            "\\boxed{4}",
        ]);
        let report = orchestrator(llm).run("What is 2+2?").await;
        assert_eq!(report.outcome, Outcome::Success);
        assert!(report
            .task_log
            .iter()
            .any(|e| matches!(e, AgentEvent::Rollback { reason: RollbackReason::Format })));
    }

    #[tokio::test]
    async fn test_cancellation_is_fatal() {
        let llm = Scripted::new(&["irrelevant"]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let orch = Orchestrator::new(
            AgentRole::Main,
            llm.clone(),
            llm,
            Arc::new(NoTools),
            Arc::new(Settings::default()),
            EventSink::null(),
            cancel,
        );
        let report = orch.run("anything").await;
        assert_eq!(report.outcome, Outcome::Fatal);
        assert!(report.final_answer.is_none());
    }

    #[tokio::test]
    async fn test_final_answer_strips_think_tags() {
        let llm = Scripted::new(&[
            "Done thinking.",
            "<think>should I?</think>\\boxed{<think>inner</think>42}",
        ]);
        let report = orchestrator(llm).run("q").await;
        assert_eq!(report.final_answer.as_deref(), Some("42"));
    }

    #[test]
    fn test_sub_agent_entry_schema() {
        let entry = sub_agent_entry();
        assert_eq!(entry.server_name, SUB_AGENT_SERVER);
        assert_eq!(entry.tool_name, SUB_AGENT_TOOL);
        assert_eq!(entry.input_schema["required"][0], "subtask");
    }
}
