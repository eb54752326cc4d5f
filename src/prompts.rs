//! Prompt composition: system, summary, and failure-experience prompts.
//!
//! The system prompt carries a contract the response parser depends on: the
//! model is told to request tools with the exact `<use_mcp_tool>` tag grammar
//! that [`crate::parser`] extracts. Changing the preamble here without
//! updating the parser breaks every tool call.

use crate::types::{AgentRole, ToolCatalogEntry};
use chrono::Utc;

/// Tool-use protocol preamble.
///
/// Contract with the model: one tool call per assistant turn, placed as the
/// last top-level element of the message, using the three nested tags below.
/// Quotes inside JSON string values must be escaped with backslashes.
const TOOL_PROTOCOL_PREAMBLE: &str = r#"You can use tools to gather information. To call a tool, emit exactly one block of the following form, as the LAST element of your message:

<use_mcp_tool>
<server_name>server name here</server_name>
<tool_name>tool name here</tool_name>
<arguments>
{
  "param": "value"
}
</arguments>
</use_mcp_tool>

Rules:
- At most ONE tool call per message.
- The tool call must be the last top-level element of your message; you may reason in plain text before it.
- The <arguments> block must contain a single valid JSON object. Escape embedded double quotes as \".
- Wait for the tool result before calling another tool."#;

/// Objective section for the main research agent.
const MAIN_OBJECTIVE: &str = r#"You are a research agent. Work step by step: decide what information is missing, gather it with the available tools, and cross-check important claims. When you have enough evidence to answer, stop calling tools and state your conclusion."#;

/// Objective section for the nested browsing agent.
const SUB_BROWSING_OBJECTIVE: &str = r#"You are a focused web-browsing agent working on a delegated subtask. Use the search and page-fetch tools to collect the specific facts the subtask asks for, then report what you found, with source URLs. Do not broaden the subtask."#;

/// Header and footer around injected failure experiences.
pub const FAILURE_EXPERIENCE_HEADER: &str = "=== Previous Attempts Analysis ===";
const FAILURE_EXPERIENCE_FOOTER: &str =
    "Use the analysis above to avoid repeating the same mistakes in this attempt.";

/// A structured post-mortem from a prior attempt.
#[derive(Debug, Clone)]
pub struct FailureExperience {
    /// One of `incomplete`, `blocked`, `misdirected`, `format_missed`.
    pub failure_type: String,
    /// Short narrative of what went wrong.
    pub what_happened: String,
    /// Findings worth carrying into the next attempt.
    pub useful_findings: String,
}

/// Render the tool catalog the way the model sees it: one block per tool
/// with its JSON schema.
fn render_catalog(catalog: &[ToolCatalogEntry]) -> String {
    let mut out = String::from("# Available tools\n");
    for entry in catalog {
        let schema = serde_json::to_string_pretty(&entry.input_schema)
            .unwrap_or_else(|_| "{}".to_string());
        out.push_str(&format!(
            "\n## {}/{}\n{}\nInput schema:\n```json\n{}\n```\n",
            entry.server_name, entry.tool_name, entry.description, schema
        ));
    }
    out
}

fn render_failure_block(experiences: &[FailureExperience]) -> String {
    let mut out = String::new();
    out.push_str(FAILURE_EXPERIENCE_HEADER);
    out.push('\n');
    for (i, exp) in experiences.iter().enumerate() {
        out.push_str(&format!(
            "\nAttempt {}: {}\nWhat happened: {}\nUseful findings: {}\n",
            i + 1,
            exp.failure_type,
            exp.what_happened,
            exp.useful_findings
        ));
    }
    out.push('\n');
    out.push_str(FAILURE_EXPERIENCE_FOOTER);
    out
}

/// Build the system prompt for one attempt.
///
/// Regenerated only when a new outer attempt begins; never rewritten
/// mid-turn. Failure experiences from prior attempts are prepended.
pub fn compose_system_prompt(
    role: AgentRole,
    catalog: &[ToolCatalogEntry],
    experiences: &[FailureExperience],
) -> String {
    let objective = match role {
        AgentRole::Main => MAIN_OBJECTIVE,
        AgentRole::SubBrowsing => SUB_BROWSING_OBJECTIVE,
    };

    let mut prompt = String::new();
    if !experiences.is_empty() {
        prompt.push_str(&render_failure_block(experiences));
        prompt.push_str("\n\n");
    }
    prompt.push_str(objective);
    prompt.push_str("\n\n");
    prompt.push_str(TOOL_PROTOCOL_PREAMBLE);
    prompt.push_str("\n\n");
    prompt.push_str(&render_catalog(catalog));
    prompt.push_str(&format!(
        "\nCurrent date: {}\n",
        Utc::now().format("%Y-%m-%d")
    ));
    prompt
}

/// Finalization instructions appended as the last user message.
///
/// Forbids further tool calls and demands the boxed sentinel.
pub fn compose_summary_prompt(role: AgentRole) -> String {
    let closing = match role {
        AgentRole::Main => {
            "Write your final answer to the original question, based on everything gathered above."
        }
        AgentRole::SubBrowsing => {
            "Summarize the findings for your subtask, including the relevant source URLs."
        }
    };
    format!(
        "{} Do NOT call any more tools. End your message with the answer wrapped exactly as \\boxed{{your answer here}}.",
        closing
    )
}

/// No-tools post-mortem prompt used after a failed attempt.
pub fn compose_postmortem_prompt() -> String {
    "The attempt above did not produce a usable answer. Without calling any tools, analyze what went wrong. Reply in exactly this form:\n\
     failure_type: one of incomplete | blocked | misdirected | format_missed\n\
     what_happened: one or two sentences\n\
     useful_findings: facts worth keeping for a retry, or 'none'"
        .to_string()
}

/// Parse the post-mortem response leniently; anything unlabeled lands in
/// `what_happened` so no analysis is lost.
pub fn parse_postmortem(text: &str, default_type: &str) -> FailureExperience {
    let mut failure_type = default_type.to_string();
    let mut what_happened = String::new();
    let mut useful_findings = String::from("none");

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("failure_type:") {
            failure_type = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("what_happened:") {
            what_happened = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("useful_findings:") {
            useful_findings = rest.trim().to_string();
        }
    }

    if what_happened.is_empty() {
        what_happened = text.trim().chars().take(500).collect();
    }

    FailureExperience {
        failure_type,
        what_happened,
        useful_findings,
    }
}
