//! Extraction of tool calls and final answers from raw LLM text.
//!
//! The grammar is the one the prompt preamble promises the model
//! (see [`crate::prompts`]):
//!
//! ```text
//! <use_mcp_tool>
//!   <server_name>…</server_name>
//!   <tool_name>…</tool_name>
//!   <arguments>{ JSON }</arguments>
//! </use_mcp_tool>
//! ```
//!
//! Extraction is regex-level: the block is not validated as XML, only
//! pattern-matched. Besides tool calls this module extracts the
//! `\boxed{…}` final-answer sentinel and strips `<think>…</think>` spans
//! that some models leak into their output.

use crate::types::ToolCall;
use crate::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Phrases that mark a response as a refusal. Any of these triggers the
/// refusal guard in the orchestrator.
pub const REFUSAL_PHRASES: &[&str] = &[
    "time constraint",
    "I'm sorry, but I can't",
    "I'm sorry, I cannot solve",
];

/// Tags whose presence marks a malformed tool-call attempt when no complete
/// block could be extracted.
pub const PROTOCOL_TAGS: &[&str] = &[
    "<use_mcp_tool>",
    "<server_name>",
    "<tool_name>",
    "<arguments>",
];

fn tool_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?s)<use_mcp_tool>\s*<server_name>(.*?)</server_name>\s*<tool_name>(.*?)</tool_name>\s*<arguments>(.*?)</arguments>\s*</use_mcp_tool>",
        )
        .expect("tool block regex is valid")
    })
}

fn think_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("think regex is valid"))
}

/// Extract every well-formed tool-call block, in order.
///
/// Returns an empty vector when no block is present. Malformed JSON in an
/// `<arguments>` section is a parse error: the orchestrator rolls the turn
/// back rather than guessing.
pub fn parse_tool_calls(text: &str) -> Result<Vec<ToolCall>> {
    let mut calls = Vec::new();
    for captures in tool_block_regex().captures_iter(text) {
        let server_name = captures[1].trim().to_string();
        let tool_name = captures[2].trim().to_string();
        let raw_args = captures[3].trim();

        let arguments = parse_arguments(raw_args)
            .map_err(|e| Error::parse(format!("arguments of {}/{}: {}", server_name, tool_name, e)))?;

        calls.push(ToolCall {
            server_name,
            tool_name,
            arguments,
        });
    }
    Ok(calls)
}

/// Parse the arguments block, with one lenient pass before giving up:
/// models occasionally wrap the JSON in a code fence or leave a trailing
/// comma, neither of which is worth a rollback.
fn parse_arguments(raw: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let repaired = repair_json(raw);
            serde_json::from_str(&repaired).map_err(|_| first_err)
        }
    }
}

fn repair_json(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    let re = TRAILING_COMMA
        .get_or_init(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex is valid"));
    re.replace_all(s.trim(), "$1").into_owned()
}

/// Whether the text contains any protocol tag.
///
/// Used by the format guard: tags present but no complete block extracted
/// means the model tried and failed to emit a tool call.
pub fn contains_protocol_tag(text: &str) -> bool {
    PROTOCOL_TAGS.iter().any(|tag| text.contains(tag))
}

/// Whether the text contains a refusal phrase.
pub fn contains_refusal(text: &str) -> bool {
    REFUSAL_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// Extract the content of the last `\boxed{…}` in the text, handling nested
/// braces by balance counting.
pub fn extract_boxed(text: &str) -> Option<String> {
    const OPEN: &str = "\\boxed{";
    let mut result = None;
    let mut search_from = 0;

    while let Some(pos) = text[search_from..].find(OPEN) {
        let start = search_from + pos + OPEN.len();
        let mut depth = 1usize;
        let mut end = None;
        for (i, c) in text[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(start + i);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                result = Some(text[start..end].trim().to_string());
                search_from = end + 1;
            }
            // Unbalanced: no closing brace for this occurrence.
            None => break,
        }
    }

    result
}

/// Remove `<think>…</think>` spans leaked by the underlying model.
pub fn strip_think_tags(text: &str) -> String {
    think_regex().replace_all(text, "").trim().to_string()
}
