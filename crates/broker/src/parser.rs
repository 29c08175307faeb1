//! Response Parser: extracts a structured completion result from a
//! worker's free-form reply. The fallback ladder's rule order is normative
//! — see the "parser rule order is normative" design note — reordering
//! changes observable behavior for replies that contain both a marker and
//! an embedded JSON object.

use serde::Deserialize;
use serde_json::Value;

use agentbridge_common::RequestId;

use crate::normalizer::RESPONSE_DONE_SENTINEL;
use crate::wire::{FunctionCall, ToolCall};

const CONTENT_OPEN: &str = "<content>";
const CONTENT_CLOSE: &str = "</content>";
const TOOL_CALLS_OPEN: &str = "<tool_calls>";
const TOOL_CALLS_CLOSE: &str = "</tool_calls>";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// Run the four-rule fallback ladder against a worker's raw reply.
pub fn parse(reply: &str, request_id: RequestId) -> CompletionResult {
    if let Some(result) = try_marker_delimited(reply, request_id) {
        return result;
    }
    if let Some(result) = try_json_object(reply.trim(), request_id) {
        return result;
    }
    if let Some(result) = try_fenced_json(reply, request_id) {
        return result;
    }
    metrics::counter!("broker.parser.plain_text_fallback").increment(1);
    plain_text_fallback(reply)
}

fn try_marker_delimited(reply: &str, request_id: RequestId) -> Option<CompletionResult> {
    let has_content_pair = reply.contains(CONTENT_OPEN) && reply.contains(CONTENT_CLOSE);
    let has_tool_calls_pair = reply.contains(TOOL_CALLS_OPEN) && reply.contains(TOOL_CALLS_CLOSE);
    let sentinel_pos = reply.find(RESPONSE_DONE_SENTINEL);

    if !has_content_pair && !has_tool_calls_pair && sentinel_pos.is_none() {
        return None;
    }

    let content = if has_content_pair {
        extract_between(reply, CONTENT_OPEN, CONTENT_CLOSE)?
    } else if let Some(pos) = sentinel_pos {
        reply[..pos].to_string()
    } else {
        String::new()
    };

    let tool_calls = if has_tool_calls_pair {
        let inner = extract_between(reply, TOOL_CALLS_OPEN, TOOL_CALLS_CLOSE)?;
        // Malformed JSON inside a tool-calls block must not abort the
        // dispatch — abandon this rule entirely and fall through.
        parse_tool_calls_array(inner.trim(), request_id)?
    } else {
        Vec::new()
    };

    Some(finish(content.trim().to_string(), tool_calls))
}

fn extract_between(text: &str, open: &str, close: &str) -> Option<String> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(text[start..end].to_string())
}

fn try_json_object(trimmed: &str, request_id: RequestId) -> Option<CompletionResult> {
    if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
        return None;
    }
    parse_object_semantics(trimmed, request_id)
}

fn try_fenced_json(reply: &str, request_id: RequestId) -> Option<CompletionResult> {
    let blocks = find_fenced_json_blocks(reply);
    let last = blocks.last()?;
    parse_object_semantics(last.trim(), request_id)
}

/// Find every ` ```json ... ``` ` fence in source order.
fn find_fenced_json_blocks(text: &str) -> Vec<String> {
    const FENCE_OPEN: &str = "```json";
    const FENCE_CLOSE: &str = "```";

    let mut blocks = Vec::new();
    let mut cursor = 0usize;

    while let Some(rel_start) = text[cursor..].find(FENCE_OPEN) {
        let body_start = cursor + rel_start + FENCE_OPEN.len();
        let Some(rel_end) = text[body_start..].find(FENCE_CLOSE) else {
            break;
        };
        let body_end = body_start + rel_end;
        blocks.push(text[body_start..body_end].to_string());
        cursor = body_end + FENCE_CLOSE.len();
    }

    blocks
}

#[derive(Debug, Deserialize, Default)]
struct ParsedReplyObject {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<RawToolCall>>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawToolCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    arguments: Value,
}

/// Apply "rule 2 semantics" — direct field reads — to a JSON object text.
/// A malformed object (fails to deserialize, or a tool-call element is
/// missing its name) means this rule does not match; the caller falls
/// through to the next rule.
fn parse_object_semantics(object_text: &str, request_id: RequestId) -> Option<CompletionResult> {
    let parsed: ParsedReplyObject = serde_json::from_str(object_text).ok()?;

    let tool_calls = match parsed.tool_calls {
        Some(raw) => normalize_tool_calls(raw, request_id),
        None => Vec::new(),
    };

    let content = parsed.content.unwrap_or_default();

    let finish_reason = parsed.finish_reason.unwrap_or_else(|| {
        if tool_calls.is_empty() {
            "stop".to_string()
        } else {
            "tool_calls".to_string()
        }
    });

    Some(CompletionResult {
        content,
        tool_calls,
        finish_reason,
    })
}

fn parse_tool_calls_array(text: &str, request_id: RequestId) -> Option<Vec<ToolCall>> {
    let raw: Vec<RawToolCall> = serde_json::from_str(text).ok()?;
    Some(normalize_tool_calls(raw, request_id))
}

fn normalize_tool_calls(raw: Vec<RawToolCall>, request_id: RequestId) -> Vec<ToolCall> {
    raw.into_iter()
        .enumerate()
        .map(|(index, call)| {
            let id = call
                .id
                .unwrap_or_else(|| format!("call_{request_id}_{index}"));
            let arguments = match call.arguments {
                Value::String(s) => s,
                other => serde_json::to_string(&other).unwrap_or_default(),
            };
            ToolCall {
                id,
                kind: "function".into(),
                function: FunctionCall {
                    name: call.name,
                    arguments,
                },
            }
        })
        .collect()
}

fn finish(content: String, tool_calls: Vec<ToolCall>) -> CompletionResult {
    let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
    CompletionResult {
        content,
        tool_calls,
        finish_reason: finish_reason.to_string(),
    }
}

fn plain_text_fallback(reply: &str) -> CompletionResult {
    CompletionResult {
        content: reply.trim().to_string(),
        tool_calls: Vec::new(),
        finish_reason: "stop".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid() -> RequestId {
        RequestId::new()
    }

    #[test]
    fn marker_delimited_content_only() {
        let result = parse("<content>x</content><response_done>", rid());
        assert_eq!(result.content, "x");
        assert_eq!(result.finish_reason, "stop");
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn sentinel_alone_delimits_content() {
        let result = parse("hello there<response_done>", rid());
        assert_eq!(result.content, "hello there");
    }

    #[test]
    fn marker_delimited_tool_calls() {
        let reply = r#"<tool_calls>[{"name":"f","arguments":{"a":1}}]</tool_calls><response_done>"#;
        let result = parse(reply, rid());
        assert_eq!(result.finish_reason, "tool_calls");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].function.name, "f");
        assert_eq!(result.tool_calls[0].function.arguments, r#"{"a":1}"#);
    }

    #[test]
    fn json_object_rule_reads_fields_directly() {
        let reply = r#"{"content":"hi","tool_calls":null,"finish_reason":"stop"}"#;
        let result = parse(reply, rid());
        assert_eq!(result.content, "hi");
        assert_eq!(result.finish_reason, "stop");
    }

    #[test]
    fn fenced_json_takes_the_last_block() {
        let reply = "```json\n{\"content\":\"old\"}\n```\nsome text\n```json\n{\"content\":\"new\"}\n```";
        let result = parse(reply, rid());
        assert_eq!(result.content, "new");
    }

    #[test]
    fn fenced_json_tool_call_normalizes_object_arguments() {
        let reply = "```json\n{\"content\":\"\",\"tool_calls\":[{\"name\":\"f\",\"arguments\":{\"a\":1}}],\"finish_reason\":\"tool_calls\"}\n```";
        let result = parse(reply, rid());
        assert_eq!(result.finish_reason, "tool_calls");
        assert_eq!(result.tool_calls[0].function.name, "f");
        assert_eq!(result.tool_calls[0].function.arguments, r#"{"a":1}"#);
    }

    #[test]
    fn plain_text_fallback_when_nothing_matches() {
        let result = parse("just some words", rid());
        assert_eq!(result.content, "just some words");
        assert_eq!(result.finish_reason, "stop");
        assert!(result.tool_calls.is_empty());
    }

    #[test]
    fn malformed_tool_calls_json_falls_through_not_aborts() {
        // Tool-calls marker present but its body is not valid JSON; must
        // fall through to plain text rather than panicking or erroring.
        let reply = "<tool_calls>not json</tool_calls>";
        let result = parse(reply, rid());
        assert_eq!(result.content, reply.trim());
        assert_eq!(result.finish_reason, "stop");
    }

    #[test]
    fn synthesizes_ids_when_absent() {
        let reply = r#"{"tool_calls":[{"name":"f","arguments":"{}"},{"name":"g","arguments":"{}"}]}"#;
        let result = parse(reply, rid());
        assert_ne!(result.tool_calls[0].id, result.tool_calls[1].id);
    }
}
