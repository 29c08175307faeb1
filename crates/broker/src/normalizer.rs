//! Request Normalizer: converts an inbound OpenAI-shaped completion request
//! into the forwarded wire message. Worker-independent — the per-worker
//! cache-hit comparison happens in the Dispatcher, which is the first
//! component that actually knows which worker was claimed.

use sha2::{Digest, Sha256};

use crate::error::{BrokerError, Result};
use crate::wire::{ChatCompletionRequest, MessageRole, ToolSpec};

/// The terminal sentinel the worker is instructed to emit, used by the
/// Response Parser to recognize end-of-response.
pub const RESPONSE_DONE_SENTINEL: &str = "<response_done>";

const SYNTHESIZED_FORMAT_INSTRUCTION: &str = concat!(
    "Wrap your reply's visible answer in <content></content> tags. ",
    "If you need to call a tool, wrap a JSON array of calls in <tool_calls></tool_calls> tags. ",
    "Always terminate your response with the literal marker <response_done>."
);

/// Worker-independent projection of an inbound request, ready to be
/// compared against a claimed worker's cached digests.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub model: String,
    pub last_user_message: String,
    pub system_messages: Vec<String>,
    pub system_digest: String,
    pub tools: Option<Vec<ToolSpec>>,
    pub tools_digest: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// Build the `Normalized` projection from an inbound request.
///
/// Policies, all mandatory:
/// - keep every system message in order; keep only the last user message.
/// - synthesize a format-instructing system message when none is present.
/// - fingerprint system messages and tools independently.
pub fn normalize(request: &ChatCompletionRequest) -> Result<Normalized> {
    let mut system_messages: Vec<String> = Vec::new();
    let mut last_user_message: Option<String> = None;

    for message in &request.messages {
        match message.role {
            MessageRole::System => system_messages.push(message.content.clone()),
            MessageRole::User => last_user_message = Some(message.content.clone()),
            // Assistant history and tool results are dropped: the worker
            // drives a chat UI that maintains its own context.
            MessageRole::Assistant | MessageRole::Tool => {}
        }
    }

    // Last user message wins regardless of content; an empty or missing one
    // is an input error, not a reason to fall back to an earlier turn.
    let last_user_message = match last_user_message {
        Some(content) if !content.trim().is_empty() => content,
        _ => return Err(BrokerError::MissingUser),
    };

    if system_messages.is_empty() {
        system_messages.push(SYNTHESIZED_FORMAT_INSTRUCTION.to_string());
    }

    let system_digest = fingerprint(&system_messages);
    let tools_digest = request.tools.as_ref().map(|tools| fingerprint(tools));

    Ok(Normalized {
        model: request.model.clone(),
        last_user_message,
        system_messages,
        system_digest,
        tools: request.tools.clone(),
        tools_digest,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        stream: request.stream.unwrap_or(false),
    })
}

/// A stable cryptographic digest of the canonical JSON encoding of `value`.
/// Collision-resistance need only withstand accident, not an adversary.
fn fingerprint<T: serde::Serialize>(value: &T) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    format!("{:x}", hasher.finalize())
}
