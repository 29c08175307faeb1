//! Wire types: the OpenAI-compatible HTTP envelope and the worker-transport
//! frame protocol. The two are deliberately kept separate — the HTTP surface
//! is a fixed external contract, the worker frames are this broker's own
//! wire format (see the Request Normalizer and Response Parser).

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// HTTP chat-completion request/response (OpenAI-shaped)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<IncomingMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<ToolSpec>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

/// Token accounting is not observable through the free-form worker channel;
/// the broker reports zeros rather than fabricate numbers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: &'static str,
    pub owned_by: &'static str,
}

// ---------------------------------------------------------------------------
// Worker transport: broker -> worker frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerFrame {
    ConnectionEstablished {
        worker_id: String,
    },
    Heartbeat,
    CompletionRequest {
        request_id: String,
        model: String,
        messages: Vec<ForwardedMessage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        stream: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        tools: Option<Vec<ToolSpec>>,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// A single message in the forwarded request, after normalizer projection.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedMessage {
    pub role: MessageRole,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Worker transport: worker -> broker frames
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum WorkerFrame {
    Register {
        worker_id: Option<String>,
        user_agent: Option<String>,
        origin: Option<String>,
    },
    ClientReady,
    HeartbeatResponse,
    CompletionResponse {
        request_id: String,
        content: String,
        tool_calls: Option<Value>,
        finish_reason: Option<String>,
        error: Option<String>,
    },
    ClientLog {
        message: String,
    },
}

/// Parse a raw text frame from a worker. Unrecognized `type` values are
/// reported through the `Err` side rather than silently dropped, so the
/// caller can reply with an `error` frame instead of tearing down the
/// connection (see Worker Session, §4.3).
pub fn parse_worker_frame(raw: &str) -> Result<WorkerFrame, UnrecognizedFrame> {
    let value: Value = serde_json::from_str(raw).map_err(|e| UnrecognizedFrame {
        type_name: None,
        detail: e.to_string(),
    })?;

    let type_name = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let field = |name: &str| value.get(name).cloned();
    let field_str = |name: &str| field(name).and_then(|v| v.as_str().map(str::to_string));

    match type_name.as_str() {
        "register" => Ok(WorkerFrame::Register {
            worker_id: field_str("worker_id"),
            user_agent: field_str("user_agent"),
            origin: field_str("origin"),
        }),
        "client_ready" => Ok(WorkerFrame::ClientReady),
        "heartbeat_response" => Ok(WorkerFrame::HeartbeatResponse),
        "completion_response" => {
            let request_id = field_str("request_id").ok_or_else(|| UnrecognizedFrame {
                type_name: Some(type_name.clone()),
                detail: "completion_response missing request_id".into(),
            })?;
            let content = field_str("content").unwrap_or_default();
            Ok(WorkerFrame::CompletionResponse {
                request_id,
                content,
                tool_calls: field("tool_calls"),
                finish_reason: field_str("finish_reason"),
                error: field_str("error"),
            })
        }
        "client_log" => Ok(WorkerFrame::ClientLog {
            message: field_str("message").unwrap_or_default(),
        }),
        other => Err(UnrecognizedFrame {
            type_name: Some(other.to_string()),
            detail: format!("unrecognized frame type: {other}"),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct UnrecognizedFrame {
    pub type_name: Option<String>,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_register_frame() {
        let raw = r#"{"type":"register","worker_id":"w-1","user_agent":"ua"}"#;
        match parse_worker_frame(raw).unwrap() {
            WorkerFrame::Register {
                worker_id,
                user_agent,
                ..
            } => {
                assert_eq!(worker_id.as_deref(), Some("w-1"));
                assert_eq!(user_agent.as_deref(), Some("ua"));
            }
            _ => panic!("expected Register"),
        }
    }

    #[test]
    fn rejects_unknown_type_without_panicking() {
        let raw = r#"{"type":"frobnicate"}"#;
        let err = parse_worker_frame(raw).unwrap_err();
        assert_eq!(err.type_name.as_deref(), Some("frobnicate"));
    }

    #[test]
    fn completion_request_elides_absent_fields() {
        let frame = BrokerFrame::CompletionRequest {
            request_id: "r-1".into(),
            model: "gpt-4".into(),
            messages: vec![ForwardedMessage {
                role: MessageRole::User,
                content: "hi".into(),
            }],
            temperature: None,
            max_tokens: None,
            stream: false,
            tools: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
        assert!(!json.contains("tools"));
    }
}
