//! OpenAI Chat Completions → Anthropic Messages response translation, plus
//! error formatting and classification shared by the proxy.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

// ============================================================================
// OpenAI response types (input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct OResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<OChoice>,
    #[serde(default)]
    usage: Option<OUsage>,
}

#[derive(Debug, Deserialize)]
struct OChoice {
    #[serde(default)]
    message: OMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OToolCall {
    #[serde(default)]
    id: String,
    #[serde(default)]
    function: OFunctionCall,
}

#[derive(Debug, Default, Deserialize)]
struct OFunctionCall {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

/// Token usage as reported by OpenAI-compatible backends.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

// ============================================================================
// Anthropic response types (output)
// ============================================================================

#[derive(Debug, Serialize)]
struct AResponse {
    id: String,
    #[serde(rename = "type")]
    response_type: &'static str,
    role: &'static str,
    content: Vec<AResponseBlock>,
    model: String,
    stop_reason: Option<&'static str>,
    stop_sequence: Option<String>,
    usage: AUsage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Default, Serialize)]
struct AUsage {
    input_tokens: u64,
    output_tokens: u64,
}

// ============================================================================
// Translation
// ============================================================================

fn tool_id_clean_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"))
}

/// Replace characters not allowed in Anthropic tool ids with `_`.
pub fn sanitize_tool_id(id: &str) -> String {
    tool_id_clean_re().replace_all(id, "_").into_owned()
}

/// Translate an OpenAI Chat Completion response to Anthropic Messages format.
/// `model_label` is the user-facing label, not the backend model name.
pub fn response_to_anthropic(body: &[u8], model_label: &str) -> Result<Vec<u8>> {
    let oresp: OResponse = serde_json::from_slice(body).context("parse openai response")?;

    let Some(choice) = oresp.choices.first() else {
        bail!("openai response has no choices");
    };

    let mut content = Vec::new();

    if let Some(text) = &choice.message.content {
        if !text.is_empty() {
            content.push(AResponseBlock::Text { text: text.clone() });
        }
    }

    for tc in choice.message.tool_calls.iter().flatten() {
        let input = if tc.function.arguments.is_empty() {
            json!({})
        } else {
            serde_json::from_str(&tc.function.arguments).unwrap_or_else(|_| json!({}))
        };
        content.push(AResponseBlock::ToolUse {
            id: sanitize_tool_id(&tc.id),
            name: tc.function.name.clone(),
            input,
        });
    }

    let aresp = AResponse {
        id: format!("msg_{}", oresp.id),
        response_type: "message",
        role: "assistant",
        content,
        model: model_label.to_string(),
        stop_reason: Some(map_finish_reason(
            choice.finish_reason.as_deref().unwrap_or_default(),
        )),
        stop_sequence: None,
        usage: oresp
            .usage
            .map(|u| AUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    };

    serde_json::to_vec(&aresp).context("serialize anthropic response")
}

pub(crate) fn map_finish_reason(fr: &str) -> &'static str {
    match fr {
        "tool_calls" => "tool_use",
        "length" => "max_tokens",
        _ => "end_turn",
    }
}

// ============================================================================
// Error formatting and classification
// ============================================================================

/// Categorize an error message for logging and user-facing text.
pub fn classify_error(msg: &str) -> &'static str {
    let msg = msg.to_lowercase();
    if ["connection refused", "no such host", "dns error", "dial"]
        .iter()
        .any(|s| msg.contains(s))
    {
        "CONNECTION"
    } else if ["deadline", "timed out", "timeout", "canceled"]
        .iter()
        .any(|s| msg.contains(s))
    {
        "TIMEOUT"
    } else {
        "INTERNAL"
    }
}

/// Categorize a reqwest error, preferring its own flags over string matching.
pub fn classify_reqwest_error(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "TIMEOUT"
    } else if err.is_connect() {
        "CONNECTION"
    } else {
        classify_error(&err.to_string())
    }
}

/// Anthropic-format error response body.
pub fn format_error(err_type: &str, message: &str) -> Vec<u8> {
    let body = json!({
        "type": "error",
        "error": {"type": err_type, "message": message},
    });
    serde_json::to_vec(&body).unwrap_or_default()
}

/// SSE events for a mid-stream error: an `error` event followed by `message_stop`.
pub fn format_stream_error(err_type: &str, message: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"event: error\ndata: ");
    out.extend_from_slice(&format_error(err_type, message));
    out.extend_from_slice(b"\n\n");
    out.extend_from_slice(b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_response() {
        let body = serde_json::to_vec(&json!({
            "id": "chatcmpl-123",
            "model": "gpt-4",
            "choices": [{
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15},
        }))
        .unwrap();

        let out = response_to_anthropic(&body, "my_label").unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(parsed["id"], "msg_chatcmpl-123");
        assert_eq!(parsed["type"], "message");
        assert_eq!(parsed["role"], "assistant");
        assert_eq!(parsed["model"], "my_label");
        assert_eq!(parsed["content"][0]["type"], "text");
        assert_eq!(parsed["content"][0]["text"], "Hello!");
        assert_eq!(parsed["stop_reason"], "end_turn");
        assert_eq!(parsed["usage"]["input_tokens"], 10);
        assert_eq!(parsed["usage"]["output_tokens"], 5);
    }

    #[test]
    fn tool_call_response() {
        let body = serde_json::to_vec(&json!({
            "id": "chatcmpl-1",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "toolu_123",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        }))
        .unwrap();

        let out = response_to_anthropic(&body, "label").unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(parsed["stop_reason"], "tool_use");
        let block = &parsed["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["id"], "toolu_123");
        assert_eq!(block["name"], "get_weather");
        assert_eq!(block["input"]["city"], "SF");
    }

    #[test]
    fn invalid_tool_arguments_become_empty_input() {
        let body = serde_json::to_vec(&json!({
            "id": "x",
            "choices": [{
                "message": {"tool_calls": [{
                    "id": "t1",
                    "function": {"name": "f", "arguments": "{broken"},
                }]},
                "finish_reason": "tool_calls",
            }],
        }))
        .unwrap();

        let out = response_to_anthropic(&body, "label").unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["content"][0]["input"], json!({}));
    }

    #[test]
    fn no_choices_is_an_error() {
        let body = serde_json::to_vec(&json!({"id": "x", "choices": []})).unwrap();
        assert!(response_to_anthropic(&body, "label").is_err());
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("content_filter"), "end_turn");
        assert_eq!(map_finish_reason(""), "end_turn");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for id in ["call_abc", "func:call.123", "a b/c", ""] {
            let once = sanitize_tool_id(id);
            assert_eq!(sanitize_tool_id(&once), once);
        }
        assert_eq!(sanitize_tool_id("func:call.123"), "func_call_123");
    }

    #[test]
    fn classify_error_categories() {
        assert_eq!(classify_error("connect: connection refused"), "CONNECTION");
        assert_eq!(classify_error("lookup x: no such host"), "CONNECTION");
        assert_eq!(classify_error("dns error: failed"), "CONNECTION");
        assert_eq!(classify_error("deadline has elapsed"), "TIMEOUT");
        assert_eq!(classify_error("operation timed out"), "TIMEOUT");
        assert_eq!(classify_error("request canceled"), "TIMEOUT");
        assert_eq!(classify_error("something else"), "INTERNAL");
    }

    #[test]
    fn format_error_shape() {
        let body = format_error("api_error", "boom");
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["error"]["type"], "api_error");
        assert_eq!(parsed["error"]["message"], "boom");
    }

    #[test]
    fn format_stream_error_emits_error_then_stop() {
        let out = String::from_utf8(format_stream_error("api_error", "boom")).unwrap();
        let error_pos = out.find("event: error").unwrap();
        let stop_pos = out.find("event: message_stop").unwrap();
        assert!(error_pos < stop_pos);
        assert!(out.contains("boom"));
    }
}
