//! Anthropic Messages → OpenAI Chat Completions request translation.
//!
//! # Key differences
//!
//! | Anthropic                       | OpenAI                            |
//! |---------------------------------|-----------------------------------|
//! | Top-level `system` field        | `messages[].role: "system"`       |
//! | `tool_use` content blocks       | `tool_calls` on assistant message |
//! | `tool_result` content blocks    | separate `role: "tool"` messages  |
//! | `stop_sequences` (array)        | `stop`                            |
//! | `tool_choice {type: "any"}`     | `tool_choice: "required"`         |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ============================================================================
// Anthropic request types (input)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AnthropicRequest {
    #[serde(default)]
    #[allow(dead_code)]
    model: String,
    #[serde(default)]
    system: Option<Value>,
    #[serde(default)]
    messages: Vec<AnthropicMessage>,
    #[serde(default)]
    max_tokens: u64,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    top_p: Option<f64>,
    #[serde(default)]
    stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    tools: Vec<AnthropicTool>,
    #[serde(default)]
    tool_choice: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: Value,
}

/// One Anthropic content block; fields are populated per block type.
#[derive(Debug, Default, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
}

// ============================================================================
// OpenAI request types (output)
// ============================================================================

#[derive(Debug, Serialize)]
struct ORequest {
    model: String,
    messages: Vec<OMessage>,
    #[serde(skip_serializing_if = "is_zero")]
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Default, Serialize)]
struct OMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OFunctionCall,
}

#[derive(Debug, Serialize)]
struct OFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OFunction,
}

#[derive(Debug, Serialize)]
struct OFunction {
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    description: String,
    parameters: Value,
}

// ============================================================================
// Translation
// ============================================================================

/// Translate an Anthropic Messages request body into an OpenAI Chat
/// Completions request. `max_tokens_cap` limits `max_tokens` when positive.
///
/// Returns the request as a JSON object so the transform chain can mutate it
/// before serialization. Schema cleaning is left to the transform chain.
pub fn request_to_openai(
    body: &[u8],
    backend_model: &str,
    max_tokens_cap: u64,
) -> Result<Map<String, Value>> {
    let req: AnthropicRequest =
        serde_json::from_slice(body).context("parse anthropic request")?;

    let mut max_tokens = req.max_tokens;
    if max_tokens_cap > 0 && max_tokens > max_tokens_cap {
        max_tokens = max_tokens_cap;
    }

    let mut messages = Vec::new();

    let system_text = req.system.as_ref().map(extract_system_text).unwrap_or_default();
    if !system_text.is_empty() {
        messages.push(OMessage {
            role: "system".to_string(),
            content: Some(system_text),
            ..Default::default()
        });
    }

    for msg in &req.messages {
        messages.extend(translate_message(msg)?);
    }

    let tools = req
        .tools
        .into_iter()
        .map(|tool| OTool {
            tool_type: "function",
            function: OFunction {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            },
        })
        .collect();

    let oreq = ORequest {
        model: backend_model.to_string(),
        messages,
        max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences,
        stream: req.stream,
        tools,
        tool_choice: req.tool_choice.as_ref().map(translate_tool_choice),
    };

    let value = serde_json::to_value(&oreq).context("serialize openai request")?;
    let Value::Object(mut map) = value else {
        anyhow::bail!("openai request did not serialize to an object");
    };

    if req.stream {
        // Ask the backend for a final usage chunk.
        map.insert("stream_options".to_string(), json!({"include_usage": true}));
    }

    Ok(map)
}

/// System can be a plain string or an array of text blocks.
fn extract_system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(_) => {
            let Ok(blocks) = serde_json::from_value::<Vec<ContentBlock>>(system.clone()) else {
                return String::new();
            };
            blocks
                .iter()
                .filter(|b| b.block_type == "text" && !b.text.is_empty())
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        }
        _ => String::new(),
    }
}

/// One Anthropic message may expand to several OpenAI messages (tool_result
/// blocks become separate `role: "tool"` messages).
fn translate_message(msg: &AnthropicMessage) -> Result<Vec<OMessage>> {
    if let Value::String(s) = &msg.content {
        return Ok(vec![OMessage {
            role: msg.role.clone(),
            content: non_empty(s.clone()),
            ..Default::default()
        }]);
    }

    let blocks: Vec<ContentBlock> =
        serde_json::from_value(msg.content.clone()).context("parse message content")?;

    if msg.role == "assistant" {
        translate_assistant_blocks(&blocks)
    } else {
        translate_user_blocks(&blocks)
    }
}

fn translate_assistant_blocks(blocks: &[ContentBlock]) -> Result<Vec<OMessage>> {
    let mut text_parts = Vec::new();
    let mut tool_calls = Vec::new();

    for b in blocks {
        match b.block_type.as_str() {
            "text" => {
                if !b.text.is_empty() {
                    text_parts.push(b.text.as_str());
                }
            }
            "tool_use" => {
                let arguments = match &b.input {
                    None | Some(Value::Null) => "{}".to_string(),
                    Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()),
                };
                tool_calls.push(OToolCall {
                    id: b.id.clone(),
                    call_type: "function",
                    function: OFunctionCall {
                        name: b.name.clone(),
                        arguments,
                    },
                });
            }
            _ => {}
        }
    }

    Ok(vec![OMessage {
        role: "assistant".to_string(),
        content: non_empty(text_parts.join("\n")),
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        ..Default::default()
    }])
}

fn translate_user_blocks(blocks: &[ContentBlock]) -> Result<Vec<OMessage>> {
    let mut msgs = Vec::new();
    let mut text_parts: Vec<&str> = Vec::new();

    for b in blocks {
        match b.block_type.as_str() {
            "text" => text_parts.push(&b.text),
            "tool_result" => {
                // Flush accumulated text first so ordering is preserved.
                if !text_parts.is_empty() {
                    msgs.push(OMessage {
                        role: "user".to_string(),
                        content: non_empty(text_parts.join("\n")),
                        ..Default::default()
                    });
                    text_parts.clear();
                }
                msgs.push(OMessage {
                    role: "tool".to_string(),
                    content: non_empty(extract_tool_result_content(b)),
                    tool_call_id: Some(b.tool_use_id.clone()),
                    ..Default::default()
                });
            }
            _ => {}
        }
    }

    if !text_parts.is_empty() {
        msgs.push(OMessage {
            role: "user".to_string(),
            content: non_empty(text_parts.join("\n")),
            ..Default::default()
        });
    }

    Ok(msgs)
}

/// Tool result content is a string, an array of text blocks, or arbitrary JSON.
fn extract_tool_result_content(b: &ContentBlock) -> String {
    let Some(content) = &b.content else {
        return String::new();
    };
    match content {
        Value::String(s) => s.clone(),
        Value::Array(_) => match serde_json::from_value::<Vec<ContentBlock>>(content.clone()) {
            Ok(blocks) => blocks
                .iter()
                .filter(|cb| cb.block_type == "text")
                .map(|cb| cb.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Err(_) => content.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn translate_tool_choice(tc: &Value) -> Value {
    match tc.get("type").and_then(Value::as_str) {
        Some("any") => json!("required"),
        Some("tool") => json!({
            "type": "function",
            "function": {"name": tc.get("name").and_then(Value::as_str).unwrap_or_default()},
        }),
        _ => json!("auto"),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
