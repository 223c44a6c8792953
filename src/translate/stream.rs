//! OpenAI SSE → Anthropic SSE stream translation.
//!
//! A state machine drives the six Anthropic event types:
//!
//! | OpenAI                          | Anthropic                            |
//! |---------------------------------|--------------------------------------|
//! | first chunk                     | `message_start`                      |
//! | `delta.content`                 | `content_block_delta` (text_delta)   |
//! | `delta.tool_calls[].id`         | `content_block_start` (tool_use)     |
//! | `delta.tool_calls[].arguments`  | `content_block_delta` (input_json)   |
//! | stream end / `[DONE]`           | `message_delta` + `message_stop`     |
//!
//! Up to 2 consecutive malformed SSE payloads are dropped; 3 in a row aborts
//! the stream with an error.

use anyhow::{bail, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::chain::TransformChain;
use super::context::TransformContext;
use super::response::{map_finish_reason, sanitize_tool_id, OUsage};

// ============================================================================
// OpenAI streaming chunk types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct OStreamChunk {
    #[serde(default)]
    id: String,
    #[serde(default)]
    choices: Vec<OStreamChoice>,
    #[serde(default)]
    usage: Option<OUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct OStreamChoice {
    #[serde(default)]
    delta: OStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OStreamToolCall>>,
}

#[derive(Debug, Default, Deserialize)]
struct OStreamToolCall {
    #[serde(default)]
    index: i64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: OStreamFuncDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OStreamFuncDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug)]
#[allow(dead_code)]
struct ActiveToolCall {
    id: String,
    name: String,
}

// ============================================================================
// Stream translator
// ============================================================================

/// Converts an OpenAI SSE stream into Anthropic SSE events, one streaming
/// response per instance.
pub struct StreamTranslator {
    model_label: String,
    msg_id: String,
    block_index: u64,
    in_text_block: bool,
    in_tool_block: bool,
    started: bool,
    finish_reason: String,
    usage: Option<OUsage>,
    /// Tool calls seen so far, keyed by the backend-supplied index.
    active_tool_calls: HashMap<i64, ActiveToolCall>,
    chain: Option<TransformChain>,
    ctx: Option<TransformContext>,
    verbose: bool,
    consecutive_drops: u32,
}

impl StreamTranslator {
    pub fn new(model_label: &str) -> Self {
        Self {
            model_label: model_label.to_string(),
            msg_id: "msg_stream".to_string(),
            block_index: 0,
            in_text_block: false,
            in_tool_block: false,
            started: false,
            finish_reason: String::new(),
            usage: None,
            active_tool_calls: HashMap::new(),
            chain: None,
            ctx: None,
            verbose: false,
            consecutive_drops: 0,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Attach a transform chain; every chunk runs through it (in reverse
    /// chain order) before entering the state machine.
    pub fn set_transform_chain(&mut self, chain: TransformChain, ctx: TransformContext) {
        self.chain = Some(chain);
        self.ctx = Some(ctx);
    }

    /// Read an OpenAI SSE byte stream and append Anthropic SSE events to `out`.
    ///
    /// On error, whatever was already translated remains in `out` so the
    /// caller can append a stream error and close cleanly.
    pub async fn translate_stream<S, E>(&mut self, mut stream: S, out: &mut Vec<u8>) -> Result<()>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut line_buf = String::new();
        let mut done = false;

        'read: while let Some(item) = stream.next().await {
            let bytes = item?;
            line_buf.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                if self.process_line(line.trim_end_matches(['\r', '\n']), out)? {
                    done = true;
                    break 'read;
                }
            }
        }

        if !done && !line_buf.is_empty() {
            let line = std::mem::take(&mut line_buf);
            self.process_line(line.trim_end_matches(['\r', '\n']), out)?;
        }

        self.close_current_block(out);
        self.emit_message_delta(out);
        emit_event(out, "message_stop", &json!({"type": "message_stop"}));

        Ok(())
    }

    /// Handle one SSE line. Returns true on the `[DONE]` sentinel.
    fn process_line(&mut self, line: &str, out: &mut Vec<u8>) -> Result<bool> {
        let Some(data) = line.strip_prefix("data: ") else {
            return Ok(false);
        };
        if data == "[DONE]" {
            return Ok(true);
        }

        let chunk = match serde_json::from_str::<OStreamChunk>(data) {
            Ok(chunk) => chunk,
            Err(_) => {
                self.record_drop("dropped unparseable SSE chunk", data)?;
                return Ok(false);
            }
        };
        self.consecutive_drops = 0;

        if self.chain.is_some() {
            let transformed = match (self.chain.as_mut(), self.ctx.as_mut()) {
                (Some(chain), Some(ctx)) => chain.run_stream_chunk(data.as_bytes(), ctx),
                _ => return Ok(false),
            };
            let chunks = match transformed {
                Ok(chunks) => chunks,
                Err(err) => {
                    self.record_drop("stream transform error", &err.to_string())?;
                    return Ok(false);
                }
            };
            self.consecutive_drops = 0;

            for tc in chunks {
                match serde_json::from_slice::<OStreamChunk>(&tc) {
                    Ok(chunk) => {
                        self.consecutive_drops = 0;
                        self.process_chunk(&chunk, out);
                    }
                    Err(_) => {
                        self.record_drop("dropped unparseable transformed chunk", "")?;
                    }
                }
            }
            return Ok(false);
        }

        self.process_chunk(&chunk, out);
        Ok(false)
    }

    fn record_drop(&mut self, what: &str, detail: &str) -> Result<()> {
        self.consecutive_drops += 1;
        if self.verbose {
            let detail: String = detail.chars().take(200).collect();
            tracing::warn!("[LOCAL_ERR:PARSE] {what}: {detail}");
        }
        if self.consecutive_drops >= 3 {
            bail!("too many consecutive unparseable chunks ({})", self.consecutive_drops);
        }
        Ok(())
    }

    fn process_chunk(&mut self, chunk: &OStreamChunk, out: &mut Vec<u8>) {
        if !self.started && !chunk.id.is_empty() {
            self.msg_id = format!("msg_{}", chunk.id);
        }

        // Usage arrives on a dedicated chunk when stream_options is set.
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.first() else {
            return;
        };

        if !self.started {
            self.started = true;
            self.emit_message_start(out);
        }

        if let Some(fr) = &choice.finish_reason {
            self.finish_reason = fr.clone();
        }

        if let Some(content) = &choice.delta.content {
            if !content.is_empty() {
                if !self.in_text_block {
                    self.close_current_block(out);
                    self.emit_text_block_start(out);
                    self.in_text_block = true;
                }
                emit_event(
                    out,
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": content},
                    }),
                );
            }
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            // New tool call: chunk bearing an id opens a tool_use block.
            if let Some(id) = tc.id.as_deref().filter(|id| !id.is_empty()) {
                let name = tc.function.name.clone().unwrap_or_default();
                self.active_tool_calls.insert(
                    tc.index,
                    ActiveToolCall {
                        id: id.to_string(),
                        name: name.clone(),
                    },
                );
                self.close_current_block(out);
                emit_event(
                    out,
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": sanitize_tool_id(id),
                            "name": name,
                            "input": {},
                        },
                    }),
                );
                self.in_tool_block = true;
            }

            if let Some(args) = tc.function.arguments.as_deref().filter(|a| !a.is_empty()) {
                emit_event(
                    out,
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "input_json_delta", "partial_json": args},
                    }),
                );
            }
        }
    }

    fn close_current_block(&mut self, out: &mut Vec<u8>) {
        if self.in_text_block || self.in_tool_block {
            emit_event(
                out,
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": self.block_index}),
            );
            self.block_index += 1;
            self.in_text_block = false;
            self.in_tool_block = false;
        }
    }

    fn emit_message_start(&self, out: &mut Vec<u8>) {
        let input_tokens = self.usage.map(|u| u.prompt_tokens).unwrap_or(0);
        emit_event(
            out,
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.msg_id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model_label,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": input_tokens, "output_tokens": 0},
                },
            }),
        );
    }

    fn emit_text_block_start(&self, out: &mut Vec<u8>) {
        emit_event(
            out,
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": {"type": "text", "text": ""},
            }),
        );
    }

    fn emit_message_delta(&self, out: &mut Vec<u8>) {
        let output_tokens = self.usage.map(|u| u.completion_tokens).unwrap_or(0);
        emit_event(
            out,
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": map_finish_reason(&self.finish_reason),
                    "stop_sequence": null,
                },
                "usage": {"output_tokens": output_tokens},
            }),
        );
    }
}

fn emit_event(out: &mut Vec<u8>, event: &str, data: &Value) {
    if let Ok(json) = serde_json::to_string(data) {
        out.extend_from_slice(format!("event: {event}\ndata: {json}\n\n").as_bytes());
    }
}
