//! Repairs malformed tool call JSON arguments from LLMs. Streaming arguments
//! are buffered per tool call index and repaired in one piece on flush.

use anyhow::{Context, Result};
use serde_json::{json, Value};

use super::{choice_mut, delta_mut, message_mut};
use crate::translate::chain::Transformer;
use crate::translate::context::{ToolCallBuffer, TransformContext};
use crate::translate::jsonfix::fix_json;

/// Per-buffer cap; exceeding it triggers a pre-emptive flush to bound memory.
const MAX_TOOL_CALL_BUFFER_SIZE: usize = 1 << 20;

#[derive(Default)]
pub struct EnhanceToolTransform;

impl Transformer for EnhanceToolTransform {
    fn name(&self) -> &'static str {
        "enhancetool"
    }

    /// Repair tool call arguments in non-streaming responses.
    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        let Some(tool_calls) = message_mut(&mut parsed)
            .and_then(|m| m.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
        else {
            return Ok(body);
        };

        let mut changed = false;
        for tc in tool_calls {
            let Some(fun) = tc.get_mut("function").and_then(Value::as_object_mut) else {
                continue;
            };
            let Some(args) = fun.get("arguments").and_then(Value::as_str) else {
                continue;
            };
            let fixed = fix_json(args);
            if fixed != args {
                fun.insert("arguments".to_string(), json!(fixed));
                changed = true;
            }
        }

        if !changed {
            return Ok(body);
        }
        Ok(serde_json::to_vec(&parsed).unwrap_or(body))
    }

    /// Buffer tool call argument fragments and flush repaired arguments on finish.
    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };

        // finish_reason = "tool_calls": emit the repaired chunk before the finish chunk.
        let finish = choice_mut(&mut parsed)
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if finish.as_deref() == Some("tool_calls") {
            if ctx.tool_call_buffers.is_empty() {
                return Ok(vec![data.to_vec()]);
            }
            let repaired = flush_buffers(ctx)?;
            return Ok(vec![repaired, data.to_vec()]);
        }

        let Some(delta) = delta_mut(&mut parsed) else {
            return Ok(vec![data.to_vec()]);
        };
        let Some(tc) = delta
            .get_mut("tool_calls")
            .and_then(Value::as_array_mut)
            .and_then(|arr| arr.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return Ok(vec![data.to_vec()]);
        };

        let idx = tc.get("index").and_then(Value::as_i64).unwrap_or(0);

        // New tool call start: create a buffer, forward with arguments cleared.
        if let Some(id) = tc.get("id").and_then(Value::as_str).map(str::to_string) {
            let name = tc
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            ctx.tool_call_buffers.insert(
                idx,
                ToolCallBuffer {
                    id,
                    name,
                    arguments: String::new(),
                },
            );

            if let Some(fun) = tc.get_mut("function").and_then(Value::as_object_mut) {
                fun.insert("arguments".to_string(), json!(""));
            }
            return Ok(vec![serde_json::to_vec(&parsed).unwrap_or_else(|_| data.to_vec())]);
        }

        // Argument fragment for a known buffer: suppress and accumulate.
        if let Some(args) = tc
            .get("function")
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            let Some(buf) = ctx.tool_call_buffers.get_mut(&idx) else {
                return Ok(vec![data.to_vec()]);
            };
            buf.arguments.push_str(args);

            if buf.arguments.len() > MAX_TOOL_CALL_BUFFER_SIZE {
                let repaired = flush_buffers(ctx)?;
                return Ok(vec![repaired]);
            }

            return Ok(Vec::new());
        }

        Ok(vec![data.to_vec()])
    }
}

/// Build one chunk containing every buffered tool call with repaired
/// arguments, in ascending index order, then clear the buffers.
fn flush_buffers(ctx: &mut TransformContext) -> Result<Vec<u8>> {
    let tool_calls: Vec<Value> = ctx
        .tool_call_buffers
        .iter()
        .map(|(idx, buf)| {
            json!({
                "index": idx,
                "id": buf.id,
                "function": {
                    "name": buf.name,
                    "arguments": fix_json(&buf.arguments),
                },
            })
        })
        .collect();
    ctx.tool_call_buffers.clear();

    let chunk = json!({
        "choices": [{"delta": {"tool_calls": tool_calls}}],
    });
    serde_json::to_vec(&chunk).context("marshal repaired tool calls")
}
