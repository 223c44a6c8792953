//! Injects a synthetic `ExitTool` into tool lists and intercepts `ExitTool`
//! calls in responses, converting them to plain text content. This lets
//! models that struggle with tool-required mode "escape" by calling ExitTool
//! with a plain text response.

use anyhow::Result;
use serde_json::{json, Map, Value};

use super::{choice_mut, delta_mut, message_mut};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

const EXIT_TOOL_NAME: &str = "ExitTool";

fn exit_tool_def() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": EXIT_TOOL_NAME,
            "description": "Use this when no other tool applies. The response argument is forwarded directly to the user.",
            "parameters": {
                "type": "object",
                "properties": {
                    "response": {"type": "string"},
                },
                "required": ["response"],
            },
        },
    })
}

#[derive(Default)]
pub struct ToolUseTransform;

impl Transformer for ToolUseTransform {
    fn name(&self) -> &'static str {
        "tooluse"
    }

    /// Append ExitTool to the tools array and force tool choice.
    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        let Some(tools) = req.get_mut("tools").and_then(Value::as_array_mut) else {
            return Ok(());
        };
        if tools.is_empty() {
            return Ok(());
        }
        tools.push(exit_tool_def());
        req.insert("tool_choice".to_string(), json!("required"));
        Ok(())
    }

    /// Convert an ExitTool call in a non-streaming response to plain content.
    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };

        let Some(msg) = message_mut(&mut parsed) else {
            return Ok(body);
        };
        let Some(first_call) = msg
            .get("tool_calls")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
        else {
            return Ok(body);
        };
        let fun = first_call.get("function");
        let name = fun
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name != EXIT_TOOL_NAME {
            return Ok(body);
        }

        let content = fun
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .map(extract_response_arg)
            .unwrap_or_default();

        msg.insert("content".to_string(), json!(content));
        msg.remove("tool_calls");
        if let Some(choice) = choice_mut(&mut parsed) {
            choice.insert("finish_reason".to_string(), json!("stop"));
        }

        Ok(serde_json::to_vec(&parsed).unwrap_or(body))
    }

    /// Intercept ExitTool in streaming: suppress its fragments and emit a
    /// single content chunk on finish.
    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };

        let finish = choice_mut(&mut parsed)
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !finish.is_empty() && ctx.exit_tool_index >= 0 {
            let content = extract_response_arg(&ctx.exit_tool_args);
            let emit = json!({
                "choices": [{
                    "delta": {"role": "assistant", "content": content},
                    "finish_reason": "stop",
                }],
            });
            return Ok(vec![serde_json::to_vec(&emit).unwrap_or_else(|_| data.to_vec())]);
        }

        let Some(tc) = delta_mut(&mut parsed)
            .and_then(|d| d.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
            .and_then(|arr| arr.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return Ok(vec![data.to_vec()]);
        };

        let idx = tc.get("index").and_then(Value::as_i64).unwrap_or(0);
        let fun = tc.get("function");

        // New ExitTool call: record its index and suppress.
        if fun.and_then(|f| f.get("name")).and_then(Value::as_str) == Some(EXIT_TOOL_NAME) {
            ctx.exit_tool_index = idx;
            return Ok(Vec::new());
        }

        // Fragments for the tracked index: accumulate arguments and suppress.
        if ctx.exit_tool_index >= 0 && idx == ctx.exit_tool_index {
            if let Some(args) = fun.and_then(|f| f.get("arguments")).and_then(Value::as_str) {
                ctx.exit_tool_args.push_str(args);
            }
            return Ok(Vec::new());
        }

        Ok(vec![data.to_vec()])
    }
}

/// Pull the `response` string out of accumulated ExitTool arguments.
fn extract_response_arg(args: &str) -> String {
    serde_json::from_str::<Value>(args)
        .ok()
        .and_then(|v| v.get("response").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransformContext {
        TransformContext::new("m", "p")
    }

    #[test]
    fn request_appends_exit_tool_and_requires_choice() {
        let mut req = json!({
            "tools": [{"type": "function", "function": {"name": "get_weather"}}],
        })
        .as_object()
        .cloned()
        .unwrap();
        ToolUseTransform
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        let tools = req["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[1]["function"]["name"], EXIT_TOOL_NAME);
        assert_eq!(req["tool_choice"], "required");
    }

    #[test]
    fn request_without_tools_is_untouched() {
        let mut req = json!({"model": "m"}).as_object().cloned().unwrap();
        ToolUseTransform
            .transform_request(&mut req, &mut ctx())
            .unwrap();
        assert!(req.get("tool_choice").is_none());
    }

    #[test]
    fn response_exit_tool_becomes_plain_content() {
        let body = serde_json::to_vec(&json!({
            "choices": [{
                "message": {"tool_calls": [{
                    "id": "call_1",
                    "function": {
                        "name": EXIT_TOOL_NAME,
                        "arguments": "{\"response\": \"Just text.\"}",
                    },
                }]},
                "finish_reason": "tool_calls",
            }],
        }))
        .unwrap();

        let out = ToolUseTransform.transform_response(body, &mut ctx()).unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let choice = &parsed["choices"][0];
        assert_eq!(choice["message"]["content"], "Just text.");
        assert!(choice["message"].get("tool_calls").is_none());
        assert_eq!(choice["finish_reason"], "stop");
    }

    #[test]
    fn response_other_tool_untouched() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {"tool_calls": [{
                "id": "call_1",
                "function": {"name": "get_weather", "arguments": "{}"},
            }]}}],
        }))
        .unwrap();

        let out = ToolUseTransform
            .transform_response(body.clone(), &mut ctx())
            .unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn stream_exit_tool_suppressed_then_replayed_on_finish() {
        let mut tr = ToolUseTransform;
        let mut c = ctx();

        let start = serde_json::to_vec(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": EXIT_TOOL_NAME}},
            ]}}],
        }))
        .unwrap();
        assert!(tr.transform_stream_chunk(&start, &mut c).unwrap().is_empty());
        assert_eq!(c.exit_tool_index, 0);

        for frag in ["{\"response\":", " \"hello\"}"] {
            let chunk = serde_json::to_vec(&json!({
                "choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": frag}},
                ]}}],
            }))
            .unwrap();
            assert!(tr.transform_stream_chunk(&chunk, &mut c).unwrap().is_empty());
        }

        let finish = serde_json::to_vec(&json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}],
        }))
        .unwrap();
        let out = tr.transform_stream_chunk(&finish, &mut c).unwrap();
        assert_eq!(out.len(), 1);

        let parsed: Value = serde_json::from_slice(&out[0]).unwrap();
        let choice = &parsed["choices"][0];
        assert_eq!(choice["delta"]["content"], "hello");
        assert_eq!(choice["delta"]["role"], "assistant");
        assert_eq!(choice["finish_reason"], "stop");
    }

    #[test]
    fn stream_other_tool_passes_through() {
        let mut tr = ToolUseTransform;
        let mut c = ctx();

        let chunk = serde_json::to_vec(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "get_weather"}},
            ]}}],
        }))
        .unwrap();
        let out = tr.transform_stream_chunk(&chunk, &mut c).unwrap();
        assert_eq!(out, vec![chunk]);
        assert_eq!(c.exit_tool_index, -1);
    }
}
