//! OpenRouter quirk normalizer: numeric tool ids, `reasoning` field naming,
//! cache_control for non-Claude models, index bumping, and finish_reason
//! correction on usage chunks.

use anyhow::Result;
use serde_json::{Map, Value};

use super::{bump_choice_index, choice_mut, fix_numeric_tool_id, message_mut, strip_cache_control};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct OpenRouterTransform {
    /// Whether any tool call was seen in the stream.
    has_tool_call: bool,
}

impl Transformer for OpenRouterTransform {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    /// Strip cache_control for non-Claude models (Claude on OpenRouter
    /// understands it natively).
    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        ctx: &mut TransformContext,
    ) -> Result<()> {
        if ctx.model_name.to_lowercase().contains("claude") {
            return Ok(());
        }
        strip_cache_control(req);
        Ok(())
    }

    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        let Some(msg) = message_mut(&mut parsed) else {
            return Ok(body);
        };

        let mut changed = false;

        if let Some(tool_calls) = msg.get_mut("tool_calls").and_then(Value::as_array_mut) {
            for tc in tool_calls {
                if let Some(tc) = tc.as_object_mut() {
                    if fix_numeric_tool_id(tc) {
                        changed = true;
                    }
                }
            }
        }

        if let Some(v) = msg.remove("reasoning") {
            msg.insert("reasoning_content".to_string(), v);
            changed = true;
        }

        if !changed {
            return Ok(body);
        }
        Ok(serde_json::to_vec(&parsed).unwrap_or(body))
    }

    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };
        if choice_mut(&mut parsed).is_none() {
            return Ok(vec![data.to_vec()]);
        }

        let mut changed = false;
        let mut saw_tool_calls = false;

        if let Some(delta) = parsed
            .get_mut("choices")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.get_mut("delta"))
            .and_then(Value::as_object_mut)
        {
            if let Some(tool_calls) = delta.get_mut("tool_calls").and_then(Value::as_array_mut) {
                saw_tool_calls = true;
                self.has_tool_call = true;
                for tc in tool_calls {
                    if let Some(tc) = tc.as_object_mut() {
                        if fix_numeric_tool_id(tc) {
                            changed = true;
                        }
                    }
                }
            }

            if let Some(v) = delta.remove("reasoning") {
                delta.insert("reasoning_content".to_string(), v);
                changed = true;
            }
        }

        // Known quirk carried over from the provider's observed behavior:
        // the bump applies to every tool-call chunk once text content has
        // been seen, including later argument fragments of the same call,
        // so one call's chunks can be bumped repeatedly.
        if saw_tool_calls && ctx.has_text_content && bump_choice_index(&mut parsed) {
            changed = true;
        }

        // OpenRouter sometimes reports "stop" on the usage chunk even when
        // tool calls happened.
        if parsed.get("usage").is_some() {
            if let Some(choice) = choice_mut(&mut parsed) {
                let needs_fix = choice
                    .get("finish_reason")
                    .and_then(Value::as_str)
                    .is_some_and(|fr| self.has_tool_call && fr != "tool_calls");
                if needs_fix {
                    choice.insert("finish_reason".to_string(), Value::from("tool_calls"));
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok(vec![data.to_vec()]);
        }
        Ok(vec![serde_json::to_vec(&parsed).unwrap_or_else(|_| data.to_vec())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_for(model: &str) -> TransformContext {
        TransformContext::new(model, "openrouter")
    }

    #[test]
    fn request_strips_cache_control_for_non_claude() {
        let mut req = json!({
            "messages": [{"role": "user", "content": "hi", "cache_control": {}}],
        })
        .as_object()
        .cloned()
        .unwrap();
        OpenRouterTransform::default()
            .transform_request(&mut req, &mut ctx_for("qwen/qwen3-coder"))
            .unwrap();
        assert!(req["messages"][0].get("cache_control").is_none());
    }

    #[test]
    fn request_keeps_cache_control_for_claude() {
        let mut req = json!({
            "messages": [{"role": "user", "content": "hi", "cache_control": {}}],
        })
        .as_object()
        .cloned()
        .unwrap();
        OpenRouterTransform::default()
            .transform_request(&mut req, &mut ctx_for("anthropic/claude-sonnet-4"))
            .unwrap();
        assert!(req["messages"][0].get("cache_control").is_some());
    }

    #[test]
    fn response_fixes_numeric_ids_and_renames_reasoning() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {
                "reasoning": "thought",
                "tool_calls": [{"id": "0", "function": {"name": "f", "arguments": "{}"}}],
            }}],
        }))
        .unwrap();

        let out = OpenRouterTransform::default()
            .transform_response(body, &mut ctx_for("m"))
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let msg = &parsed["choices"][0]["message"];
        assert!(msg["tool_calls"][0]["id"].as_str().unwrap().starts_with("call_"));
        assert_eq!(msg["reasoning_content"], "thought");
        assert!(msg.get("reasoning").is_none());
    }

    #[test]
    fn stream_renames_reasoning_delta() {
        let data = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"reasoning": "hmm"}}],
        }))
        .unwrap();
        let out = OpenRouterTransform::default()
            .transform_stream_chunk(&data, &mut ctx_for("m"))
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out[0]).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["reasoning_content"], "hmm");
    }

    #[test]
    fn stream_bumps_index_after_text_content() {
        let mut tr = OpenRouterTransform::default();
        let mut ctx = ctx_for("m");
        ctx.has_text_content = true;

        let data = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_x", "function": {"name": "f"}},
            ]}}],
        }))
        .unwrap();
        let out = tr.transform_stream_chunk(&data, &mut ctx).unwrap();
        let parsed: Value = serde_json::from_slice(&out[0]).unwrap();
        assert_eq!(parsed["choices"][0]["index"], 1);
    }

    #[test]
    fn stream_corrects_finish_reason_on_usage_chunk() {
        let mut tr = OpenRouterTransform::default();
        let mut ctx = ctx_for("m");

        let tool_chunk = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_x", "function": {"name": "f"}},
            ]}}],
        }))
        .unwrap();
        tr.transform_stream_chunk(&tool_chunk, &mut ctx).unwrap();

        let usage_chunk = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2},
        }))
        .unwrap();
        let out = tr.transform_stream_chunk(&usage_chunk, &mut ctx).unwrap();
        let parsed: Value = serde_json::from_slice(&out[0]).unwrap();
        assert_eq!(parsed["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn stream_leaves_stop_without_tool_calls() {
        let mut tr = OpenRouterTransform::default();
        let mut ctx = ctx_for("m");

        let usage_chunk = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2},
        }))
        .unwrap();
        let out = tr.transform_stream_chunk(&usage_chunk, &mut ctx).unwrap();
        assert_eq!(out, vec![usage_chunk]);
    }
}
