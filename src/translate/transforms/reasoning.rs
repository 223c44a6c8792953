//! Maps backends that expose a `reasoning_content` field (DeepSeek R1, Qwen
//! QwQ, and friends) into Anthropic-style thinking blocks.

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

use super::{bump_choice_index, delta_mut, message_mut, thinking_close_chunk};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct ReasoningTransform;

impl Transformer for ReasoningTransform {
    fn name(&self) -> &'static str {
        "reasoning"
    }

    /// `reasoning.max_tokens` → `thinking.budget_tokens`.
    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        let Some(max_tokens) = req
            .get("reasoning")
            .and_then(|r| r.get("max_tokens"))
            .cloned()
        else {
            return Ok(());
        };
        req.insert(
            "thinking".to_string(),
            json!({"type": "enabled", "budget_tokens": max_tokens}),
        );
        req.remove("reasoning");
        Ok(())
    }

    /// Move `message.reasoning_content` to `message.thinking` in non-streaming responses.
    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(&body) else {
            return Ok(body);
        };
        let Some(msg) = message_mut(&mut parsed) else {
            return Ok(body);
        };
        let Some(rc) = msg.get("reasoning_content").and_then(Value::as_str) else {
            return Ok(body);
        };
        let rc = rc.to_string();
        msg.insert("thinking".to_string(), json!({"content": rc}));
        msg.remove("reasoning_content");

        match serde_json::to_vec(&parsed) {
            Ok(out) => Ok(out),
            Err(_) => Ok(body),
        }
    }

    /// Rewrite reasoning deltas to thinking deltas; at the reasoning→content
    /// boundary emit a thinking-close chunk and bump the content chunk index.
    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };
        let Some(delta) = delta_mut(&mut parsed) else {
            return Ok(vec![data.to_vec()]);
        };

        // Reasoning delta: rewrite and accumulate.
        if let Some(rc) = delta.get("reasoning_content").and_then(Value::as_str) {
            let rc = rc.to_string();
            delta.insert("thinking".to_string(), json!({"content": rc}));
            delta.remove("reasoning_content");
            ctx.reasoning_content.push_str(&rc);

            let out = serde_json::to_vec(&parsed).context("marshal reasoning chunk")?;
            return Ok(vec![out]);
        }

        if delta.contains_key("content") {
            // First content delta after accumulated reasoning.
            if !ctx.reasoning_content.is_empty() && !ctx.reasoning_complete {
                ctx.reasoning_complete = true;
                ctx.has_text_content = true;

                let close_chunk = thinking_close_chunk()?;
                bump_choice_index(&mut parsed);
                let content_chunk = serde_json::to_vec(&parsed).context("marshal content chunk")?;
                return Ok(vec![close_chunk, content_chunk]);
            }

            // Content with no prior reasoning.
            ctx.has_text_content = true;
            return Ok(vec![data.to_vec()]);
        }

        Ok(vec![data.to_vec()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransformContext {
        TransformContext::new("deepseek-r1", "deepseek")
    }

    #[test]
    fn request_maps_reasoning_to_thinking() {
        let mut req = json!({"model": "m", "reasoning": {"max_tokens": 8000}})
            .as_object()
            .cloned()
            .unwrap();
        ReasoningTransform
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        assert!(req.get("reasoning").is_none());
        assert_eq!(req["thinking"]["type"], "enabled");
        assert_eq!(req["thinking"]["budget_tokens"], 8000);
    }

    #[test]
    fn response_moves_reasoning_content_to_thinking() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {"content": "4", "reasoning_content": "2+2"}}],
        }))
        .unwrap();

        let out = ReasoningTransform
            .transform_response(body, &mut ctx())
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let msg = &parsed["choices"][0]["message"];

        assert_eq!(msg["thinking"]["content"], "2+2");
        assert!(msg.get("reasoning_content").is_none());
        assert_eq!(msg["content"], "4");
    }

    #[test]
    fn stream_rewrites_reasoning_delta() {
        let data = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"reasoning_content": "hmm"}}],
        }))
        .unwrap();
        let mut c = ctx();

        let chunks = ReasoningTransform
            .transform_stream_chunk(&data, &mut c)
            .unwrap();
        assert_eq!(chunks.len(), 1);

        let parsed: Value = serde_json::from_slice(&chunks[0]).unwrap();
        let delta = &parsed["choices"][0]["delta"];
        assert_eq!(delta["thinking"]["content"], "hmm");
        assert!(delta.get("reasoning_content").is_none());
        assert_eq!(c.reasoning_content, "hmm");
    }

    #[test]
    fn stream_emits_close_then_content_at_boundary() {
        let mut c = ctx();

        let reasoning = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"reasoning_content": "step 1"}}],
        }))
        .unwrap();
        ReasoningTransform
            .transform_stream_chunk(&reasoning, &mut c)
            .unwrap();

        let content = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "answer"}}],
        }))
        .unwrap();
        let chunks = ReasoningTransform
            .transform_stream_chunk(&content, &mut c)
            .unwrap();
        assert_eq!(chunks.len(), 2);

        let close: Value = serde_json::from_slice(&chunks[0]).unwrap();
        let sig = close["choices"][0]["delta"]["thinking"]["signature"]
            .as_str()
            .unwrap();
        assert!(sig.starts_with('<') && sig.ends_with('>'));

        let content: Value = serde_json::from_slice(&chunks[1]).unwrap();
        assert_eq!(content["choices"][0]["index"], 1);
        assert_eq!(content["choices"][0]["delta"]["content"], "answer");
        assert!(c.reasoning_complete);
    }

    #[test]
    fn stream_boundary_fires_once() {
        let mut c = ctx();
        c.reasoning_content.push_str("earlier");
        c.reasoning_complete = true;

        let content = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "more"}}],
        }))
        .unwrap();
        let chunks = ReasoningTransform
            .transform_stream_chunk(&content, &mut c)
            .unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn stream_content_without_reasoning_passes_through() {
        let data = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "plain"}}],
        }))
        .unwrap();
        let mut c = ctx();

        let chunks = ReasoningTransform
            .transform_stream_chunk(&data, &mut c)
            .unwrap();
        assert_eq!(chunks, vec![data]);
        assert!(c.has_text_content);
    }
}
