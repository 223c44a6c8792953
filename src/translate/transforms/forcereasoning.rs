//! Forces reasoning out of models that have no native thinking channel: the
//! request side injects an instruction to think inside
//! `<reasoning_content>` tags, and the response side extracts those tags
//! into Anthropic-style thinking blocks.

use anyhow::Result;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

use super::thinktag::{extract_tagged_response, TagExtractor};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

const OPEN_TAG: &str = "<reasoning_content>";
const CLOSE_TAG: &str = "</reasoning_content>";

pub(crate) const REASONING_PROMPT: &str = "\n\nAlways think step by step before answering. Output your thinking process inside <reasoning_content>...</reasoning_content> tags, then provide your final answer after the closing tag.";

fn reasoning_content_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<reasoning_content>(.*?)</reasoning_content>").expect("static regex")
    })
}

pub struct ForceReasoningTransform {
    extractor: TagExtractor,
}

impl ForceReasoningTransform {
    pub fn new() -> Self {
        Self {
            extractor: TagExtractor::new(OPEN_TAG, CLOSE_TAG),
        }
    }
}

impl Default for ForceReasoningTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for ForceReasoningTransform {
    fn name(&self) -> &'static str {
        "forcereasoning"
    }

    /// Re-inject prior assistant thinking as tagged text, then append the
    /// reasoning instruction to the last user message (or add one when the
    /// conversation ends on a tool result).
    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        let Some(msgs) = req.get_mut("messages").and_then(Value::as_array_mut) else {
            return Ok(());
        };
        if msgs.is_empty() {
            return Ok(());
        }

        for m in msgs.iter_mut() {
            let Some(msg) = m.as_object_mut() else {
                continue;
            };
            if msg.get("role").and_then(Value::as_str) != Some("assistant") {
                continue;
            }
            let Some(thinking) = msg.get("thinking").and_then(Value::as_str).map(str::to_string)
            else {
                continue;
            };
            let content = msg
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            msg.insert(
                "content".to_string(),
                json!(format!("{OPEN_TAG}{thinking}{CLOSE_TAG}\n{content}")),
            );
            msg.remove("thinking");
        }

        let append_new = match msgs.last_mut().and_then(Value::as_object_mut) {
            Some(last) if last.get("role").and_then(Value::as_str) == Some("user") => {
                match last.get_mut("content") {
                    Some(Value::String(s)) => s.push_str(REASONING_PROMPT),
                    Some(Value::Array(parts)) => {
                        parts.push(json!({"type": "text", "text": REASONING_PROMPT}));
                    }
                    _ => {}
                }
                false
            }
            _ => true,
        };
        if append_new {
            msgs.push(json!({"role": "user", "content": REASONING_PROMPT}));
        }

        Ok(())
    }

    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        Ok(extract_tagged_response(body, reasoning_content_re()))
    }

    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        self.extractor.process_chunk(data, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TransformContext {
        TransformContext::new("gpt-4", "openai")
    }

    fn req_with_messages(messages: Value) -> Map<String, Value> {
        json!({"model": "gpt-4", "messages": messages})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn prompt_appended_to_last_user_message() {
        let mut req = req_with_messages(json!([
            {"role": "system", "content": "You are helpful."},
            {"role": "user", "content": "What is 2+2?"},
            {"role": "assistant", "content": "4"},
            {"role": "user", "content": "Why?"},
        ]));
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        let msgs = req["messages"].as_array().unwrap();
        let last = msgs[3]["content"].as_str().unwrap();
        assert!(last.starts_with("Why?"));
        assert!(last.ends_with(REASONING_PROMPT));
        assert_eq!(msgs[1]["content"], "What is 2+2?");
    }

    #[test]
    fn array_content_gets_text_block_appended() {
        let mut req = req_with_messages(json!([
            {"role": "user", "content": [{"type": "text", "text": "Hello"}]},
        ]));
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        let content = req["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[1]["text"], REASONING_PROMPT);
    }

    #[test]
    fn tool_as_last_message_appends_new_user_message() {
        let mut req = req_with_messages(json!([
            {"role": "user", "content": "Use a tool"},
            {"role": "tool", "content": "tool result", "tool_call_id": "call_1"},
        ]));
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        let msgs = req["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[2]["role"], "user");
        assert_eq!(msgs[2]["content"], REASONING_PROMPT);
    }

    #[test]
    fn prior_thinking_reinjected_as_tags() {
        let mut req = req_with_messages(json!([
            {"role": "user", "content": "What is 2+2?"},
            {"role": "assistant", "content": "4", "thinking": "2+2 is basic arithmetic"},
            {"role": "user", "content": "Why?"},
        ]));
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();

        let assistant = &req["messages"][1];
        let content = assistant["content"].as_str().unwrap();
        assert!(content
            .contains("<reasoning_content>2+2 is basic arithmetic</reasoning_content>"));
        assert!(content.ends_with("\n4"));
        assert!(assistant.get("thinking").is_none());
    }

    #[test]
    fn empty_or_missing_messages_is_noop() {
        let mut req = req_with_messages(json!([]));
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();
        assert!(req["messages"].as_array().unwrap().is_empty());

        let mut req = json!({"model": "gpt-4"}).as_object().cloned().unwrap();
        ForceReasoningTransform::new()
            .transform_request(&mut req, &mut ctx())
            .unwrap();
        assert!(req.get("messages").is_none());
    }

    #[test]
    fn response_extracts_reasoning_tags() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {
                "role": "assistant",
                "content": "<reasoning_content>step 1\nstep 2</reasoning_content>The answer is 4.",
            }}],
        }))
        .unwrap();

        let out = ForceReasoningTransform::new()
            .transform_response(body, &mut ctx())
            .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let msg = &parsed["choices"][0]["message"];
        assert_eq!(msg["thinking"]["content"], "step 1\nstep 2");
        assert_eq!(msg["content"], "The answer is 4.");
    }

    #[test]
    fn stream_extracts_reasoning_tags() {
        let mut tr = ForceReasoningTransform::new();
        let mut c = ctx();

        let data = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "pre<reasoning_content>because</reasoning_content>post"}}],
        }))
        .unwrap();
        let chunks = tr.transform_stream_chunk(&data, &mut c).unwrap();
        assert_eq!(chunks.len(), 4);

        let first: Value = serde_json::from_slice(&chunks[0]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["content"], "pre");
        let second: Value = serde_json::from_slice(&chunks[1]).unwrap();
        assert_eq!(second["choices"][0]["delta"]["thinking"]["content"], "because");
        let third: Value = serde_json::from_slice(&chunks[2]).unwrap();
        assert!(third["choices"][0]["delta"]["thinking"]["signature"].is_string());
        let fourth: Value = serde_json::from_slice(&chunks[3]).unwrap();
        assert_eq!(fourth["choices"][0]["delta"]["content"], "post");
        assert_eq!(fourth["choices"][0]["index"], 1);
    }

    #[test]
    fn stream_buffers_partial_open_tag() {
        let mut tr = ForceReasoningTransform::new();
        let mut c = ctx();

        let first = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "text<reasoning_"}}],
        }))
        .unwrap();
        let chunks = tr.transform_stream_chunk(&first, &mut c).unwrap();
        assert_eq!(chunks.len(), 1);
        let parsed: Value = serde_json::from_slice(&chunks[0]).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["content"], "text");

        let second = serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": "content>inner"}}],
        }))
        .unwrap();
        let chunks = tr.transform_stream_chunk(&second, &mut c).unwrap();
        assert_eq!(chunks.len(), 1);
        let parsed: Value = serde_json::from_slice(&chunks[0]).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["thinking"]["content"], "inner");
    }
}
