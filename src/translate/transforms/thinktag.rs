//! Extracts `<think>...</think>` tags from streamed text content into
//! Anthropic-style thinking blocks. Used for models like Qwen3 and
//! DeepSeek-R1 that inline thinking in tags at certain temperatures.

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

use super::{bump_choice_index, delta_mut, message_mut, partial_tag_len, thinking_close_chunk};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagState {
    Searching,
    Thinking,
    Final,
}

/// State machine extracting one `open..close` tagged region from a stream of
/// content deltas, buffering partial tags across chunk boundaries.
pub(super) struct TagExtractor {
    open_tag: &'static str,
    close_tag: &'static str,
    state: TagState,
    tag_buffer: String,
}

impl TagExtractor {
    pub(super) fn new(open_tag: &'static str, close_tag: &'static str) -> Self {
        Self {
            open_tag,
            close_tag,
            state: TagState::Searching,
            tag_buffer: String::new(),
        }
    }

    pub(super) fn process_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };
        let Some(content) = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(vec![data.to_vec()]);
        };

        // Prepend any buffered partial tag from the previous chunk.
        let content = if self.tag_buffer.is_empty() {
            content
        } else {
            std::mem::take(&mut self.tag_buffer) + &content
        };

        match self.state {
            TagState::Searching => self.handle_searching(content, parsed, ctx),
            TagState::Thinking => self.append_thinking_chunks(Vec::new(), content, parsed, ctx),
            TagState::Final => handle_final(content, parsed, ctx),
        }
    }

    fn handle_searching(
        &mut self,
        content: String,
        mut parsed: Value,
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        if let Some(open_idx) = content.find(self.open_tag) {
            let before = &content[..open_idx];
            let after = content[open_idx + self.open_tag.len()..].to_string();
            self.state = TagState::Thinking;

            let mut chunks = Vec::new();
            if !before.is_empty() {
                ctx.has_text_content = true;
                set_delta_content(&mut parsed, before);
                chunks.push(serde_json::to_vec(&parsed).context("marshal pre-tag content")?);
            }
            if !after.is_empty() {
                return self.append_thinking_chunks(chunks, after, parsed, ctx);
            }
            return Ok(chunks);
        }

        // Partial tag at the end of the fragment: hold it back for the next chunk.
        let plen = partial_tag_len(&content, self.open_tag);
        if plen > 0 {
            self.tag_buffer = content[content.len() - plen..].to_string();
            let rest = &content[..content.len() - plen];
            if rest.is_empty() {
                return Ok(Vec::new());
            }
            ctx.has_text_content = true;
            set_delta_content(&mut parsed, rest);
            return Ok(vec![serde_json::to_vec(&parsed).context("marshal partial content")?]);
        }

        ctx.has_text_content = true;
        set_delta_content(&mut parsed, &content);
        Ok(vec![serde_json::to_vec(&parsed).context("marshal passthrough")?])
    }

    fn append_thinking_chunks(
        &mut self,
        mut chunks: Vec<Vec<u8>>,
        content: String,
        mut parsed: Value,
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        if let Some(close_idx) = content.find(self.close_tag) {
            let thinking = &content[..close_idx];
            let after = content[close_idx + self.close_tag.len()..].to_string();
            self.state = TagState::Final;

            if !thinking.is_empty() {
                set_delta_thinking(&mut parsed, thinking);
                chunks.push(serde_json::to_vec(&parsed).context("marshal thinking content")?);
            }

            chunks.push(thinking_close_chunk()?);

            let after = after.trim();
            if !after.is_empty() {
                ctx.has_text_content = true;
                bump_choice_index(&mut parsed);
                set_delta_content(&mut parsed, after);
                chunks.push(serde_json::to_vec(&parsed).context("marshal post-tag content")?);
            }

            return Ok(chunks);
        }

        // Close tag not seen yet: the whole fragment is thinking.
        set_delta_thinking(&mut parsed, &content);
        chunks.push(serde_json::to_vec(&parsed).context("marshal thinking")?);
        Ok(chunks)
    }
}

fn handle_final(
    content: String,
    mut parsed: Value,
    ctx: &mut TransformContext,
) -> Result<Vec<Vec<u8>>> {
    ctx.has_text_content = true;
    set_delta_content(&mut parsed, &content);
    Ok(vec![serde_json::to_vec(&parsed).context("marshal final content")?])
}

fn set_delta_content(parsed: &mut Value, text: &str) {
    if let Some(delta) = delta_mut(parsed) {
        delta.insert("content".to_string(), json!(text));
        delta.remove("thinking");
    }
}

fn set_delta_thinking(parsed: &mut Value, text: &str) {
    if let Some(delta) = delta_mut(parsed) {
        delta.insert("thinking".to_string(), json!({"content": text}));
        delta.remove("content");
    }
}

/// Non-streaming variant: extract one tagged region from `message.content`
/// into `message.thinking`.
pub(super) fn extract_tagged_response(body: Vec<u8>, re: &Regex) -> Vec<u8> {
    let Ok(mut parsed) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    let Some(content) = message_mut(&mut parsed)
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return body;
    };
    let Some(caps) = re.captures(&content) else {
        return body;
    };
    let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
        return body;
    };
    let thinking = inner.as_str().to_string();
    let after = content[whole.end()..].trim().to_string();

    if let Some(msg) = message_mut(&mut parsed) {
        msg.insert("thinking".to_string(), json!({"content": thinking}));
        msg.insert("content".to_string(), json!(after));
    }

    serde_json::to_vec(&parsed).unwrap_or(body)
}

fn think_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>(.*?)</think>").expect("static regex"))
}

pub struct ThinkTagTransform {
    extractor: TagExtractor,
}

impl ThinkTagTransform {
    pub fn new() -> Self {
        Self {
            extractor: TagExtractor::new("<think>", "</think>"),
        }
    }
}

impl Default for ThinkTagTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer for ThinkTagTransform {
    fn name(&self) -> &'static str {
        "extrathinktag"
    }

    fn transform_request(
        &mut self,
        _req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        Ok(())
    }

    fn transform_response(&mut self, body: Vec<u8>, _ctx: &mut TransformContext) -> Result<Vec<u8>> {
        Ok(extract_tagged_response(body, think_tag_re()))
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

    fn content_chunk(text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "choices": [{"index": 0, "delta": {"content": text}}],
        }))
        .unwrap()
    }

    fn delta_of(chunk: &[u8]) -> Value {
        let parsed: Value = serde_json::from_slice(chunk).unwrap();
        parsed["choices"][0]["delta"].clone()
    }

    #[test]
    fn stream_without_tags_passes_text_through() {
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let chunks = tr
            .transform_stream_chunk(&content_chunk("hello world"), &mut ctx)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(delta_of(&chunks[0])["content"], "hello world");
        assert!(ctx.has_text_content);
    }

    #[test]
    fn tag_split_across_chunks() {
        // "hello<thi" + "nk>reasoning</think>answer"
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let first = tr
            .transform_stream_chunk(&content_chunk("hello<thi"), &mut ctx)
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(delta_of(&first[0])["content"], "hello");

        let second = tr
            .transform_stream_chunk(&content_chunk("nk>reasoning</think>answer"), &mut ctx)
            .unwrap();
        assert_eq!(second.len(), 3);

        assert_eq!(delta_of(&second[0])["thinking"]["content"], "reasoning");
        assert!(delta_of(&second[1])["thinking"]["signature"].is_string());
        let last: Value = serde_json::from_slice(&second[2]).unwrap();
        assert_eq!(last["choices"][0]["delta"]["content"], "answer");
        assert_eq!(last["choices"][0]["index"], 1);
    }

    #[test]
    fn whole_tag_in_one_chunk() {
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let chunks = tr
            .transform_stream_chunk(&content_chunk("<think>hmm</think>ok"), &mut ctx)
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(delta_of(&chunks[0])["thinking"]["content"], "hmm");
        assert!(delta_of(&chunks[1])["thinking"]["signature"].is_string());
        assert_eq!(delta_of(&chunks[2])["content"], "ok");
    }

    #[test]
    fn partial_tag_only_chunk_is_suppressed() {
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let chunks = tr
            .transform_stream_chunk(&content_chunk("<th"), &mut ctx)
            .unwrap();
        assert!(chunks.is_empty());

        // The buffered prefix is reassembled with the next chunk.
        let next = tr
            .transform_stream_chunk(&content_chunk("ink>deep"), &mut ctx)
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(delta_of(&next[0])["thinking"]["content"], "deep");
    }

    #[test]
    fn thinking_spans_multiple_chunks() {
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        tr.transform_stream_chunk(&content_chunk("<think>part one "), &mut ctx)
            .unwrap();
        let mid = tr
            .transform_stream_chunk(&content_chunk("part two"), &mut ctx)
            .unwrap();
        assert_eq!(delta_of(&mid[0])["thinking"]["content"], "part two");

        let end = tr
            .transform_stream_chunk(&content_chunk("</think>done"), &mut ctx)
            .unwrap();
        // close signature + trailing content
        assert_eq!(end.len(), 2);
        assert_eq!(delta_of(&end[1])["content"], "done");
    }

    #[test]
    fn after_final_state_everything_is_content() {
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        tr.transform_stream_chunk(&content_chunk("<think>x</think>y"), &mut ctx)
            .unwrap();
        let chunks = tr
            .transform_stream_chunk(&content_chunk("<think>not again"), &mut ctx)
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(delta_of(&chunks[0])["content"], "<think>not again");
    }

    #[test]
    fn non_streaming_response_extracts_tags() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {"content": "<think>why</think> because"}}],
        }))
        .unwrap();
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let out = tr.transform_response(body, &mut ctx).unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let msg = &parsed["choices"][0]["message"];
        assert_eq!(msg["thinking"]["content"], "why");
        assert_eq!(msg["content"], "because");
    }

    #[test]
    fn non_streaming_response_without_tags_unchanged() {
        let body = serde_json::to_vec(&json!({
            "choices": [{"message": {"content": "plain answer"}}],
        }))
        .unwrap();
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let out = tr.transform_response(body.clone(), &mut ctx).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn non_delta_chunks_pass_through() {
        let data = serde_json::to_vec(&json!({"usage": {"prompt_tokens": 1}})).unwrap();
        let mut tr = ThinkTagTransform::new();
        let mut ctx = TransformContext::new("qwen3", "ollama");

        let chunks = tr.transform_stream_chunk(&data, &mut ctx).unwrap();
        assert_eq!(chunks, vec![data]);
    }
}
