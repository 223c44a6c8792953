//! Transformer library: schema cleaners, reasoning extraction, tool call
//! repair, and per-provider quirk normalizers.

mod cleancache;
mod customparams;
mod deepseek;
mod enhancetool;
mod forcereasoning;
mod groq;
mod openrouter;
mod reasoning;
mod schema;
mod thinktag;
mod tooluse;

pub use cleancache::CleanCacheTransform;
pub use customparams::CustomParamsTransform;
pub use deepseek::DeepseekTransform;
pub use enhancetool::EnhanceToolTransform;
pub use forcereasoning::ForceReasoningTransform;
pub use groq::GroqTransform;
pub use openrouter::OpenRouterTransform;
pub use reasoning::ReasoningTransform;
pub use schema::SchemaTransform;
pub use thinktag::ThinkTagTransform;
pub use tooluse::ToolUseTransform;

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

// ----------------------------------------------------------------------------
// Shared helpers for walking OpenAI-shaped payloads held as dynamic JSON.
// Transformers re-navigate from the root between mutations; serde_json does
// not allow holding two mutable borrows into the same tree.
// ----------------------------------------------------------------------------

pub(crate) fn choice_mut(parsed: &mut Value) -> Option<&mut Map<String, Value>> {
    parsed.get_mut("choices")?.get_mut(0)?.as_object_mut()
}

pub(crate) fn delta_mut(parsed: &mut Value) -> Option<&mut Map<String, Value>> {
    parsed.get_mut("choices")?.get_mut(0)?.get_mut("delta")?.as_object_mut()
}

pub(crate) fn message_mut(parsed: &mut Value) -> Option<&mut Map<String, Value>> {
    parsed.get_mut("choices")?.get_mut(0)?.get_mut("message")?.as_object_mut()
}

/// Increment `choices[0].index` when it is an integer.
pub(crate) fn bump_choice_index(parsed: &mut Value) -> bool {
    if let Some(choice) = choice_mut(parsed) {
        if let Some(idx) = choice.get("index").and_then(Value::as_i64) {
            choice.insert("index".to_string(), Value::from(idx + 1));
            return true;
        }
    }
    false
}

/// Synthetic chunk closing a thinking block, carrying a timestamp signature.
pub(crate) fn thinking_close_chunk() -> Result<Vec<u8>> {
    let chunk = json!({
        "choices": [{
            "delta": {
                "thinking": {
                    "signature": format!("<{}>", chrono::Utc::now().timestamp_millis()),
                },
            },
        }],
    });
    serde_json::to_vec(&chunk).context("marshal thinking-close")
}

/// Strip `cache_control` from every message and every content part.
pub(crate) fn strip_cache_control(req: &mut Map<String, Value>) {
    let Some(msgs) = req.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    for m in msgs {
        let Some(msg) = m.as_object_mut() else {
            continue;
        };
        msg.remove("cache_control");
        if let Some(parts) = msg.get_mut("content").and_then(Value::as_array_mut) {
            for p in parts {
                if let Some(part) = p.as_object_mut() {
                    part.remove("cache_control");
                }
            }
        }
    }
}

/// Length of a strict non-empty prefix of `tag` found at the end of `s`, or 0.
pub(crate) fn partial_tag_len(s: &str, tag: &str) -> usize {
    for i in 1..tag.len() {
        if s.ends_with(&tag[..i]) {
            return i;
        }
    }
    0
}

/// Replace a purely numeric tool call id with a random `call_` id.
/// Returns true if a change was made.
pub(crate) fn fix_numeric_tool_id(tc: &mut Map<String, Value>) -> bool {
    let Some(id) = tc.get("id").and_then(Value::as_str) else {
        return false;
    };
    if id.parse::<i64>().is_err() {
        return false;
    }
    tc.insert("id".to_string(), Value::from(random_call_id()));
    true
}

/// `call_` followed by 24 random hex characters.
pub(crate) fn random_call_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("call_{hex}")
}
