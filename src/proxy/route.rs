//! Routing-marker detection and the stub responder used when no provider
//! config is loaded.
//!
//! The marker is only honored in the Anthropic `system` field (string form
//! or `text` blocks of the array form), never in `messages`: an agent
//! quoting another agent's system prompt must not trigger a reroute.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use super::error::{full_body, ProxyBody};

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"<!-- @proxy-local-route:af83e9 model=(\S+) -->").expect("static regex")
    })
}

/// Check the `system` field of a JSON body for a routing marker.
///
/// Returns the model label and the body with the marker stripped, or `None`
/// when the body is unmarked (or not parseable as a marked request).
pub fn detect_local_route(body: &[u8]) -> Option<(String, Vec<u8>)> {
    if body.is_empty() {
        return None;
    }
    let mut data: Value = serde_json::from_slice(body).ok()?;

    let label = match data.get_mut("system")? {
        Value::String(s) => {
            let caps = marker_re().captures(s)?;
            let label = caps[1].to_string();
            let cleaned = marker_re().replace_all(s, "").trim().to_string();
            *s = cleaned;
            label
        }
        Value::Array(blocks) => {
            let mut found = None;
            for block in blocks.iter_mut() {
                let Some(text) = block.get("text").and_then(Value::as_str) else {
                    continue;
                };
                let Some(caps) = marker_re().captures(text) else {
                    continue;
                };
                let label = caps[1].to_string();
                let cleaned = marker_re().replace_all(text, "").trim().to_string();
                if let Some(obj) = block.as_object_mut() {
                    obj.insert("text".to_string(), Value::String(cleaned));
                }
                found = Some(label);
                break;
            }
            found?
        }
        _ => return None,
    };

    let stripped = serde_json::to_vec(&data).ok()?;
    Some((label, stripped))
}

/// Whether the request asked for a streaming response.
pub fn wants_streaming(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(Value::as_bool))
        .unwrap_or(false)
}

/// Anthropic-shaped dummy response for marked requests when no provider
/// config exists, so the host client keeps working.
pub fn stub_response(label: &str, streaming: bool) -> Response<ProxyBody> {
    let stub_text = format!(
        "[Local model '{label}' request intercepted by proxy — no local provider configured yet]"
    );
    let msg_id = "msg_stub_local_route";

    let (content_type, body) = if streaming {
        ("text/event-stream", sse_stub(msg_id, label, &stub_text))
    } else {
        ("application/json", json_stub(msg_id, label, &stub_text))
    };

    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn json_stub(msg_id: &str, model: &str, stub_text: &str) -> Vec<u8> {
    let resp = json!({
        "id": msg_id,
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": stub_text}],
        "model": model,
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": 1},
    });
    serde_json::to_vec(&resp).unwrap_or_default()
}

fn sse_stub(msg_id: &str, model: &str, stub_text: &str) -> Vec<u8> {
    let events: [(&str, Value); 6] = [
        (
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": msg_id, "type": "message", "role": "assistant",
                    "content": [], "model": model,
                    "stop_reason": null, "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                },
            }),
        ),
        (
            "content_block_start",
            json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "text", "text": ""},
            }),
        ),
        (
            "content_block_delta",
            json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": stub_text},
            }),
        ),
        (
            "content_block_stop",
            json!({"type": "content_block_stop", "index": 0}),
        ),
        (
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": 1},
            }),
        ),
        ("message_stop", json!({"type": "message_stop"})),
    ];

    let mut body = Vec::new();
    for (event, data) in events {
        if let Ok(data) = serde_json::to_string(&data) {
            body.extend_from_slice(format!("event: {event}\ndata: {data}\n\n").as_bytes());
        }
    }
    body
}
