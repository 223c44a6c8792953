//! Per-request state shared across every transformer in a chain and across
//! every chunk of one streaming response.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Accumulator for streaming tool call argument fragments.
#[derive(Debug, Default)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Mutable state shared by all transformers in a chain for one request.
///
/// Created when a routed request arrives, dropped when its response has been
/// fully emitted. Never shared across requests.
#[derive(Debug)]
pub struct TransformContext {
    /// Accumulated reasoning text, used to detect the reasoning→content boundary.
    pub reasoning_content: String,
    pub reasoning_complete: bool,
    pub has_text_content: bool,

    /// Streaming tool call argument buffers, keyed by tool call index.
    /// BTreeMap keeps flush order deterministic (ascending index).
    pub tool_call_buffers: BTreeMap<i64, ToolCallBuffer>,

    /// Index of an active ExitTool call (-1 = inactive).
    pub exit_tool_index: i64,
    pub exit_tool_args: String,

    pub model_name: String,
    pub provider_name: String,

    /// Custom parameters from config to inject into the request body.
    pub params: Map<String, Value>,
}

impl TransformContext {
    pub fn new(model: &str, provider: &str) -> Self {
        Self {
            reasoning_content: String::new(),
            reasoning_complete: false,
            has_text_content: false,
            tool_call_buffers: BTreeMap::new(),
            exit_tool_index: -1,
            exit_tool_args: String::new(),
            model_name: model.to_string(),
            provider_name: provider.to_string(),
            params: Map::new(),
        }
    }
}
