//! Groq quirk normalizer: strips cache_control and `$schema` from requests
//! and fixes numeric tool call ids in streams.

use anyhow::Result;
use serde_json::{Map, Value};

use super::{bump_choice_index, fix_numeric_tool_id, strip_cache_control};
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct GroqTransform;

impl Transformer for GroqTransform {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        strip_cache_control(req);

        if let Some(tools) = req.get_mut("tools").and_then(Value::as_array_mut) {
            for tool in tools {
                if let Some(params) = tool
                    .get_mut("function")
                    .and_then(|f| f.get_mut("parameters"))
                    .and_then(Value::as_object_mut)
                {
                    params.remove("$schema");
                }
            }
        }

        Ok(())
    }

    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let Ok(mut parsed) = serde_json::from_slice::<Value>(data) else {
            return Ok(vec![data.to_vec()]);
        };
        let Some(tc) = parsed
            .get_mut("choices")
            .and_then(|c| c.get_mut(0))
            .and_then(|c| c.get_mut("delta"))
            .and_then(|d| d.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
            .and_then(|arr| arr.first_mut())
            .and_then(Value::as_object_mut)
        else {
            return Ok(vec![data.to_vec()]);
        };

        let mut modified = fix_numeric_tool_id(tc);

        // Same index-bump quirk as openrouter: applied to every tool-call
        // chunk after text content, argument fragments included.
        if ctx.has_text_content && bump_choice_index(&mut parsed) {
            modified = true;
        }

        if !modified {
            return Ok(vec![data.to_vec()]);
        }
        Ok(vec![serde_json::to_vec(&parsed).unwrap_or_else(|_| data.to_vec())])
    }
}
