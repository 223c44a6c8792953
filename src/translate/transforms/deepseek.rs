//! DeepSeek uses the OpenAI-legacy `max_tokens` parameter name.

use anyhow::Result;
use serde_json::{Map, Value};

use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct DeepseekTransform;

impl Transformer for DeepseekTransform {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        if let Some(v) = req.remove("max_completion_tokens") {
            req.insert("max_tokens".to_string(), v);
        }
        Ok(())
    }
}
