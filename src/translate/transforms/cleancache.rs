//! Anthropic's `cache_control` is not understood by most OpenAI-compatible
//! providers; strip it from every message and content part.

use anyhow::Result;
use serde_json::{Map, Value};

use super::strip_cache_control;
use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct CleanCacheTransform;

impl Transformer for CleanCacheTransform {
    fn name(&self) -> &'static str {
        "cleancache"
    }

    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        strip_cache_control(req);
        Ok(())
    }
}
