//! Composable transformer chain.
//!
//! A chain is an ordered list of named transformers. Requests run through the
//! chain in forward order; responses and stream chunks run in reverse order,
//! so the transformer closest to the wire format sits at the end of the list.
//!
//! Stream transformers may fan out: one input chunk can produce zero chunks
//! (suppression), one, or several (e.g. a thinking-close boundary followed by
//! the content chunk). Each output chunk is fed through the next transformer
//! in the (reversed) chain.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

use super::context::TransformContext;
use super::transforms::{
    CleanCacheTransform, CustomParamsTransform, DeepseekTransform, EnhanceToolTransform,
    ForceReasoningTransform, GroqTransform, OpenRouterTransform, ReasoningTransform,
    SchemaTransform, ThinkTagTransform, ToolUseTransform,
};

/// A composable unit that can transform requests, responses, and stream chunks.
///
/// Implementations override only the directions they care about; the defaults
/// pass everything through unchanged. Stateful stream transformers rely on
/// chains being built fresh per request.
pub trait Transformer: Send {
    fn name(&self) -> &'static str;

    fn transform_request(
        &mut self,
        _req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        Ok(())
    }

    fn transform_response(
        &mut self,
        body: Vec<u8>,
        _ctx: &mut TransformContext,
    ) -> Result<Vec<u8>> {
        Ok(body)
    }

    fn transform_stream_chunk(
        &mut self,
        data: &[u8],
        _ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        Ok(vec![data.to_vec()])
    }
}

/// Applies a sequence of transformers.
pub struct TransformChain {
    transforms: Vec<Box<dyn Transformer>>,
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformChain")
            .field(
                "transforms",
                &self.transforms.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl TransformChain {
    /// Create an empty (passthrough) chain.
    pub fn new() -> Self {
        Self {
            transforms: Vec::new(),
        }
    }

    pub fn from_transforms(transforms: Vec<Box<dyn Transformer>>) -> Self {
        Self { transforms }
    }

    /// Apply each transformer's request step in forward order. Stops on first error.
    pub fn run_request(
        &mut self,
        req: &mut Map<String, Value>,
        ctx: &mut TransformContext,
    ) -> Result<()> {
        for t in &mut self.transforms {
            t.transform_request(req, ctx)?;
        }
        Ok(())
    }

    /// Apply each transformer's response step in reverse order. Stops on first error.
    pub fn run_response(
        &mut self,
        mut body: Vec<u8>,
        ctx: &mut TransformContext,
    ) -> Result<Vec<u8>> {
        for t in self.transforms.iter_mut().rev() {
            body = t.transform_response(body, ctx)?;
        }
        Ok(body)
    }

    /// Apply each transformer's stream step in reverse order, feeding every
    /// chunk produced by one layer through the next. Returns 0 chunks for
    /// suppression, 1 for normal, 2+ for expansion.
    pub fn run_stream_chunk(
        &mut self,
        data: &[u8],
        ctx: &mut TransformContext,
    ) -> Result<Vec<Vec<u8>>> {
        let mut chunks = vec![data.to_vec()];

        for t in self.transforms.iter_mut().rev() {
            let mut next = Vec::with_capacity(chunks.len());
            for chunk in &chunks {
                next.extend(t.transform_stream_chunk(chunk, ctx)?);
            }
            chunks = next;
        }

        Ok(chunks)
    }
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a chain from a list of registered transform names.
///
/// Fails with an unknown-name error; callers are expected to log and fall
/// back to an empty chain rather than failing the request.
pub fn build_chain(names: &[String]) -> Result<TransformChain> {
    let mut transforms: Vec<Box<dyn Transformer>> = Vec::with_capacity(names.len());
    for name in names {
        transforms.push(new_transformer(name).ok_or_else(|| anyhow!("unknown transform: {name:?}"))?);
    }
    Ok(TransformChain::from_transforms(transforms))
}

fn new_transformer(name: &str) -> Option<Box<dyn Transformer>> {
    let t: Box<dyn Transformer> = match name {
        "schema:generic" => Box::new(SchemaTransform::generic()),
        "schema:ollama" => Box::new(SchemaTransform::ollama()),
        "schema:openai" => Box::new(SchemaTransform::openai()),
        "schema:gemini" => Box::new(SchemaTransform::gemini()),
        "reasoning" => Box::new(ReasoningTransform::default()),
        "extrathinktag" => Box::new(ThinkTagTransform::new()),
        "forcereasoning" => Box::new(ForceReasoningTransform::new()),
        "enhancetool" => Box::new(EnhanceToolTransform::default()),
        "tooluse" => Box::new(ToolUseTransform::default()),
        "deepseek" => Box::new(DeepseekTransform::default()),
        "openrouter" => Box::new(OpenRouterTransform::default()),
        "groq" => Box::new(GroqTransform::default()),
        "cleancache" => Box::new(CleanCacheTransform::default()),
        "customparams" => Box::new(CustomParamsTransform::default()),
        _ => return None,
    };
    Some(t)
}
