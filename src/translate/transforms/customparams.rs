//! Injects configured parameters into the request body. Keys already set by
//! the caller are never overwritten.

use anyhow::Result;
use serde_json::{Map, Value};

use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

#[derive(Default)]
pub struct CustomParamsTransform;

impl Transformer for CustomParamsTransform {
    fn name(&self) -> &'static str {
        "customparams"
    }

    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        ctx: &mut TransformContext,
    ) -> Result<()> {
        for (k, v) in &ctx.params {
            if !req.contains_key(k) {
                req.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn injects_new_keys() {
        let mut ctx = TransformContext::new("m", "p");
        ctx.params = json!({"top_k": 40, "repeat_penalty": 1.1})
            .as_object()
            .cloned()
            .unwrap();

        let mut req = json!({"model": "m"}).as_object().cloned().unwrap();
        CustomParamsTransform.transform_request(&mut req, &mut ctx).unwrap();

        assert_eq!(req["top_k"], 40);
        assert_eq!(req["repeat_penalty"], 1.1);
    }

    #[test]
    fn does_not_overwrite_existing() {
        let mut ctx = TransformContext::new("m", "p");
        ctx.params = json!({"temperature": 0.1}).as_object().cloned().unwrap();

        let mut req = json!({"model": "m", "temperature": 0.9})
            .as_object()
            .cloned()
            .unwrap();
        CustomParamsTransform.transform_request(&mut req, &mut ctx).unwrap();

        assert_eq!(req["temperature"], 0.9);
    }

    #[test]
    fn empty_params_is_noop() {
        let mut ctx = TransformContext::new("m", "p");
        let mut req = json!({"model": "m"}).as_object().cloned().unwrap();
        CustomParamsTransform.transform_request(&mut req, &mut ctx).unwrap();
        assert_eq!(req.len(), 1);
    }
}
