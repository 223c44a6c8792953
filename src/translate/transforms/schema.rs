//! Schema cleaners: recursively strip JSON-Schema keywords a provider cannot
//! digest from tool parameter schemas.

use anyhow::Result;
use serde_json::{Map, Value};

use crate::translate::chain::Transformer;
use crate::translate::context::TransformContext;

const GENERIC_STRIP: &[&str] = &["additionalProperties", "$schema", "strict"];
const OPENAI_STRIP: &[&str] = &["strict"];

/// Gemini only supports a fixed set of `format` values.
const GEMINI_ALLOWED_FORMATS: &[&str] = &["date", "date-time", "int32", "int64", "float", "double"];

enum Cleaner {
    Strip(&'static [&'static str]),
    Gemini,
}

pub struct SchemaTransform {
    name: &'static str,
    cleaner: Cleaner,
}

impl SchemaTransform {
    pub fn generic() -> Self {
        Self {
            name: "schema:generic",
            cleaner: Cleaner::Strip(GENERIC_STRIP),
        }
    }

    pub fn ollama() -> Self {
        Self {
            name: "schema:ollama",
            cleaner: Cleaner::Strip(GENERIC_STRIP),
        }
    }

    pub fn openai() -> Self {
        Self {
            name: "schema:openai",
            cleaner: Cleaner::Strip(OPENAI_STRIP),
        }
    }

    pub fn gemini() -> Self {
        Self {
            name: "schema:gemini",
            cleaner: Cleaner::Gemini,
        }
    }
}

impl Transformer for SchemaTransform {
    fn name(&self) -> &'static str {
        self.name
    }

    fn transform_request(
        &mut self,
        req: &mut Map<String, Value>,
        _ctx: &mut TransformContext,
    ) -> Result<()> {
        let Some(tools) = req.get_mut("tools").and_then(Value::as_array_mut) else {
            return Ok(());
        };
        for tool in tools {
            let Some(params) = tool
                .get_mut("function")
                .and_then(|f| f.get_mut("parameters"))
                .and_then(Value::as_object_mut)
            else {
                continue;
            };
            clean_schema(params, &self.cleaner);
        }
        Ok(())
    }
}

fn clean_schema(schema: &mut Map<String, Value>, cleaner: &Cleaner) {
    match cleaner {
        Cleaner::Strip(fields) => {
            for f in *fields {
                schema.remove(*f);
            }
        }
        Cleaner::Gemini => {
            schema.remove("additionalProperties");
            schema.remove("$schema");
            schema.remove("exclusiveMaximum");
            schema.remove("exclusiveMinimum");
            if let Some(format) = schema.get("format").and_then(Value::as_str) {
                if !GEMINI_ALLOWED_FORMATS.contains(&format) {
                    schema.remove("format");
                }
            }
        }
    }
    recurse_schema(schema, cleaner);
}

/// Apply the cleaner to nested schema structures.
fn recurse_schema(schema: &mut Map<String, Value>, cleaner: &Cleaner) {
    if let Some(props) = schema.get_mut("properties").and_then(Value::as_object_mut) {
        for (_, v) in props.iter_mut() {
            if let Some(prop) = v.as_object_mut() {
                clean_schema(prop, cleaner);
            }
        }
    }
    if let Some(items) = schema.get_mut("items").and_then(Value::as_object_mut) {
        clean_schema(items, cleaner);
    }
    for key in ["anyOf", "oneOf", "allOf"] {
        if let Some(arr) = schema.get_mut(key).and_then(Value::as_array_mut) {
            for v in arr {
                if let Some(sub) = v.as_object_mut() {
                    clean_schema(sub, cleaner);
                }
            }
        }
    }
}
