//! Bidirectional translation between the Anthropic Messages API and the
//! OpenAI Chat Completions API, with a composable per-provider transform
//! chain in between.
//!
//! ```text
//! Anthropic request
//!     ↓ request_to_openai
//! TransformChain (forward)
//!     ↓
//! [backend HTTP call]
//!     ↓
//! TransformChain (reverse)
//!     ↓ response_to_anthropic / StreamTranslator
//! Anthropic response
//! ```
//!
//! Payloads travel through transforms as dynamic `serde_json` values; the
//! translation boundary itself uses typed structs.

mod chain;
mod context;
mod jsonfix;
mod request;
mod response;
mod stream;
mod transforms;

pub use chain::{build_chain, TransformChain, Transformer};
pub use context::{ToolCallBuffer, TransformContext};
pub use jsonfix::fix_json;
pub use request::request_to_openai;
pub use response::{
    classify_error, classify_reqwest_error, format_error, format_stream_error,
    response_to_anthropic, sanitize_tool_id,
};
pub use stream::StreamTranslator;
