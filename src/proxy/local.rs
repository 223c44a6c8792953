//! Routed-request pipeline: resolve the label, translate Anthropic → OpenAI,
//! run the transform chain, call the backend, and translate the response
//! back. Errors come back Anthropic-shaped so the host client renders them.

use futures::StreamExt;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde_json::Value;
use std::time::Instant;

use super::error::{anthropic_error_response, full_body, ProxyBody};
use super::route;
use super::Proxy;
use crate::config::ResolvedModel;
use crate::logging::sanitize_for_log;
use crate::translate::{
    build_chain, classify_error, classify_reqwest_error, format_error, format_stream_error,
    request_to_openai, response_to_anthropic, StreamTranslator, TransformChain, TransformContext,
};

impl Proxy {
    /// Serve a marked request via the configured backend (or the stub when no
    /// config is loaded). `stripped` has the routing marker removed;
    /// `original` is consulted for the streaming flag.
    pub(crate) async fn handle_local(
        &self,
        label: &str,
        stripped: &[u8],
        original: &[u8],
    ) -> Response<ProxyBody> {
        let streaming = route::wants_streaming(original);

        let Some(resolver) = &self.resolver else {
            return route::stub_response(label, streaming);
        };

        let start = Instant::now();

        let resolved = match resolver.resolve(label) {
            Ok(resolved) => resolved.clone(),
            Err(err) => {
                tracing::warn!("model resolution failed: {err}");
                let body = format_error(
                    "invalid_request_error",
                    &format!("Unknown model label {label:?} — check ~/.claude-relay/config.yaml"),
                );
                return anthropic_error_response(StatusCode::BAD_REQUEST, body);
            }
        };

        // An unknown transform name is never fatal; serve with an empty chain.
        let mut chain = match build_chain(&resolved.transform) {
            Ok(chain) => chain,
            Err(err) => {
                tracing::warn!(
                    "transform chain build failed for {:?}: {err} — falling back to no transforms",
                    resolved.transform
                );
                TransformChain::new()
            }
        };
        let mut ctx = TransformContext::new(&resolved.model, &resolved.provider);
        ctx.params = resolved.params.clone();

        let mut oai_req = match request_to_openai(stripped, &resolved.model, resolved.max_tokens) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!("request translation failed: {err:#}");
                let body =
                    format_error("api_error", &format!("Request translation failed: {err}"));
                return anthropic_error_response(StatusCode::INTERNAL_SERVER_ERROR, body);
            }
        };

        if let Err(err) = chain.run_request(&mut oai_req, &mut ctx) {
            tracing::warn!("[LOCAL_ERR:TRANSLATE] request transform failed for {label}: {err}");
            let body = format_error(
                "api_error",
                &format!("[TRANSLATE] Request transform failed for '{label}': {err}"),
            );
            return anthropic_error_response(StatusCode::INTERNAL_SERVER_ERROR, body);
        }

        let oai_body = match serde_json::to_vec(&Value::Object(oai_req)) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!("request serialization failed for {label}: {err}");
                let body = format_error("api_error", &format!("Failed to build request: {err}"));
                return anthropic_error_response(StatusCode::INTERNAL_SERVER_ERROR, body);
            }
        };

        // Fresh headers only: the client's Anthropic credentials must never
        // reach the backend.
        let endpoint = format!("{}/chat/completions", resolved.endpoint);
        let mut req = self
            .local_client
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(oai_body);
        if !resolved.api_key.is_empty() {
            req = req.header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", resolved.api_key),
            );
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(err) => {
                let cat = classify_reqwest_error(&err);
                tracing::warn!("[LOCAL_ERR:{cat}] {label} unreachable: {err} ({endpoint})");
                let body = format_error(
                    "api_error",
                    &format!("[{cat}] Local model '{label}' unreachable: {err} ({endpoint})"),
                );
                return anthropic_error_response(StatusCode::BAD_GATEWAY, body);
            }
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let raw = read_limited(resp, 4096).await;
            let sanitized = sanitize_for_log(&String::from_utf8_lossy(&raw));
            let code = status.as_u16();
            tracing::warn!("[LOCAL_ERR:HTTP_{code}] {label} returned {code}: {sanitized}");
            let body = format_error(
                "api_error",
                &format!("[HTTP_{code}] Local provider '{label}' returned {code}: {sanitized}"),
            );
            return anthropic_error_response(StatusCode::BAD_GATEWAY, body);
        }

        if streaming {
            self.local_streaming(resp, label, &resolved, chain, ctx, start)
                .await
        } else {
            self.local_buffered(resp, label, &resolved, chain, ctx, start)
                .await
        }
    }

    async fn local_streaming(
        &self,
        resp: reqwest::Response,
        label: &str,
        resolved: &ResolvedModel,
        chain: TransformChain,
        ctx: TransformContext,
        start: Instant,
    ) -> Response<ProxyBody> {
        let mut st = StreamTranslator::new(label);
        st.set_verbose(self.verbose);
        st.set_transform_chain(chain, ctx);

        let mut sse_body = Vec::new();
        let result = st
            .translate_stream(Box::pin(resp.bytes_stream()), &mut sse_body)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "LOCAL_OK {label} → {}/{} (streaming, {}ms)",
                    resolved.provider,
                    resolved.model,
                    start.elapsed().as_millis()
                );
            }
            Err(err) => {
                let cat = classify_error(&err.to_string());
                tracing::warn!("[LOCAL_ERR:{cat}] stream translation error for {label}: {err}");
                if sse_body.is_empty() {
                    let body = format_error(
                        "api_error",
                        &format!("[{cat}] Stream translation failed for '{label}': {err}"),
                    );
                    return anthropic_error_response(StatusCode::BAD_GATEWAY, body);
                }
                // Partial output already exists: close the stream cleanly
                // with an error event after what was written.
                sse_body.extend_from_slice(&format_stream_error(
                    "api_error",
                    &format!("[{cat}] Stream interrupted for '{label}': {err}"),
                ));
            }
        }

        let mut response = Response::new(full_body(sse_body));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        response
    }

    async fn local_buffered(
        &self,
        resp: reqwest::Response,
        label: &str,
        resolved: &ResolvedModel,
        mut chain: TransformChain,
        mut ctx: TransformContext,
        start: Instant,
    ) -> Response<ProxyBody> {
        let raw = match resp.bytes().await {
            Ok(raw) => raw,
            Err(err) => {
                let cat = classify_reqwest_error(&err);
                tracing::warn!("[LOCAL_ERR:{cat}] response read error for {label}: {err}");
                let body = format_error(
                    "api_error",
                    &format!("[{cat}] Failed to read response from '{label}': {err}"),
                );
                return anthropic_error_response(StatusCode::BAD_GATEWAY, body);
            }
        };

        let transformed = chain.run_response(raw.to_vec(), &mut ctx).unwrap_or_default();

        let abody = match response_to_anthropic(&transformed, label) {
            Ok(abody) => abody,
            Err(err) => {
                tracing::warn!("[LOCAL_ERR:TRANSLATE] response translation failed for {label}: {err}");
                let body = format_error(
                    "api_error",
                    &format!("[TRANSLATE] Response translation failed for '{label}': {err}"),
                );
                return anthropic_error_response(StatusCode::BAD_GATEWAY, body);
            }
        };

        let (input_tokens, output_tokens) = usage_of(&abody);
        tracing::info!(
            "LOCAL_OK {label} → {}/{} ({}ms, in={input_tokens} out={output_tokens} tokens)",
            resolved.provider,
            resolved.model,
            start.elapsed().as_millis()
        );

        let mut response = Response::new(full_body(abody));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Read at most `max` bytes of a response body; used for error snippets.
async fn read_limited(resp: reqwest::Response, max: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut stream = resp.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let room = max - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= max {
            break;
        }
    }
    buf
}

fn usage_of(abody: &[u8]) -> (u64, u64) {
    let Ok(parsed) = serde_json::from_slice::<Value>(abody) else {
        return (0, 0);
    };
    let usage = &parsed["usage"];
    (
        usage["input_tokens"].as_u64().unwrap_or(0),
        usage["output_tokens"].as_u64().unwrap_or(0),
    )
}
