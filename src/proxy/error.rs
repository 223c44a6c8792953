//! Proxy error types and response mapping.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};

/// Response body type used throughout the proxy.
pub(crate) type ProxyBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

pub(crate) fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub(crate) fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Errors that terminate one tunneled request (and the tunnel with it).
#[derive(Debug)]
pub(crate) enum ProxyError {
    BodyRead,
    BodyTooLarge,
    Upstream,
}

impl ProxyError {
    pub(crate) fn into_response(self) -> Response<ProxyBody> {
        let (status, message) = match self {
            ProxyError::BodyRead => (StatusCode::BAD_REQUEST, "Bad Request"),
            ProxyError::BodyTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Content Too Large"),
            ProxyError::Upstream => (StatusCode::BAD_GATEWAY, "Bad Gateway"),
        };
        closing_text_response(status, message)
    }
}

/// Plain-text response that also closes the tunnel.
pub(crate) fn closing_text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(message.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}

/// Plain-text response that keeps the connection open.
pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Anthropic-shaped JSON error body with the given HTTP status; closes the
/// tunnel so a broken exchange never leaks into the next request.
pub(crate) fn anthropic_error_response(status: StatusCode, body: Vec<u8>) -> Response<ProxyBody> {
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp.headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    resp
}
