//! Relay for unmarked requests: forward to the CONNECT target over HTTPS and
//! re-frame the response for the HTTP/1.1 tunnel.

use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Response};

use super::error::{full_body, ProxyBody, ProxyError};
use super::Proxy;

/// Headers that describe one hop, never forwarded in either direction.
pub(crate) const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailers",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    // HeaderName::as_str() is guaranteed lowercase.
    HOP_BY_HOP.contains(&name)
}

/// Hosts whose upstream failures are always worth logging.
fn is_api_host(host: &str) -> bool {
    host.contains("anthropic.com")
        || host.contains("openai.com")
        || host.contains("localhost")
        || host.contains("127.0.0.1")
}

impl Proxy {
    /// Forward one tunneled request to the CONNECT target as-is.
    pub(crate) async fn forward_upstream(
        &self,
        parts: Parts,
        body: Bytes,
        host: &str,
        port: u16,
    ) -> Response<ProxyBody> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = if port == 443 {
            format!("https://{host}{path_and_query}")
        } else {
            format!("https://{host}:{port}{path_and_query}")
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            let n = name.as_str();
            // host and content-length are derived from the outgoing request
            if is_hop_by_hop(n) || n == "host" || n == "content-length" {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let mut req = self
            .upstream_client
            .request(parts.method.clone(), &url)
            .headers(headers);
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(err) => {
                if self.verbose || is_api_host(host) {
                    tracing::warn!("upstream error for {host}: {err}");
                }
                return ProxyError::Upstream.into_response();
            }
        };

        let status = resp.status();
        let mut out_headers = HeaderMap::new();
        for (name, value) in resp.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            out_headers.append(name.clone(), value.clone());
        }

        if resp.content_length().is_some() {
            // Known length: stream straight through.
            let stream = resp
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(std::io::Error::other);
            let mut response = Response::new(BodyExt::boxed(StreamBody::new(stream)));
            *response.status_mut() = status;
            *response.headers_mut() = out_headers;
            return response;
        }

        // No Content-Length (e.g. an HTTP/2 upstream): buffer bounded and
        // emit one, since the tunnel side always speaks HTTP/1.1.
        let mut buf: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::debug!("response read error for {host}: {err}");
                    return ProxyError::Upstream.into_response();
                }
            };
            if (buf.len() + chunk.len()) as u64 > self.tunables.max_body_bytes {
                tracing::debug!("response from {host} exceeded size limit");
                return ProxyError::Upstream.into_response();
            }
            buf.extend_from_slice(&chunk);
        }

        let mut response = Response::new(full_body(buf));
        *response.status_mut() = status;
        *response.headers_mut() = out_headers;
        response
    }
}
