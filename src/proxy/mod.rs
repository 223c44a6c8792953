//! MITM CONNECT proxy core.
//!
//! Each client connection issues `CONNECT host:port`; the proxy acquires an
//! admission slot, hijacks the socket via the HTTP upgrade machinery, answers
//! `200 Connection Established`, completes a server-side TLS handshake with a
//! certificate minted for the target host, and then serves plaintext HTTP/1.1
//! requests over the tunnel until the client closes it.
//!
//! Marked requests (see [`route`]) are diverted to a configured
//! OpenAI-compatible backend; everything else is relayed to the CONNECT
//! target unmodified.

mod error;
mod local;
pub mod route;
mod upstream;

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;

use crate::config::{ModelResolver, Tunables};
use crate::mitm::CertCache;
use error::{empty_body, text_response, ProxyBody, ProxyError};

/// The proxy: CONNECT handling, TLS interception, and request routing.
pub struct Proxy {
    cert_cache: Arc<CertCache>,
    resolver: Option<Arc<ModelResolver>>,
    tunables: Tunables,
    upstream_client: reqwest::Client,
    local_client: reqwest::Client,
    sem: Arc<Semaphore>,
    verbose: bool,
}

impl Proxy {
    pub fn new(
        cert_cache: Arc<CertCache>,
        resolver: Option<Arc<ModelResolver>>,
        tunables: Tunables,
        verbose: bool,
    ) -> Result<Arc<Self>> {
        let upstream_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(tunables.upstream_timeout)
            .build()
            .context("build upstream HTTP client")?;
        let local_client = reqwest::Client::builder()
            .timeout(tunables.upstream_timeout)
            .build()
            .context("build local HTTP client")?;
        let sem = Arc::new(Semaphore::new(tunables.max_proxy_tunnels));

        Ok(Arc::new(Self {
            cert_cache,
            resolver,
            tunables,
            upstream_client,
            local_client,
            sem,
            verbose,
        }))
    }

    /// Number of tunnels currently in flight.
    pub fn in_flight(&self) -> usize {
        self.tunables.max_proxy_tunnels - self.sem.available_permits()
    }

    /// Accept loop. Runs until the listener fails or the task is aborted.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accept")?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn({
                    let proxy = Arc::clone(&proxy);
                    move |req| {
                        let proxy = Arc::clone(&proxy);
                        async move { proxy.handle_connect(req).await }
                    }
                });
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    tracing::debug!("client connection error ({peer}): {err}");
                }
            });
        }
    }

    async fn handle_connect(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        if req.method() != Method::CONNECT {
            return Ok(text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "only CONNECT supported",
            ));
        }

        let target = req
            .uri()
            .authority()
            .and_then(|a| a.port_u16().map(|port| (a.host().to_string(), port)));
        let Some((host, port)) = target else {
            return Ok(text_response(StatusCode::BAD_REQUEST, "bad CONNECT target"));
        };

        // Non-blocking admission: overload answers 503 instead of queueing.
        let Ok(permit) = Arc::clone(&self.sem).try_acquire_owned() else {
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "proxy overloaded",
            ));
        };

        tokio::spawn(async move {
            let _permit = permit;
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(err) = Arc::clone(&self).run_tunnel(upgraded, &host, port).await {
                        tracing::debug!("tunnel {host}:{port} closed: {err:#}");
                    }
                }
                Err(err) => {
                    tracing::debug!("CONNECT upgrade failed for {host}:{port}: {err}");
                }
            }
        });

        let mut resp = Response::new(empty_body());
        *resp.status_mut() = StatusCode::OK;
        Ok(resp)
    }

    async fn run_tunnel(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        host: &str,
        port: u16,
    ) -> Result<()> {
        let tls_config = self
            .cert_cache
            .get_tls_config(host)
            .with_context(|| format!("cert generation failed for {host}"))?;
        let acceptor = TlsAcceptor::from(tls_config);
        let tls = acceptor
            .accept(TokioIo::new(upgraded))
            .await
            .with_context(|| format!("MITM TLS handshake failed for {host}"))?;

        let host: Arc<str> = host.into();
        let service = service_fn({
            let proxy = Arc::clone(&self);
            move |req| {
                let proxy = Arc::clone(&proxy);
                let host = Arc::clone(&host);
                async move { proxy.handle_tunnel_request(req, host, port).await }
            }
        });

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.tunables.client_recv_timeout);
        builder
            .serve_connection(TokioIo::new(tls), service)
            .await
            .context("tunnel connection")
    }

    /// One plaintext request read off the tunnel.
    async fn handle_tunnel_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        host: Arc<str>,
        port: u16,
    ) -> Result<Response<ProxyBody>, Infallible> {
        let (parts, body) = req.into_parts();

        let body = match collect_body(
            body,
            self.tunables.max_body_bytes,
            self.tunables.client_recv_timeout,
        )
        .await
        {
            Ok(body) => body,
            Err(err) => return Ok(err.into_response()),
        };

        if let Some((label, stripped)) = route::detect_local_route(&body) {
            let mode = if route::wants_streaming(&body) {
                "streaming"
            } else {
                "non-streaming"
            };
            tracing::info!(
                "LOCAL_ROUTE {} https://{host}:{port}{} → model={label} ({mode})",
                parts.method,
                parts.uri.path()
            );
            if self.verbose {
                log_headers(&parts.headers);
            }
            return Ok(self.handle_local(&label, &stripped, &body).await);
        }

        Ok(self.forward_upstream(parts, body, &host, port).await)
    }
}

/// Collect a request body, bounded by size and deadline.
async fn collect_body<B>(body: B, max_bytes: u64, deadline: Duration) -> Result<Bytes, ProxyError>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = Limited::new(body, max_bytes as usize);
    match tokio::time::timeout(deadline, limited.collect()).await {
        Err(_) => Err(ProxyError::BodyRead),
        Ok(Ok(collected)) => Ok(collected.to_bytes()),
        Ok(Err(err)) => {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(ProxyError::BodyTooLarge)
            } else {
                Err(ProxyError::BodyRead)
            }
        }
    }
}

/// Debug-dump request headers with credentials withheld.
fn log_headers(headers: &hyper::HeaderMap) {
    for (name, value) in headers {
        let n = name.as_str();
        if n == "x-api-key" || n == "authorization" {
            continue;
        }
        tracing::debug!("  {}: {}", n, value.to_str().unwrap_or("<binary>"));
    }
}
