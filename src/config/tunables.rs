//! Process-level tunables with environment overrides.
//!
//! Every override must parse as a positive number; a bad value is a startup
//! error rather than a silent fallback.

use anyhow::{bail, Context, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Tunables {
    /// Deadline for one backend HTTP round-trip.
    pub upstream_timeout: Duration,
    /// Largest request or buffered response body the proxy will handle.
    pub max_body_bytes: u64,
    /// Idle deadline on the client side of a tunnel, reset per request.
    pub client_recv_timeout: Duration,
    /// Concurrent CONNECT tunnels admitted before returning 503.
    pub max_proxy_tunnels: usize,
    /// Leaf certificate cache capacity.
    pub mitm_cache_max_size: usize,
    /// Leaf certificate validity in hours.
    pub mitm_cert_validity_hours: f64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            max_body_bytes: 10 << 20,
            client_recv_timeout: Duration::from_secs(300),
            max_proxy_tunnels: 128,
            mitm_cache_max_size: 256,
            mitm_cert_validity_hours: 1.0,
        }
    }
}

impl Tunables {
    /// Load defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut t = Self::default();

        if let Some(secs) = env_positive_u64("UPSTREAM_TIMEOUT_SECS")? {
            t.upstream_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_positive_u64("MAX_BODY_BYTES")? {
            t.max_body_bytes = bytes;
        }
        if let Some(secs) = env_positive_u64("CLIENT_RECV_TIMEOUT_SECS")? {
            t.client_recv_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_positive_u64("MAX_PROXY_TUNNELS")? {
            t.max_proxy_tunnels = n as usize;
        }
        if let Some(n) = env_positive_u64("MITM_CACHE_MAX_SIZE")? {
            t.mitm_cache_max_size = n as usize;
        }
        if let Some(hours) = env_positive_f64("MITM_CERT_VALIDITY_HOURS")? {
            t.mitm_cert_validity_hours = hours;
        }

        Ok(t)
    }

    pub fn cert_validity(&self) -> Duration {
        Duration::from_secs_f64(self.mitm_cert_validity_hours * 3600.0)
    }
}

fn env_positive_u64(name: &str) -> Result<Option<u64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: u64 = raw
        .parse()
        .with_context(|| format!("{name}={raw:?} is not a valid integer"))?;
    if value == 0 {
        bail!("{name} must be positive");
    }
    Ok(Some(value))
}

fn env_positive_f64(name: &str) -> Result<Option<f64>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    let value: f64 = raw
        .parse()
        .with_context(|| format!("{name}={raw:?} is not a valid number"))?;
    if value <= 0.0 {
        bail!("{name} must be positive");
    }
    Ok(Some(value))
}
