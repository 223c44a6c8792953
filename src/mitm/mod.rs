//! Dynamic per-host certificate generation and caching for TLS interception.
//!
//! A local CA signs short-lived leaf certificates minted on demand for each
//! CONNECT target. Leaves are cached with LRU eviction and a TTL; within the
//! TTL every tunnel to the same host reuses the same certificate.

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, Ia5String, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const CA_COMMON_NAME: &str = "claude-relay MITM CA";

/// Generates and caches per-host TLS server configurations signed by a MITM CA.
pub struct CertCache {
    ca_cert: Certificate,
    ca_key: KeyPair,
    max_size: usize,
    validity: Duration,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// LRU order, front = most recently used.
    order: VecDeque<String>,
}

struct CacheEntry {
    config: Arc<ServerConfig>,
    created: Instant,
}

impl CertCache {
    /// Build a cache from PEM-encoded CA certificate and key. Parse failures
    /// are fatal; the proxy cannot run without a working CA.
    pub fn new(
        ca_cert_pem: &str,
        ca_key_pem: &str,
        max_size: usize,
        validity: Duration,
    ) -> Result<Self> {
        let ca_key = KeyPair::from_pem(ca_key_pem).context("parse CA key")?;
        let ca_params =
            CertificateParams::from_ca_cert_pem(ca_cert_pem).context("parse CA certificate")?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .context("rebuild CA certificate")?;

        Ok(Self {
            ca_cert,
            ca_key,
            max_size,
            validity,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        })
    }

    /// Return a server TLS configuration bearing a certificate valid for
    /// `hostname`. Results are cached with LRU eviction and TTL expiry.
    pub fn get_tls_config(&self, hostname: &str) -> Result<Arc<ServerConfig>> {
        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = inner.entries.get(hostname) {
                if entry.created.elapsed() < self.validity {
                    let config = Arc::clone(&entry.config);
                    let hostname = hostname.to_string();
                    inner.order.retain(|h| h != &hostname);
                    inner.order.push_front(hostname);
                    return Ok(config);
                }
                inner.entries.remove(hostname);
                let hostname = hostname.to_string();
                inner.order.retain(|h| h != &hostname);
            }
        }

        // Mint outside the lock; racing minters converge on the entry
        // inserted last, which still keeps one live cert per host.
        let config = Arc::new(self.generate_config(hostname)?);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.retain(|h| h != hostname);
        inner.order.push_front(hostname.to_string());
        inner.entries.insert(
            hostname.to_string(),
            CacheEntry {
                config: Arc::clone(&config),
                created: Instant::now(),
            },
        );
        while inner.order.len() > self.max_size {
            if let Some(oldest) = inner.order.pop_back() {
                inner.entries.remove(&oldest);
            }
        }

        Ok(config)
    }

    fn generate_config(&self, hostname: &str) -> Result<ServerConfig> {
        let (cert_der, key_der) = self.generate_leaf(hostname)?;

        let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .context("build server TLS config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }

    fn generate_leaf(
        &self,
        hostname: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("generate leaf key")?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        params.serial_number = Some(random_serial());
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = time::OffsetDateTime::now_utc()
            + time::Duration::seconds(self.validity.as_secs() as i64);

        params.subject_alt_names = match hostname.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(
                Ia5String::try_from(hostname.to_string())
                    .with_context(|| format!("hostname {hostname:?} is not a valid DNS name"))?,
            )],
        };

        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("sign leaf certificate for {hostname}"))?;

        let cert_der: CertificateDer<'static> = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        Ok((cert_der, key_der))
    }

    #[cfg(test)]
    fn cached_hosts(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.entries.keys().cloned().collect()
    }
}

/// Create a self-signed CA certificate and key, returned as PEM strings.
pub fn generate_ca() -> Result<(String, String)> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("generate CA key")?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);
    params.serial_number = Some(random_serial());
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(365);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let cert = params.self_signed(&key).context("self-sign CA")?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn random_serial() -> SerialNumber {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}
