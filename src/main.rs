// claude-relay launches a MITM routing proxy and runs claude through it.
//
// Architecture:
// - mitm: per-host certificate minting signed by a local CA (LRU cached)
// - proxy: CONNECT handling, TLS interception, keep-alive tunnel loop
// - translate: Anthropic ↔ OpenAI translation plus the transform chain
// - config: provider YAML and env tunables
//
// Requests carrying the routing marker in their system prompt are diverted
// to a configured OpenAI-compatible backend; everything else flows to the
// CONNECT target untouched.

mod cli;
mod config;
mod logging;
mod mitm;
mod proxy;
mod translate;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use cli::Cli;
use config::{ModelResolver, ProvidersConfig, Tunables};
use mitm::CertCache;
use proxy::Proxy;

fn main() {
    let code = run();
    std::process::exit(code);
}

fn run() -> i32 {
    let args = Cli::parse();

    let certs_dir = args
        .certs_dir
        .clone()
        .unwrap_or_else(|| cli::default_base_dir().join("certs"));
    // Logs and config live next to the certs directory.
    let base_dir = certs_dir
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(cli::default_base_dir);

    if let Err(err) = create_private_dir(&base_dir) {
        eprintln!("create base dir: {err:#}");
        return 1;
    }

    let session_id = format!("s{}", std::process::id());
    if let Err(err) = logging::init(&base_dir.join("proxy.log"), &session_id, args.verbose) {
        eprintln!("logging setup failed: {err:#}");
        return 1;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            tracing::error!("start runtime: {err}");
            return 1;
        }
    };

    match runtime.block_on(run_proxy(args, &base_dir, &certs_dir)) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            eprintln!("claude-relay: {err:#}");
            1
        }
    }
}

async fn run_proxy(args: Cli, base_dir: &Path, certs_dir: &Path) -> Result<i32> {
    let tunables = Tunables::from_env()?;

    create_private_dir(certs_dir)?;
    let (ca_cert_pem, ca_key_pem, ca_cert_path) = ensure_ca(certs_dir)?;

    let cert_cache = Arc::new(
        CertCache::new(
            &ca_cert_pem,
            &ca_key_pem,
            tunables.mitm_cache_max_size,
            tunables.cert_validity(),
        )
        .context("create cert cache")?,
    );

    // Provider config is optional; without it, marked requests get stub
    // responses so the host CLI keeps working.
    let config_path = base_dir.join("config.yaml");
    let resolver = if config_path.exists() {
        let cfg = ProvidersConfig::load(&config_path)?;
        let resolver = ModelResolver::new(&cfg).context("build model resolver")?;
        tracing::info!("Loaded provider config from {}", config_path.display());
        Some(Arc::new(resolver))
    } else {
        tracing::info!(
            "No config at {} — local routes will return stub responses",
            config_path.display()
        );
        None
    };

    let proxy = Proxy::new(cert_cache, resolver, tunables, args.verbose)?;

    let listener = TcpListener::bind((args.bind.as_str(), args.port))
        .await
        .with_context(|| format!("listen on {}:{}", args.bind, args.port))?;
    let proxy_addr = listener.local_addr().context("local addr")?;
    tracing::info!("Proxy listening on {proxy_addr}");

    let serve_task = tokio::spawn(Arc::clone(&proxy).serve(listener));

    if args.proxy_only {
        tracing::info!("Running in proxy-only mode (Ctrl+C to stop)");
        tokio::signal::ctrl_c().await.context("wait for Ctrl+C")?;
        shutdown(&proxy, serve_task).await;
        return Ok(0);
    }

    // Launch the host CLI through the proxy.
    let status = tokio::process::Command::new("claude")
        .args(&args.child_args)
        .env("HTTPS_PROXY", format!("http://{proxy_addr}"))
        .env("NODE_EXTRA_CA_CERTS", &ca_cert_path)
        .status()
        .await;

    shutdown(&proxy, serve_task).await;

    match status {
        Ok(status) => Ok(status.code().unwrap_or(1)),
        Err(err) => {
            bail!("claude: {err}");
        }
    }
}

/// Wait briefly for in-flight tunnels to drain, then stop accepting.
async fn shutdown(proxy: &Arc<Proxy>, serve_task: tokio::task::JoinHandle<Result<()>>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while proxy.in_flight() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    serve_task.abort();
}

fn create_private_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    set_mode(path, 0o700)
}

/// Load the CA material, generating it on first run. A lock file keeps
/// concurrently starting instances from generating twice: the loser waits
/// for the certificate file to appear.
fn ensure_ca(certs_dir: &Path) -> Result<(String, String, PathBuf)> {
    let cert_path = certs_dir.join("ca.crt");
    let key_path = certs_dir.join("ca.key");

    if !cert_path.exists() {
        let lock_path = certs_dir.join("ca.lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Err(_) => {
                tracing::info!("Waiting for another instance to generate the CA certificate...");
                for _ in 0..50 {
                    std::thread::sleep(Duration::from_millis(100));
                    if cert_path.exists() {
                        break;
                    }
                }
                if !cert_path.exists() {
                    bail!("timed out waiting for CA certificate generation");
                }
            }
            Ok(lock) => {
                drop(lock);
                let result = generate_ca_files(&cert_path, &key_path);
                let _ = fs::remove_file(&lock_path);
                result?;
            }
        }
    }

    let cert_pem = fs::read_to_string(&cert_path)
        .with_context(|| format!("read CA cert {}", cert_path.display()))?;
    let key_pem = fs::read_to_string(&key_path)
        .with_context(|| format!("read CA key {}", key_path.display()))?;
    Ok((cert_pem, key_pem, cert_path))
}

fn generate_ca_files(cert_path: &Path, key_path: &Path) -> Result<()> {
    tracing::info!("Generating MITM CA certificate...");
    let (cert_pem, key_pem) = mitm::generate_ca()?;

    fs::write(key_path, key_pem).context("write CA key")?;
    set_mode(key_path, 0o600)?;
    // The cert is written last; waiting instances watch for this file.
    fs::write(cert_path, cert_pem).context("write CA cert")?;
    set_mode(cert_path, 0o644)?;

    tracing::info!("CA certificate written to {}", cert_path.display());
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
