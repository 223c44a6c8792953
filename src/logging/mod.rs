//! File logging with day-change rotation and secret redaction.
//!
//! The proxy logs to a single file under the base directory. At startup the
//! file is truncated if it was last written before today; a lock file keeps
//! concurrent instances from racing on the truncation.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing_subscriber::EnvFilter;

/// Initialize tracing to append to `log_path`. Returns after installing the
/// global subscriber; `verbose` lowers the default filter to debug.
pub fn init(log_path: &Path, session_id: &str, verbose: bool) -> Result<()> {
    if modified_before_today(log_path) {
        try_truncate(log_path);
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_target(false)
        .init();

    tracing::info!(session = %session_id, "logging started");
    Ok(())
}

/// True when the log file exists and was last modified before today.
fn modified_before_today(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    let modified: DateTime<Local> = modified.into();
    modified.date_naive() != Local::now().date_naive()
}

/// Truncate the log file, guarded by a lock file so concurrent instances do
/// not race. Failing to get the lock just skips the truncation.
fn try_truncate(path: &Path) {
    let lock_path = path.with_extension("log.lock");
    let Ok(_lock) = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    else {
        return;
    };

    // Re-check after acquiring the lock; another instance may have already
    // truncated.
    if modified_before_today(path) {
        if let Ok(f) = File::create(path) {
            drop(f);
        }
    }
    let _ = std::fs::remove_file(&lock_path);
}

fn bearer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)bearer\s+\S+").expect("static regex"))
}

fn api_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)(sk-|key-)[a-zA-Z0-9]{8,}").expect("static regex"))
}

/// Redact Bearer tokens and API key patterns from text destined for logs or
/// client-visible error messages.
pub fn sanitize_for_log(s: &str) -> String {
    let s = bearer_re().replace_all(s, "Bearer [REDACTED]");
    api_key_re().replace_all(&s, "$1[REDACTED]").into_owned()
}
