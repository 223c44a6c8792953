// CLI module - launcher argument parsing
//
// claude-relay starts the MITM routing proxy and launches the host CLI
// (claude) through it. Everything after `--` is handed to the child
// untouched.

use clap::Parser;
use std::path::PathBuf;

/// MITM routing proxy that runs Claude Code with hybrid local-model routing
#[derive(Debug, Parser)]
#[command(name = "claude-relay")]
#[command(version)]
#[command(about = "Runs Claude Code through a local routing proxy", long_about = None)]
pub struct Cli {
    /// Proxy listen port (0 = random)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Proxy bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,

    /// Directory for the CA certificate and key
    #[arg(long)]
    pub certs_dir: Option<PathBuf>,

    /// Run the proxy without launching the host CLI
    #[arg(long)]
    pub proxy_only: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    /// Arguments passed through to the child CLI
    #[arg(last = true)]
    pub child_args: Vec<String>,
}

/// `~/.claude-relay`, or a relative fallback when HOME is unset.
pub fn default_base_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".claude-relay"),
        None => PathBuf::from(".claude-relay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["claude-relay"]);
        assert_eq!(cli.port, 0);
        assert_eq!(cli.bind, "127.0.0.1");
        assert!(cli.certs_dir.is_none());
        assert!(!cli.proxy_only);
        assert!(!cli.verbose);
        assert!(cli.child_args.is_empty());
    }

    #[test]
    fn child_args_after_double_dash() {
        let cli = Cli::parse_from([
            "claude-relay",
            "--verbose",
            "--",
            "--dangerously-skip-permissions",
            "-p",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.child_args, vec!["--dangerously-skip-permissions", "-p"]);
    }

    #[test]
    fn explicit_flags() {
        let cli = Cli::parse_from([
            "claude-relay",
            "--port",
            "8443",
            "--bind",
            "0.0.0.0",
            "--certs-dir",
            "/tmp/certs",
            "--proxy-only",
        ]);
        assert_eq!(cli.port, 8443);
        assert_eq!(cli.bind, "0.0.0.0");
        assert_eq!(cli.certs_dir, Some(PathBuf::from("/tmp/certs")));
        assert!(cli.proxy_only);
    }
}
