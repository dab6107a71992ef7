//! Command-line interface definitions.
//!
//! Uses clap's derive API for type-safe argument parsing.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::process::{AutoPolicy, ConflictPolicy, InteractivePolicy};

/// Transparent SOCKS5 tunneling over SSH.
///
/// sockstun opens an SSH tunnel exposing a local SOCKS5 endpoint and, on
/// Linux, redirects all outbound TCP traffic through it via redsocks and
/// iptables. Configuration comes from environment variables (REMOTE_HOST,
/// SSH_USER, SSH_AUTH_METHOD, SSH_AUTH_VALUE, SSH_TUNNEL_PORT,
/// REDSOCKS_PORT), optionally loaded from a .env file.
#[derive(Parser, Debug)]
#[command(name = "sockstun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a .env file to load configuration from.
    ///
    /// Without this flag, a `.env` in the working directory is used when
    /// present. Real environment variables always win over file entries.
    #[arg(short = 'e', long = "env-file", value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Run without interactive prompts.
    ///
    /// Port conflicts are rejected instead of prompting (including
    /// conflicts with unidentifiable owners) and missing tools are never
    /// installed. Intended for CI and unattended use.
    #[arg(long)]
    pub headless: bool,

    /// Terminate processes occupying required ports without asking.
    ///
    /// Overrides the interactive confirmation; combine with --headless for
    /// fully unattended startup that reclaims its ports.
    #[arg(long = "kill-conflicts")]
    pub kill_conflicts: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// The conflict policy implied by the flags.
    pub fn conflict_policy(&self) -> Arc<dyn ConflictPolicy> {
        if self.kill_conflicts {
            Arc::new(AutoPolicy::accept_all())
        } else if self.headless {
            Arc::new(AutoPolicy::reject_all())
        } else {
            Arc::new(InteractivePolicy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let cli = Cli::parse_from(["sockstun"]);
        assert!(cli.env_file.is_none());
        assert!(!cli.headless);
        assert!(!cli.kill_conflicts);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parse_all_flags() {
        let cli = Cli::parse_from([
            "sockstun",
            "-e",
            "/etc/sockstun.env",
            "--headless",
            "--kill-conflicts",
            "-vv",
        ]);
        assert_eq!(cli.env_file, Some(PathBuf::from("/etc/sockstun.env")));
        assert!(cli.headless);
        assert!(cli.kill_conflicts);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn kill_conflicts_wins_over_headless() {
        let cli = Cli::parse_from(["sockstun", "--headless", "--kill-conflicts"]);
        let policy = cli.conflict_policy();
        assert!(policy.should_resolve(1080, None));
    }

    #[test]
    fn headless_rejects_conflicts() {
        let cli = Cli::parse_from(["sockstun", "--headless"]);
        let policy = cli.conflict_policy();
        assert!(!policy.should_resolve(1080, None));
    }
}
