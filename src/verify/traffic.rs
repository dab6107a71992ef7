//! Redirection-specific verification.
//!
//! Unlike the generic connectivity suite, [`TrafficVerifier::verify_redirection`]
//! is a hard check: the orchestrator treats its failure as fatal.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::console::Reporter;
use crate::redirect::{iptables_listing, parse_chain_stats, ChainStats, CHAIN_NAME};

/// Outcome of the redirection hard check.
#[derive(Debug, Clone)]
pub struct RedirectionCheck {
    /// Chain attached and a REDIRECT rule with the expected port present.
    pub success: bool,
    /// The chain is referenced from OUTPUT.
    pub chain_exists: bool,
    /// A REDIRECT rule targeting the expected port exists in the chain.
    pub rules_configured: bool,
    /// Packets matched by that rule so far.
    pub packets_redirected: u64,
    /// Bytes matched by that rule so far.
    pub bytes_redirected: u64,
    /// Failure detail.
    pub error: Option<String>,
}

impl RedirectionCheck {
    fn failed(error: String) -> Self {
        Self {
            success: false,
            chain_exists: false,
            rules_configured: false,
            packets_redirected: 0,
            bytes_redirected: 0,
            error: Some(error),
        }
    }
}

/// Active connections through the redsocks port.
#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    /// netstat ran and was parsed.
    pub success: bool,
    /// Connection count on the port.
    pub total_connections: usize,
    /// The matching netstat lines.
    pub connections: Vec<String>,
    /// Failure detail.
    pub error: Option<String>,
}

/// Counter deltas across an observation window.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    /// Both counter reads succeeded.
    pub success: bool,
    /// Observation window.
    pub duration: Duration,
    /// Packets redirected during the window.
    pub packets_transferred: u64,
    /// Bytes redirected during the window.
    pub bytes_transferred: u64,
    /// Failure detail.
    pub error: Option<String>,
}

/// Verifies that traffic is actually being redirected through the chain.
pub struct TrafficVerifier {
    reporter: Arc<dyn Reporter>,
}

impl TrafficVerifier {
    /// Build a verifier.
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self { reporter }
    }

    /// The hard redirection check: chain referenced from OUTPUT, and a
    /// REDIRECT rule with `redir ports <redsocks_port>` inside the chain.
    pub fn verify_redirection(&self, redsocks_port: u16) -> RedirectionCheck {
        info!("Verifying iptables redirection");

        let output_listing = match iptables_listing(&["-t", "nat", "-L", "OUTPUT", "-v", "-n"]) {
            Ok(listing) => listing,
            Err(e) => {
                self.reporter.error(&format!("iptables verification failed: {e}"));
                return RedirectionCheck::failed(e.to_string());
            }
        };

        if !output_listing.contains(CHAIN_NAME) {
            self.reporter
                .error(&format!("{CHAIN_NAME} chain not found in iptables OUTPUT"));
            return RedirectionCheck::failed(format!("{CHAIN_NAME} chain not found in OUTPUT"));
        }
        self.reporter
            .success(&format!("iptables {CHAIN_NAME} chain configured"));

        let chain_listing = match iptables_listing(&["-t", "nat", "-L", CHAIN_NAME, "-v", "-n"]) {
            Ok(listing) => listing,
            Err(e) => {
                self.reporter.error(&format!("iptables verification failed: {e}"));
                return RedirectionCheck {
                    chain_exists: true,
                    ..RedirectionCheck::failed(e.to_string())
                };
            }
        };

        match find_redirect_counters(&chain_listing, redsocks_port) {
            Some((packets, bytes)) => {
                self.reporter.success(&format!(
                    "Traffic redirection rule found ({packets} packets)"
                ));
                RedirectionCheck {
                    success: true,
                    chain_exists: true,
                    rules_configured: true,
                    packets_redirected: packets,
                    bytes_redirected: bytes,
                    error: None,
                }
            }
            None => {
                self.reporter.error("Traffic redirection rule not found");
                RedirectionCheck {
                    chain_exists: true,
                    ..RedirectionCheck::failed(format!(
                        "REDIRECT rule to port {redsocks_port} not found"
                    ))
                }
            }
        }
    }

    /// Count active connections through the redsocks port via `netstat -tpn`.
    pub fn active_connections(&self, redsocks_port: u16) -> ConnectionCheck {
        info!("Checking active connections to redsocks port {redsocks_port}");

        let output = match Command::new("netstat").arg("-tpn").output() {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                let error = format!("netstat exited with {}", output.status);
                self.reporter.error(&format!("Connection check failed: {error}"));
                return ConnectionCheck {
                    success: false,
                    total_connections: 0,
                    connections: Vec::new(),
                    error: Some(error),
                };
            }
            Err(e) => {
                error!("netstat failed to run: {e}");
                return ConnectionCheck {
                    success: false,
                    total_connections: 0,
                    connections: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let needle = format!(":{redsocks_port}");
        let connections: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.contains(&needle))
            .map(|line| line.trim().to_string())
            .collect();

        if connections.is_empty() {
            self.reporter
                .warning("No active connections through redsocks detected");
        } else {
            self.reporter.success(&format!(
                "{} active connections through redsocks",
                connections.len()
            ));
        }

        ConnectionCheck {
            success: true,
            total_connections: connections.len(),
            connections,
            error: None,
        }
    }

    /// Observe counter movement over `duration` to confirm live redirection.
    pub fn sample_traffic(&self, duration: Duration) -> TrafficSample {
        info!("Sampling redirected traffic for {duration:?}");

        let before = self.chain_stats();
        self.reporter
            .info(&format!("Monitoring traffic for {}s...", duration.as_secs()));
        std::thread::sleep(duration);
        let after = self.chain_stats();

        if !before.chain_exists || !after.chain_exists {
            return TrafficSample {
                success: false,
                duration,
                packets_transferred: 0,
                bytes_transferred: 0,
                error: Some("failed to read iptables statistics".to_string()),
            };
        }

        let packets = after.total_packets.saturating_sub(before.total_packets);
        let bytes = after.total_bytes.saturating_sub(before.total_bytes);
        self.reporter.success(&format!(
            "Traffic sample complete: {packets} packets, {bytes} bytes redirected"
        ));
        TrafficSample {
            success: true,
            duration,
            packets_transferred: packets,
            bytes_transferred: bytes,
            error: None,
        }
    }

    fn chain_stats(&self) -> ChainStats {
        match iptables_listing(&["-t", "nat", "-L", CHAIN_NAME, "-v", "-n"]) {
            Ok(listing) => parse_chain_stats(&listing),
            Err(_) => ChainStats::default(),
        }
    }
}

/// Counters of the REDIRECT rule targeting `port`, if present.
fn find_redirect_counters(chain_listing: &str, port: u16) -> Option<(u64, u64)> {
    let needle = format!("redir ports {port}");
    for line in chain_listing.lines() {
        if !line.contains("REDIRECT") || !line.contains(&needle) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        // counters may be K/M-suffixed with -v; treat those as zero reads
        let packets = fields[0].parse().unwrap_or(0);
        let bytes = fields[1].parse().unwrap_or(0);
        return Some((packets, bytes));
    }
    None
}
