//! iptables NAT chain management for transparent redirection.
//!
//! All rules live in one named chain (`REDSOCKS`) in the `nat` table plus a
//! single attachment rule in `OUTPUT`. Nothing outside that chain and its
//! attachment is ever touched, because the NAT table is shared process-wide
//! state.
//!
//! Rule order is significant: exclusions (SSH, loopback, the tunnel port in
//! both directions, reserved ranges) must precede the catch-all REDIRECT,
//! and the catch-all must exist before the chain is attached to OUTPUT, or
//! traffic gets redirected before the exclusions apply.

use std::process::Command;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::console::Reporter;
use crate::error::Error;
use crate::platform::Platform;

/// Name of the managed NAT chain.
pub const CHAIN_NAME: &str = "REDSOCKS";

/// Kernel modules the REDIRECT target needs.
const KERNEL_MODULES: [&str; 2] = ["iptable_nat", "xt_REDIRECT"];

/// Reserved and private ranges excluded from redirection, fixed order.
const EXCLUDED_NETWORKS: [&str; 8] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

/// What a rule does within the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// RETURN rule excluding a traffic class from redirection.
    Exclusion,
    /// The single catch-all REDIRECT to the redsocks port.
    Redirect,
}

/// One rule of the redirection rule set, as iptables arguments.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Arguments appended after `-A <chain>`.
    pub args: Vec<String>,
    /// Exclusion or catch-all.
    pub kind: RuleKind,
}

/// Build the ordered rule set for the chain.
///
/// Every exclusion precedes the catch-all redirect; the redirect is always
/// the final rule.
pub fn build_rules(redsocks_port: u16, tunnel_port: Option<u16>) -> Vec<Rule> {
    let exclusion = |args: Vec<String>| Rule {
        args,
        kind: RuleKind::Exclusion,
    };
    let tcp = |rest: &[&str]| {
        let mut args = vec!["-p".to_string(), "tcp".to_string()];
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    };

    let mut rules = vec![
        exclusion(tcp(&["--dport", "22", "-j", "RETURN"])),
        exclusion(tcp(&["-d", "localhost", "-j", "RETURN"])),
        exclusion(tcp(&["-d", "127.0.0.1", "-j", "RETURN"])),
    ];

    if let Some(port) = tunnel_port {
        let port = port.to_string();
        rules.push(exclusion(tcp(&["--dport", &port, "-j", "RETURN"])));
        rules.push(exclusion(tcp(&["--sport", &port, "-j", "RETURN"])));
    }

    for network in EXCLUDED_NETWORKS {
        rules.push(exclusion(vec![
            "-d".to_string(),
            network.to_string(),
            "-j".to_string(),
            "RETURN".to_string(),
        ]));
    }

    rules.push(Rule {
        args: tcp(&["-j", "REDIRECT", "--to-port", &redsocks_port.to_string()]),
        kind: RuleKind::Redirect,
    });
    rules
}

/// Packet/byte counters of one rule, parsed from a chain listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStats {
    /// Packets matched.
    pub packets: u64,
    /// Bytes matched.
    pub bytes: u64,
    /// The listing line the counters came from.
    pub raw: String,
}

/// Counters for the whole managed chain.
#[derive(Debug, Clone, Default)]
pub struct ChainStats {
    /// Whether the chain exists at all.
    pub chain_exists: bool,
    /// Per-REDIRECT-rule counters.
    pub rules: Vec<RuleStats>,
    /// Sum of packets across redirect rules.
    pub total_packets: u64,
    /// Sum of bytes across redirect rules.
    pub total_bytes: u64,
}

/// Installs and removes the redirection rule set.
pub struct RedirectionManager {
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for RedirectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectionManager").finish_non_exhaustive()
    }
}

impl RedirectionManager {
    /// Build a manager. Fails off-Linux: the NAT chain machinery does not
    /// exist elsewhere.
    pub fn new(platform: Platform, reporter: Arc<dyn Reporter>) -> Result<Self, Error> {
        if !platform.supports_transparent_proxy() {
            return Err(Error::PlatformNotSupported(
                "iptables redirection requires Linux".to_string(),
            ));
        }
        Ok(Self { reporter })
    }

    /// Install the full rule set.
    ///
    /// Atomic from the caller's view: any fatal mid-install failure triggers
    /// a best-effort full [`cleanup`](Self::cleanup) before the error
    /// propagates, so a half-applied, traffic-dropping chain never survives.
    pub fn setup(&self, redsocks_port: u16, tunnel_port: Option<u16>) -> Result<(), Error> {
        info!("Setting up iptables redirection to port {redsocks_port}");

        let result = self.setup_inner(redsocks_port, tunnel_port);
        if let Err(e) = result {
            warn!("iptables setup failed, removing partial rule set: {e}");
            self.cleanup();
            return Err(e);
        }

        self.reporter.success("iptables rules configured");
        info!("iptables redirection setup completed");
        Ok(())
    }

    fn setup_inner(&self, redsocks_port: u16, tunnel_port: Option<u16>) -> Result<(), Error> {
        self.load_kernel_modules();
        self.verify_nat_support()?;
        self.remove_existing_chain();
        self.create_chain()?;
        self.append_rules(redsocks_port, tunnel_port)?;
        self.attach_to_output()?;
        self.verify_installed()
    }

    /// Remove everything this manager may have installed.
    ///
    /// Each step is independently best-effort so cleanup is callable from
    /// any failure path without itself failing: detach from OUTPUT, flush
    /// the chain, delete the chain.
    pub fn cleanup(&self) {
        info!("Cleaning up iptables rules");

        run_unchecked(&["-t", "nat", "-D", "OUTPUT", "-p", "tcp", "-j", CHAIN_NAME]);
        run_unchecked(&["-t", "nat", "-F", CHAIN_NAME]);
        run_unchecked(&["-t", "nat", "-X", CHAIN_NAME]);

        self.reporter.success("iptables rules cleaned up");
        info!("iptables cleanup completed");
    }

    /// Parse per-rule counters from the chain listing.
    ///
    /// A missing chain is a structured result, not an error.
    pub fn stats(&self) -> ChainStats {
        match iptables_listing(&["-t", "nat", "-L", CHAIN_NAME, "-v", "-n"]) {
            Ok(listing) => parse_chain_stats(&listing),
            Err(_) => ChainStats::default(),
        }
    }

    /// Whether the managed chain currently exists.
    pub fn chain_exists(&self) -> bool {
        iptables_listing(&["-t", "nat", "-L", CHAIN_NAME]).is_ok()
    }

    /// Best-effort modprobe of REDIRECT prerequisites. Absence is logged,
    /// not fatal; later steps fail loudly if the kernel truly lacks support.
    fn load_kernel_modules(&self) {
        for module in KERNEL_MODULES {
            match Command::new("modprobe").arg(module).output() {
                Ok(output) if output.status.success() => {
                    debug!("Loaded kernel module {module}");
                }
                Ok(_) | Err(_) => warn!("Could not load kernel module {module}"),
            }
        }
    }

    /// The NAT table must be reachable; a hard prerequisite.
    fn verify_nat_support(&self) -> Result<(), Error> {
        iptables_listing(&["-t", "nat", "-L"]).map_err(|_| {
            Error::Redirection(
                "NAT table not available in iptables; ensure kernel modules are loaded".to_string(),
            )
        })?;
        Ok(())
    }

    /// Idempotent pre-clean: a chain surviving a prior run is detached,
    /// flushed, and deleted before the fresh install.
    fn remove_existing_chain(&self) {
        if !self.chain_exists() {
            return;
        }
        info!("Cleaning up existing {CHAIN_NAME} rules from a prior run");
        run_unchecked(&["-t", "nat", "-D", "OUTPUT", "-p", "tcp", "-j", CHAIN_NAME]);
        run_unchecked(&["-t", "nat", "-F", CHAIN_NAME]);
        run_unchecked(&["-t", "nat", "-X", CHAIN_NAME]);
    }

    fn create_chain(&self) -> Result<(), Error> {
        run_checked(&["-t", "nat", "-N", CHAIN_NAME])
            .map_err(|e| Error::Redirection(format!("failed to create chain {CHAIN_NAME}: {e}")))?;
        debug!("Created {CHAIN_NAME} chain");
        Ok(())
    }

    /// Append exclusions (individually best-effort) then the catch-all
    /// (fatal on failure).
    fn append_rules(&self, redsocks_port: u16, tunnel_port: Option<u16>) -> Result<(), Error> {
        for rule in build_rules(redsocks_port, tunnel_port) {
            let mut args: Vec<&str> = vec!["-t", "nat", "-A", CHAIN_NAME];
            args.extend(rule.args.iter().map(String::as_str));

            match rule.kind {
                RuleKind::Exclusion => match run_checked(&args) {
                    Ok(()) => debug!("Added exclusion rule: {}", rule.args.join(" ")),
                    Err(e) => {
                        warn!("Failed to add exclusion rule {}: {e}", rule.args.join(" "))
                    }
                },
                RuleKind::Redirect => {
                    run_checked(&args).map_err(|e| {
                        Error::Redirection(format!(
                            "failed to add redirection rule to port {redsocks_port}: {e}"
                        ))
                    })?;
                    debug!("Added redirection rule to port {redsocks_port}");
                }
            }
        }
        Ok(())
    }

    fn attach_to_output(&self) -> Result<(), Error> {
        run_checked(&["-t", "nat", "-A", "OUTPUT", "-p", "tcp", "-j", CHAIN_NAME])
            .map_err(|e| Error::Redirection(format!("failed to attach {CHAIN_NAME} to OUTPUT: {e}")))?;
        debug!("Attached {CHAIN_NAME} chain to OUTPUT");
        Ok(())
    }

    /// Post-install verification: chain referenced from OUTPUT and a
    /// REDIRECT rule inside the chain. Either absence is fatal.
    fn verify_installed(&self) -> Result<(), Error> {
        let output_listing = iptables_listing(&["-t", "nat", "-L", "OUTPUT"])?;
        if !output_listing.contains(CHAIN_NAME) {
            return Err(Error::Redirection(format!(
                "{CHAIN_NAME} chain not found in OUTPUT chain"
            )));
        }

        let chain_listing = iptables_listing(&["-t", "nat", "-L", CHAIN_NAME])?;
        if !chain_listing.contains("REDIRECT") {
            return Err(Error::Redirection(format!(
                "REDIRECT rule not found in {CHAIN_NAME} chain"
            )));
        }

        debug!("iptables rules verification passed");
        Ok(())
    }
}

/// Run iptables and return stdout; non-zero exit is an error.
pub(crate) fn iptables_listing(args: &[&str]) -> Result<String, Error> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| Error::Redirection(format!("iptables {} failed to run: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(Error::Redirection(format!(
            "iptables {} exited with {}",
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run iptables for effect; non-zero exit is an error carrying stderr.
fn run_checked(args: &[&str]) -> Result<(), Error> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| Error::Redirection(format!("iptables {} failed to run: {e}", args.join(" "))))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Redirection(format!(
            "iptables {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Run iptables ignoring the outcome (cleanup paths).
fn run_unchecked(args: &[&str]) {
    match Command::new("iptables").args(args).output() {
        Ok(output) if !output.status.success() => {
            debug!("iptables {} exited with {}", args.join(" "), output.status);
        }
        Ok(_) => {}
        Err(e) => debug!("iptables {} failed to run: {e}", args.join(" ")),
    }
}

/// Extract REDIRECT counters from a `-L <chain> -v -n` listing.
///
/// Lines that do not parse (headers, truncated counters like `1024K`) are
/// skipped rather than failing the whole parse.
pub fn parse_chain_stats(listing: &str) -> ChainStats {
    let mut stats = ChainStats {
        chain_exists: true,
        ..ChainStats::default()
    };

    for line in listing.lines() {
        if !line.contains("REDIRECT") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        let (Ok(packets), Ok(bytes)) = (fields[0].parse::<u64>(), fields[1].parse::<u64>()) else {
            continue;
        };
        stats.total_packets += packets;
        stats.total_bytes += bytes;
        stats.rules.push(RuleStats {
            packets,
            bytes,
            raw: line.trim().to_string(),
        });
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturingReporter;

    #[test]
    fn every_exclusion_precedes_the_redirect() {
        let rules = build_rules(5020, Some(1080));
        let redirect_index = rules
            .iter()
            .position(|r| r.kind == RuleKind::Redirect)
            .unwrap();

        for (index, rule) in rules.iter().enumerate() {
            if rule.kind == RuleKind::Exclusion {
                assert!(
                    index < redirect_index,
                    "exclusion at {index} after redirect at {redirect_index}"
                );
            }
        }
        assert_eq!(redirect_index, rules.len() - 1);
        assert_eq!(
            rules.iter().filter(|r| r.kind == RuleKind::Redirect).count(),
            1
        );
    }

    #[test]
    fn rule_set_contents() {
        let rules = build_rules(5020, Some(1080));

        // ssh first, then loopback
        assert_eq!(rules[0].args, ["-p", "tcp", "--dport", "22", "-j", "RETURN"]);
        assert!(rules[1].args.contains(&"localhost".to_string()));
        assert!(rules[2].args.contains(&"127.0.0.1".to_string()));

        // tunnel port excluded in both directions
        let joined: Vec<String> = rules.iter().map(|r| r.args.join(" ")).collect();
        assert!(joined.iter().any(|r| r.contains("--dport 1080")));
        assert!(joined.iter().any(|r| r.contains("--sport 1080")));

        // all reserved ranges present
        for network in EXCLUDED_NETWORKS {
            assert!(joined.iter().any(|r| r.contains(network)), "missing {network}");
        }

        // catch-all targets the redsocks port
        let redirect = rules.last().unwrap();
        assert_eq!(
            redirect.args,
            ["-p", "tcp", "-j", "REDIRECT", "--to-port", "5020"]
        );
    }

    #[test]
    fn no_tunnel_port_means_no_port_exclusions() {
        let rules = build_rules(5020, None);
        let joined: Vec<String> = rules.iter().map(|r| r.args.join(" ")).collect();
        assert!(!joined.iter().any(|r| r.contains("--sport")));
        assert!(joined.iter().any(|r| r.contains("--dport 22")));
    }

    #[test]
    fn chain_stats_parser_sums_redirect_counters() {
        let listing = "\
Chain REDSOCKS (1 references)
 pkts bytes target     prot opt in     out     source               destination
    0     0 RETURN     tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            tcp dpt:22
    3   180 RETURN     all  --  *      *       0.0.0.0/0            10.0.0.0/8
   12   720 REDIRECT   tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            redir ports 5020
    5   300 REDIRECT   tcp  --  *      *       0.0.0.0/0            0.0.0.0/0            redir ports 5021
";
        let stats = parse_chain_stats(listing);
        assert!(stats.chain_exists);
        assert_eq!(stats.rules.len(), 2);
        assert_eq!(stats.total_packets, 17);
        assert_eq!(stats.total_bytes, 1020);
        assert_eq!(stats.rules[0].packets, 12);
    }

    #[test]
    fn chain_stats_parser_skips_unparseable_lines() {
        let listing = "\
 pkts bytes target
 102K   61M REDIRECT   tcp  --  *  *  0.0.0.0/0  0.0.0.0/0  redir ports 5020
 REDIRECT garbage
    7   420 REDIRECT   tcp  --  *  *  0.0.0.0/0  0.0.0.0/0  redir ports 5020
";
        let stats = parse_chain_stats(listing);
        // the K/M-suffixed and malformed lines are skipped, not fatal
        assert_eq!(stats.rules.len(), 1);
        assert_eq!(stats.total_packets, 7);
    }

    #[test]
    fn manager_requires_linux() {
        let reporter = Arc::new(CapturingReporter::new());
        let err = RedirectionManager::new(Platform::MacOs, reporter).unwrap_err();
        assert!(matches!(err, Error::PlatformNotSupported(_)));
    }

    // Integration tests against the live NAT table.
    #[test]
    #[ignore = "requires root and iptables"]
    fn setup_then_cleanup_leaves_no_chain() {
        let reporter = Arc::new(CapturingReporter::new());
        let manager = RedirectionManager::new(Platform::Linux, reporter).unwrap();

        manager.setup(5020, Some(1080)).unwrap();
        assert!(manager.chain_exists());

        let stats = manager.stats();
        assert!(stats.chain_exists);
        assert!(!stats.rules.is_empty());

        manager.cleanup();
        assert!(!manager.chain_exists());

        // second cleanup is a no-op
        manager.cleanup();
        assert!(!manager.chain_exists());
    }

    #[test]
    #[ignore = "requires root and iptables"]
    fn setup_twice_is_idempotent() {
        let reporter = Arc::new(CapturingReporter::new());
        let manager = RedirectionManager::new(Platform::Linux, reporter).unwrap();

        manager.setup(5020, Some(1080)).unwrap();
        let first = manager.stats().rules.len();
        manager.setup(5020, Some(1080)).unwrap();
        let second = manager.stats().rules.len();
        assert_eq!(first, second);

        manager.cleanup();
    }
}
