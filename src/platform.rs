//! Platform detection, privilege checks, and external tool discovery.

use std::process::Command;

use tracing::{error, info, warn};

use crate::console::{ask_confirmation, Reporter};
use crate::error::Error;

/// Host platform class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Linux: full transparent-proxy support.
    Linux,
    /// macOS: SOCKS-only mode.
    MacOs,
    /// Windows: SOCKS-only mode.
    Windows,
    /// Anything else: SOCKS-only mode.
    Unknown,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Detect the current platform.
pub fn detect() -> Platform {
    match std::env::consts::OS {
        "linux" => Platform::Linux,
        "macos" => Platform::MacOs,
        "windows" => Platform::Windows,
        _ => Platform::Unknown,
    }
}

impl Platform {
    /// Whether kernel-level traffic redirection is available here.
    pub fn supports_transparent_proxy(self) -> bool {
        self == Platform::Linux
    }
}

/// Whether we run with root privileges.
pub fn is_admin() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Availability of every tool this system may invoke.
///
/// `required` marks the tools startup cannot proceed without on this
/// platform; the rest are best-effort helpers.
#[derive(Debug, Clone)]
pub struct ToolStatus {
    /// Tool binary name.
    pub name: &'static str,
    /// Found in PATH.
    pub available: bool,
    /// Startup fails when this is missing.
    pub required: bool,
}

/// Probe the PATH for every external tool the platform needs.
pub fn check_required_tools(platform: Platform, password_auth: bool) -> Vec<ToolStatus> {
    let mut tools = vec![ToolStatus {
        name: "ssh",
        available: tool_available("ssh"),
        required: true,
    }];

    if platform == Platform::Linux {
        for name in ["iptables", "redsocks"] {
            tools.push(ToolStatus {
                name,
                available: tool_available(name),
                required: true,
            });
        }
        for name in ["lsof", "netstat"] {
            tools.push(ToolStatus {
                name,
                available: tool_available(name),
                required: false,
            });
        }
    }

    tools.push(ToolStatus {
        name: "sshpass",
        available: tool_available("sshpass"),
        required: password_auth,
    });

    tools
}

/// Whether `name` resolves in PATH.
pub fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Attempt to install missing required tools via apt-get.
///
/// Consults the operator first unless running headless (headless runs
/// never install anything).
pub fn install_missing_tools(
    missing: &[&'static str],
    headless: bool,
    reporter: &dyn Reporter,
) -> Result<(), Error> {
    if missing.is_empty() {
        return Ok(());
    }
    if detect() != Platform::Linux {
        return Err(Error::PlatformNotSupported(
            "automatic tool installation is only supported on Linux".to_string(),
        ));
    }

    reporter.warning(&format!("Missing required tools: {}", missing.join(", ")));
    let proceed = !headless
        && ask_confirmation("Attempt to install missing tools with apt-get?", true)
            .unwrap_or(false);
    if !proceed {
        return Err(Error::Config(format!(
            "required tools not available: {}",
            missing.join(", ")
        )));
    }

    info!("Installing missing tools: {missing:?}");
    run_apt(&["update"])?;
    for tool in missing {
        let package = match *tool {
            "netstat" => "net-tools",
            other => other,
        };
        reporter.step(&format!("Installing {package}"));
        run_apt(&["install", "-y", package])?;
    }

    reporter.success("Missing tools installed");
    Ok(())
}

fn run_apt(args: &[&str]) -> Result<(), Error> {
    let status = Command::new("apt-get").args(args).status().map_err(|e| {
        error!("apt-get {args:?} failed to run: {e}");
        Error::Config(format!("apt-get {} failed to run: {e}", args.join(" ")))
    })?;
    if !status.success() {
        warn!("apt-get {args:?} exited with {status}");
        return Err(Error::Config(format!(
            "apt-get {} exited with {status}",
            args.join(" ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_a_known_platform() {
        // The test environment is one of the named platforms.
        let platform = detect();
        assert!(platform.supports_transparent_proxy() || platform != Platform::Linux);
    }

    #[test]
    fn transparent_proxy_is_linux_only() {
        assert!(Platform::Linux.supports_transparent_proxy());
        assert!(!Platform::MacOs.supports_transparent_proxy());
        assert!(!Platform::Windows.supports_transparent_proxy());
        assert!(!Platform::Unknown.supports_transparent_proxy());
    }

    #[test]
    fn ssh_is_always_required() {
        let tools = check_required_tools(Platform::MacOs, false);
        let ssh = tools.iter().find(|t| t.name == "ssh").unwrap();
        assert!(ssh.required);
    }

    #[test]
    fn sshpass_required_only_for_password_auth() {
        let tools = check_required_tools(Platform::Linux, false);
        assert!(!tools.iter().find(|t| t.name == "sshpass").unwrap().required);

        let tools = check_required_tools(Platform::Linux, true);
        assert!(tools.iter().find(|t| t.name == "sshpass").unwrap().required);
    }

    #[test]
    fn linux_requires_redirection_tools() {
        let tools = check_required_tools(Platform::Linux, false);
        for name in ["iptables", "redsocks"] {
            assert!(tools.iter().find(|t| t.name == name).unwrap().required);
        }
        // lsof/netstat are best-effort helpers
        for name in ["lsof", "netstat"] {
            assert!(!tools.iter().find(|t| t.name == name).unwrap().required);
        }
    }

    #[test]
    fn which_finds_sh() {
        assert!(tool_available("sh"));
        assert!(!tool_available("definitely-not-a-real-tool-42"));
    }
}
