//! Error types for tunnel, proxy, and redirection operations.
//!
//! Components surface these typed errors; the orchestrator is the only
//! place that decides which kinds are fatal and which are warnings.

use thiserror::Error;

use crate::process::ProcessIdentity;

/// Unified error type for all sockstun operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration. Always fatal, raised before any
    /// process is started.
    #[error("configuration error: {0}")]
    Config(String),

    /// A required port is already occupied and the conflict was not resolved.
    #[error("port {} is already in use{}", .port, owner_suffix(.owner))]
    PortInUse {
        /// The occupied port.
        port: u16,
        /// Owning process, when it could be identified.
        owner: Option<ProcessIdentity>,
    },

    /// SSH tunnel setup or supervision failed.
    #[error("SSH tunnel error: {0}")]
    Tunnel(String),

    /// Redsocks proxy setup or supervision failed.
    #[error("redsocks error: {0}")]
    Redsocks(String),

    /// iptables redirection setup or verification failed.
    #[error("iptables redirection error: {0}")]
    Redirection(String),

    /// The requested operation is not supported on this platform.
    #[error("platform not supported: {0}")]
    PlatformNotSupported(String),

    /// A connectivity probe failed. Diagnostic only, never fatal.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Underlying I/O failure while invoking an external tool.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn owner_suffix(owner: &Option<ProcessIdentity>) -> String {
    match owner {
        Some(identity) => format!(" by {identity}"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_in_use_with_owner() {
        let err = Error::PortInUse {
            port: 1080,
            owner: Some(ProcessIdentity {
                pid: 4242,
                name: Some("danted".to_string()),
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("1080"));
        assert!(msg.contains("4242"));
        assert!(msg.contains("danted"));
    }

    #[test]
    fn port_in_use_without_owner() {
        let err = Error::PortInUse {
            port: 5020,
            owner: None,
        };
        assert_eq!(err.to_string(), "port 5020 is already in use");
    }

    #[test]
    fn config_error_display() {
        let err = Error::Config("REDSOCKS_PORT must be between 1 and 65535".to_string());
        assert!(err.to_string().starts_with("configuration error:"));
    }
}
