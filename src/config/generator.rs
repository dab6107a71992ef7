//! Redsocks configuration artifact generation.
//!
//! The artifact schema is fixed: listen on `0.0.0.0:<redsocks_port>`,
//! forward to the SOCKS5 endpoint exposed by the tunnel, log to
//! [`REDSOCKS_LOG_PATH`], daemonize. The file is re-read and token-checked
//! before the daemon is invoked so a truncated or mangled write fails here
//! instead of as an opaque redsocks startup error.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{error, info};

use crate::error::Error;

/// Default location of the generated redsocks configuration.
pub const REDSOCKS_CONFIG_PATH: &str = "/etc/redsocks.conf";

/// Fixed log destination written into the artifact; tailed by the monitor.
pub const REDSOCKS_LOG_PATH: &str = "/var/log/redsocks.log";

/// Render and persist the redsocks configuration, mode `rw-r--r--`.
pub fn write_redsocks_config(
    config_path: &Path,
    redsocks_port: u16,
    proxy_ip: &str,
    proxy_port: u16,
) -> Result<(), Error> {
    info!("Generating redsocks configuration at {}", config_path.display());

    let content = format!(
        "base {{
    log_debug = off;
    log_info = on;
    log = \"file:{REDSOCKS_LOG_PATH}\";
    daemon = on;
    redirector = iptables;
}}

redsocks {{
    local_ip = 0.0.0.0;
    local_port = {redsocks_port};
    ip = {proxy_ip};
    port = {proxy_port};
    type = socks5;
}}
"
    );

    let write = || -> std::io::Result<()> {
        if let Some(dir) = config_path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(config_path, &content)?;
        fs::set_permissions(config_path, fs::Permissions::from_mode(0o644))
    };

    write().map_err(|e| {
        error!("Failed to generate redsocks configuration: {e}");
        Error::Config(format!(
            "failed to generate redsocks configuration at {}: {e}",
            config_path.display()
        ))
    })?;

    info!("Redsocks configuration written to {}", config_path.display());
    Ok(())
}

/// Re-read the persisted artifact and assert the required tokens are present.
///
/// Catches configuration corruption before the external daemon fails
/// opaquely on it.
pub fn validate_redsocks_config(config_path: &Path) -> Result<(), Error> {
    let content = fs::read_to_string(config_path).map_err(|e| {
        Error::Config(format!(
            "cannot read redsocks configuration {}: {e}",
            config_path.display()
        ))
    })?;

    for token in ["socks5", "local_port", "ip", "port"] {
        if !content.contains(token) {
            return Err(Error::Config(format!(
                "'{token}' not configured in {}",
                config_path.display()
            )));
        }
    }

    info!("Redsocks configuration validation passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_artifact_contains_schema_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redsocks.conf");

        write_redsocks_config(&path, 5020, "127.0.0.1", 1080).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("local_ip = 0.0.0.0;"));
        assert!(content.contains("local_port = 5020;"));
        assert!(content.contains("ip = 127.0.0.1;"));
        assert!(content.contains("port = 1080;"));
        assert!(content.contains("type = socks5;"));
        assert!(content.contains("daemon = on;"));
        assert!(content.contains(REDSOCKS_LOG_PATH));

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn validation_accepts_generated_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redsocks.conf");
        write_redsocks_config(&path, 5020, "127.0.0.1", 1080).unwrap();
        validate_redsocks_config(&path).unwrap();
    }

    #[test]
    fn validation_rejects_missing_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("redsocks.conf");
        fs::write(&path, "base { daemon = on; }\n").unwrap();

        let err = validate_redsocks_config(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("socks5"));
    }

    #[test]
    fn validation_rejects_missing_file() {
        let err = validate_redsocks_config(Path::new("/nonexistent/redsocks.conf")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
