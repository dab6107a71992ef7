//! Environment variable loading.
//!
//! Required variables: `REMOTE_HOST`, `SSH_USER`, `SSH_AUTH_METHOD`
//! (`key` | `password`), `SSH_AUTH_VALUE`, `SSH_TUNNEL_PORT`,
//! `REDSOCKS_PORT`. Missing or invalid values fail fast, before any
//! external process is started.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::settings::{AppConfig, AuthMethod, ProxyConfig, TunnelConfig};
use crate::error::Error;

/// Load and validate configuration from environment variables.
///
/// When `env_file` is given it is loaded first (and must exist); otherwise
/// a `.env` in the working directory is picked up when present. Real
/// environment variables take precedence over file entries.
pub fn load_environment_config(env_file: Option<&Path>) -> Result<AppConfig, Error> {
    match env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| Error::Config(format!("cannot load env file {}: {e}", path.display())))?;
            debug!("Loaded environment from {}", path.display());
        }
        None => {
            if dotenvy::dotenv().is_ok() {
                debug!("Loaded .env from working directory");
            }
        }
    }

    info!("Loading configuration from environment variables");

    let tunnel_port = parse_port(&required_var("SSH_TUNNEL_PORT")?, "SSH_TUNNEL_PORT")?;
    let redsocks_port = parse_port(&required_var("REDSOCKS_PORT")?, "REDSOCKS_PORT")?;

    let auth_method = required_var("SSH_AUTH_METHOD")?;
    let auth_value = required_var("SSH_AUTH_VALUE")?;
    let auth = match auth_method.as_str() {
        "key" => AuthMethod::Key(PathBuf::from(auth_value)),
        "password" => AuthMethod::Password(auth_value),
        other => {
            return Err(Error::Config(format!(
                "SSH_AUTH_METHOD must be 'password' or 'key', got '{other}'"
            )))
        }
    };

    let config = AppConfig {
        tunnel: TunnelConfig {
            remote_host: required_var("REMOTE_HOST")?,
            ssh_user: required_var("SSH_USER")?,
            auth,
            tunnel_port,
        },
        proxy: ProxyConfig { redsocks_port },
    };

    config.validate()?;
    info!("Configuration loaded and validated");
    Ok(config)
}

fn required_var(key: &str) -> Result<String, Error> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::Config(format!(
            "missing required environment variable: {key}"
        ))),
    }
}

fn parse_port(value: &str, key: &str) -> Result<u16, Error> {
    let port: u16 = value
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a port number, got '{value}'")))?;
    if port == 0 {
        return Err(Error::Config(format!("{key} must be between 1 and 65535")));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_rejects_garbage() {
        assert!(parse_port("1080", "SSH_TUNNEL_PORT").is_ok());
        assert!(parse_port("0", "SSH_TUNNEL_PORT").is_err());
        assert!(parse_port("65536", "SSH_TUNNEL_PORT").is_err());
        assert!(parse_port("socks", "SSH_TUNNEL_PORT").is_err());
        assert!(parse_port("-1", "SSH_TUNNEL_PORT").is_err());
    }

    #[test]
    fn missing_env_file_is_an_error() {
        let err =
            load_environment_config(Some(Path::new("/nonexistent/sockstun.env"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
