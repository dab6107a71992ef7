//! Configuration loading, validation, and artifact generation.
//!
//! Configuration is environment-sourced (optionally from a `.env` file) and
//! validated before any external process is started. The redsocks
//! configuration artifact is rendered here and re-validated before the
//! daemon is invoked.

mod env;
mod generator;
mod settings;

pub use env::load_environment_config;
pub use generator::{validate_redsocks_config, write_redsocks_config, REDSOCKS_CONFIG_PATH, REDSOCKS_LOG_PATH};
pub use settings::{AppConfig, AuthMethod, ProxyConfig, TunnelConfig};
