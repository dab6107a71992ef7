//! Redsocks proxy lifecycle management.
//!
//! Redsocks daemonizes itself, so it is never our direct child: liveness is
//! judged by its listen port and teardown goes through `pkill` by name.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{
    validate_redsocks_config, write_redsocks_config, ProxyConfig, REDSOCKS_CONFIG_PATH,
    REDSOCKS_LOG_PATH,
};
use crate::console::Reporter;
use crate::error::Error;
use crate::net::port_in_use;
use crate::process::{ConflictPolicy, ProcessSupervisor};

/// Pause after asking redsocks to stop before re-probing the port.
const STOP_SETTLE: Duration = Duration::from_secs(1);

/// Supervises the redsocks daemon.
pub struct ProxyController {
    config: ProxyConfig,
    supervisor: Arc<ProcessSupervisor>,
    policy: Arc<dyn ConflictPolicy>,
    reporter: Arc<dyn Reporter>,
    config_path: PathBuf,
}

impl ProxyController {
    /// Build a controller targeting the default artifact path.
    pub fn new(
        config: ProxyConfig,
        supervisor: Arc<ProcessSupervisor>,
        policy: Arc<dyn ConflictPolicy>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            supervisor,
            policy,
            reporter,
            config_path: PathBuf::from(REDSOCKS_CONFIG_PATH),
        }
    }

    /// Override the artifact path (tests point this at a temp dir).
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = path;
        self
    }

    /// Start redsocks forwarding to the SOCKS5 endpoint at
    /// `proxy_ip:proxy_port`.
    ///
    /// The port conflict is resolved before the configuration artifact is
    /// written, so a rejected conflict leaves no trace on disk.
    pub fn start(&mut self, proxy_ip: &str, proxy_port: u16) -> Result<(), Error> {
        info!(
            "Starting redsocks on port {} -> {proxy_ip}:{proxy_port}",
            self.config.redsocks_port
        );

        self.supervisor.resolve_conflict(
            self.config.redsocks_port,
            self.policy.as_ref(),
            self.reporter.as_ref(),
        )?;

        write_redsocks_config(
            &self.config_path,
            self.config.redsocks_port,
            proxy_ip,
            proxy_port,
        )?;
        validate_redsocks_config(&self.config_path)?;

        let output = Command::new("redsocks")
            .args(["-c"])
            .arg(&self.config_path)
            .output()
            .map_err(|e| Error::Redsocks(format!("failed to start redsocks: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("redsocks exited with {}: {stderr}", output.status);
            return Err(Error::Redsocks(format!(
                "redsocks exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if !port_in_use(self.config.redsocks_port) {
            return Err(Error::Redsocks(format!(
                "redsocks started but port {} is not listening",
                self.config.redsocks_port
            )));
        }

        self.reporter.success("Redsocks service started");
        info!("Redsocks service started");
        Ok(())
    }

    /// Stop redsocks. Absence is success; residual occupancy is a warning.
    pub fn stop(&mut self) {
        info!("Stopping redsocks service");

        match Command::new("pkill").arg("redsocks").status() {
            Ok(_) => {}
            Err(e) => warn!("pkill redsocks failed to run: {e}"),
        }
        std::thread::sleep(STOP_SETTLE);

        if port_in_use(self.config.redsocks_port) {
            self.reporter.warning(&format!(
                "Port {} is still in use after stopping redsocks",
                self.config.redsocks_port
            ));
        } else {
            self.reporter.success("Redsocks service stopped");
            info!("Redsocks service stopped");
        }
    }

    /// Whether redsocks is listening.
    pub fn is_running(&self) -> bool {
        port_in_use(self.config.redsocks_port)
    }

    /// The fixed log path the monitor tails.
    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(REDSOCKS_LOG_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturingReporter;
    use crate::process::{AutoPolicy, ProcessIdentity, ProcessIdentityResolver};
    use std::net::TcpListener;

    struct UnknownOwnerResolver;

    impl ProcessIdentityResolver for UnknownOwnerResolver {
        fn find_by_port(&self, _port: u16) -> Option<ProcessIdentity> {
            None
        }
    }

    #[test]
    fn rejected_conflict_fails_before_artifact_is_written() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let occupied_port = listener.local_addr().unwrap().port();

        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("redsocks.conf");

        let mut controller = ProxyController::new(
            ProxyConfig {
                redsocks_port: occupied_port,
            },
            Arc::new(ProcessSupervisor::with_resolver(Box::new(
                UnknownOwnerResolver,
            ))),
            Arc::new(AutoPolicy::reject_all()),
            Arc::new(CapturingReporter::new()),
        )
        .with_config_path(config_path.clone());

        let err = controller.start("127.0.0.1", 1080).unwrap_err();
        assert!(matches!(err, Error::PortInUse { .. }));
        assert!(
            !config_path.exists(),
            "artifact must not be written when the conflict is rejected"
        );
    }

    #[test]
    fn log_path_is_fixed() {
        let controller = ProxyController::new(
            ProxyConfig { redsocks_port: 5020 },
            Arc::new(ProcessSupervisor::with_resolver(Box::new(
                UnknownOwnerResolver,
            ))),
            Arc::new(AutoPolicy::reject_all()),
            Arc::new(CapturingReporter::new()),
        );
        assert_eq!(controller.log_path(), PathBuf::from(REDSOCKS_LOG_PATH));
    }
}
