//! Startup/shutdown sequencing with rollback.
//!
//! The orchestrator owns the validated configuration and every controller,
//! runs the strictly ordered startup protocol, and guarantees reverse-order
//! teardown from any failure point. It is also the only place that decides
//! which error kinds are fatal and which are warnings.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::config::AppConfig;
use crate::console::Reporter;
use crate::error::Error;
use crate::platform::{self, Platform};
use crate::process::{ConflictPolicy, ProcessSupervisor};
use crate::proxy::ProxyController;
use crate::redirect::RedirectionManager;
use crate::tunnel::TunnelController;
use crate::verify::{ConnectivityTester, LogMonitor, TrafficVerifier};

/// Sequences tunnel, proxy, redirection, verification, and monitoring.
pub struct Orchestrator {
    config: AppConfig,
    platform: Platform,
    headless: bool,
    reporter: Arc<dyn Reporter>,
    policy: Arc<dyn ConflictPolicy>,
    supervisor: Arc<ProcessSupervisor>,

    tunnel: Option<TunnelController>,
    proxy: Option<ProxyController>,
    redirect: Option<RedirectionManager>,
    monitor: Option<LogMonitor>,

    running: bool,
    cleanup_done: AtomicBool,
}

impl Orchestrator {
    /// Build an orchestrator for a validated configuration.
    pub fn new(
        config: AppConfig,
        policy: Arc<dyn ConflictPolicy>,
        reporter: Arc<dyn Reporter>,
        headless: bool,
    ) -> Self {
        let platform = platform::detect();
        info!("Detected platform: {platform}");

        Self {
            config,
            platform,
            headless,
            reporter,
            policy,
            supervisor: Arc::new(ProcessSupervisor::new()),
            tunnel: None,
            proxy: None,
            redirect: None,
            monitor: None,
            running: false,
            cleanup_done: AtomicBool::new(false),
        }
    }

    /// Run the startup protocol.
    ///
    /// The first failure aborts and triggers a full reverse-order teardown
    /// of whatever was already started before the error propagates.
    pub fn start(&mut self) -> Result<(), Error> {
        info!("Starting transparent proxy tunnel system");
        self.reporter.header("Transparent Proxy Tunnel Startup");

        if let Err(e) = self.start_inner() {
            error!("Failed to start proxy tunnel system: {e}");
            self.reporter.error(&format!("Startup failed: {e}"));
            self.shutdown();
            return Err(e);
        }

        self.running = true;
        self.reporter
            .success("Transparent proxy tunnel system started");
        Ok(())
    }

    fn start_inner(&mut self) -> Result<(), Error> {
        self.preflight_checks()?;
        self.start_tunnel()?;

        if self.platform.supports_transparent_proxy() {
            self.start_transparent_proxy()?;
        } else {
            self.start_socks_only_mode();
        }

        self.verify_system()?;
        self.start_monitoring();
        Ok(())
    }

    /// Run the shutdown protocol in reverse startup order.
    ///
    /// Every step swallows its own errors so teardown always reaches the
    /// end. Repeated calls after full teardown are no-ops.
    pub fn shutdown(&mut self) {
        if self.cleanup_done.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping transparent proxy tunnel system");
        self.reporter.header("Transparent Proxy Tunnel Shutdown");

        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        if let Some(redirect) = self.redirect.as_ref() {
            redirect.cleanup();
        }
        if let Some(proxy) = self.proxy.as_mut() {
            proxy.stop();
        }
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.stop();
        }

        self.running = false;
        self.reporter
            .success("Transparent proxy tunnel system stopped");
        info!("System shutdown completed");
    }

    /// Whether startup completed and shutdown has not run.
    pub fn is_running(&self) -> bool {
        self.running && !self.cleanup_done.load(Ordering::SeqCst)
    }

    /// Elevated privileges and required external tools.
    fn preflight_checks(&self) -> Result<(), Error> {
        self.reporter.step("Performing pre-flight checks");

        if !platform::is_admin() {
            return Err(Error::PlatformNotSupported(
                "administrator/root privileges required".to_string(),
            ));
        }

        let password_auth = matches!(
            self.config.tunnel.auth,
            crate::config::AuthMethod::Password(_)
        );
        let tools = platform::check_required_tools(self.platform, password_auth);
        let missing: Vec<&'static str> = tools
            .iter()
            .filter(|t| t.required && !t.available)
            .map(|t| t.name)
            .collect();

        platform::install_missing_tools(&missing, self.headless, self.reporter.as_ref())?;

        self.reporter.success("Pre-flight checks completed");
        Ok(())
    }

    fn start_tunnel(&mut self) -> Result<(), Error> {
        self.reporter.step(&format!(
            "Starting SSH tunnel to {}",
            self.config.tunnel.remote_host
        ));

        let mut tunnel = TunnelController::new(
            self.config.tunnel.clone(),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.policy),
            Arc::clone(&self.reporter),
        );
        let result = tunnel.start();
        self.tunnel = Some(tunnel);
        result
    }

    /// Linux path: redsocks, then the iptables chain. Rules are installed
    /// only after the proxy's listen port is confirmed occupied.
    fn start_transparent_proxy(&mut self) -> Result<(), Error> {
        self.reporter.step("Starting transparent proxy components");

        let mut proxy = ProxyController::new(
            self.config.proxy.clone(),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.policy),
            Arc::clone(&self.reporter),
        );
        let result = proxy.start("127.0.0.1", self.config.tunnel.tunnel_port);
        self.proxy = Some(proxy);
        result?;

        let redirect = RedirectionManager::new(self.platform, Arc::clone(&self.reporter))?;
        let result = redirect.setup(
            self.config.proxy.redsocks_port,
            Some(self.config.tunnel.tunnel_port),
        );
        self.redirect = Some(redirect);
        result
    }

    /// Reduced mode for platforms without kernel-level redirection: only
    /// the local SOCKS5 endpoint is exposed.
    fn start_socks_only_mode(&self) {
        self.reporter.warning(&format!(
            "Platform {} doesn't support transparent proxying",
            self.platform
        ));
        self.reporter.info(&format!(
            "SOCKS5 proxy available at 127.0.0.1:{}",
            self.config.tunnel.tunnel_port
        ));
        self.reporter
            .info("Configure applications manually to use this SOCKS5 proxy");
    }

    /// Generic connectivity failures are warnings; a failed redirection
    /// check is fatal, because without it no traffic flows through the
    /// tunnel.
    fn verify_system(&self) -> Result<(), Error> {
        self.reporter.step("Verifying system operation");

        let tester = ConnectivityTester::new(Arc::clone(&self.reporter));
        let report = tester.run_comprehensive_test(self.config.tunnel.tunnel_port);
        if !report.overall_success() {
            // Kept non-fatal so the tunnel stays usable when the
            // internet-dependent checks cannot run; see DESIGN.md.
            self.reporter.warning("Some connectivity tests failed");
        }

        if self.redirect.is_some() {
            let verifier = TrafficVerifier::new(Arc::clone(&self.reporter));
            let check = verifier.verify_redirection(self.config.proxy.redsocks_port);
            if !check.success {
                return Err(Error::Redirection(format!(
                    "traffic redirection verification failed: {}",
                    check.error.as_deref().unwrap_or("unknown")
                )));
            }
        }
        Ok(())
    }

    /// Tail the redsocks log, only when redirection mode is active.
    fn start_monitoring(&mut self) {
        let Some(proxy) = self.proxy.as_ref() else {
            return;
        };
        self.reporter.step("Starting log monitoring");

        let mut monitor = LogMonitor::new(proxy.log_path(), Arc::clone(&self.reporter));
        monitor.start();
        self.monitor = Some(monitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, ProxyConfig, TunnelConfig};
    use crate::console::CapturingReporter;
    use crate::process::AutoPolicy;
    use std::path::PathBuf;

    fn test_orchestrator(reporter: Arc<CapturingReporter>) -> Orchestrator {
        let config = AppConfig {
            tunnel: TunnelConfig {
                remote_host: "vps.example.com".to_string(),
                ssh_user: "tunnel".to_string(),
                auth: AuthMethod::Key(PathBuf::from("/tmp/nonexistent")),
                tunnel_port: 1080,
            },
            proxy: ProxyConfig { redsocks_port: 5020 },
        };
        Orchestrator::new(config, Arc::new(AutoPolicy::reject_all()), reporter, true)
    }

    #[test]
    fn not_running_before_start() {
        let orchestrator = test_orchestrator(Arc::new(CapturingReporter::new()));
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn shutdown_before_start_tears_down_nothing_and_is_idempotent() {
        let reporter = Arc::new(CapturingReporter::new());
        let mut orchestrator = test_orchestrator(reporter.clone());

        orchestrator.shutdown();
        let after_first = reporter.events().len();
        assert!(reporter.contains("header", "Shutdown"));

        // repeated calls after full teardown are no-ops
        orchestrator.shutdown();
        orchestrator.shutdown();
        assert_eq!(reporter.events().len(), after_first);
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn failed_startup_triggers_exactly_one_teardown() {
        // Only meaningful without root: preflight then fails deterministically.
        if platform::is_admin() {
            return;
        }

        let reporter = Arc::new(CapturingReporter::new());
        let mut orchestrator = test_orchestrator(reporter.clone());

        let err = orchestrator.start().unwrap_err();
        assert!(matches!(err, Error::PlatformNotSupported(_)));

        let teardowns = |r: &CapturingReporter| {
            r.events()
                .iter()
                .filter(|(kind, msg)| kind == "header" && msg.contains("Shutdown"))
                .count()
        };
        assert_eq!(teardowns(&reporter), 1);

        // the caller's own shutdown afterwards is a no-op
        orchestrator.shutdown();
        assert_eq!(teardowns(&reporter), 1);
    }

    #[test]
    #[ignore = "requires root, network access, and external tools"]
    fn full_startup_and_teardown() {
        let reporter = Arc::new(CapturingReporter::new());
        let mut orchestrator = test_orchestrator(reporter.clone());

        orchestrator.start().unwrap();
        assert!(orchestrator.is_running());

        orchestrator.shutdown();
        assert!(!orchestrator.is_running());
    }
}
