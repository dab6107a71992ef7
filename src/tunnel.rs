//! SSH tunnel lifecycle management.
//!
//! The tunnel is an external `ssh -D` process (wrapped in `sshpass` for
//! password auth) launched in its own process group. ssh daemonizes itself
//! with `-f`, so the direct child exits after authentication and liveness
//! is judged by the SOCKS5 port, not the handle.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{AuthMethod, TunnelConfig};
use crate::console::Reporter;
use crate::error::Error;
use crate::net::{port_in_use, socks5_reachable};
use crate::platform::tool_available;
use crate::process::{ConflictPolicy, ProcessHandle, ProcessSupervisor};

/// Token substituted for secret-bearing argument values in logged commands.
pub const REDACTION_TOKEN: &str = "******";

/// Pause after spawning ssh before the first SOCKS5 probe.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
/// SOCKS5 verification retries after the settle delay.
const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_DELAY: Duration = Duration::from_secs(1);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel supervision states.
///
/// `Failed` is terminal for supervision purposes: the controller never
/// retries past it on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Not running.
    Stopped,
    /// Conflict resolution and spawn in progress.
    Starting,
    /// Spawned, waiting for the SOCKS5 endpoint to answer.
    Verifying,
    /// SOCKS5 endpoint verified reachable.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Startup or verification failed; treated as stopped.
    Failed,
}

/// Supervises the tunnel-establishing ssh process.
pub struct TunnelController {
    config: TunnelConfig,
    supervisor: Arc<ProcessSupervisor>,
    policy: Arc<dyn ConflictPolicy>,
    reporter: Arc<dyn Reporter>,
    state: TunnelState,
    handle: Option<ProcessHandle>,
}

impl TunnelController {
    /// Build a controller; nothing is spawned until [`start`](Self::start).
    pub fn new(
        config: TunnelConfig,
        supervisor: Arc<ProcessSupervisor>,
        policy: Arc<dyn ConflictPolicy>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            supervisor,
            policy,
            reporter,
            state: TunnelState::Stopped,
            handle: None,
        }
    }

    /// Current supervision state.
    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Start the tunnel and verify its SOCKS5 endpoint.
    pub fn start(&mut self) -> Result<(), Error> {
        info!(
            "Starting SSH tunnel to {}:{}",
            self.config.remote_host, self.config.tunnel_port
        );
        self.state = TunnelState::Starting;

        if let Err(e) = self.supervisor.resolve_conflict(
            self.config.tunnel_port,
            self.policy.as_ref(),
            self.reporter.as_ref(),
        ) {
            self.state = TunnelState::Failed;
            return Err(e);
        }

        let command = match self.build_command() {
            Ok(command) => command,
            Err(e) => {
                self.state = TunnelState::Failed;
                return Err(e);
            }
        };
        info!(
            "Executing SSH command: {}",
            sanitize_command(&command).join(" ")
        );

        let child = Command::new(&command[0])
            .args(&command[1..])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();
        match child {
            Ok(child) => self.handle = Some(ProcessHandle::new(child)),
            Err(e) => {
                self.state = TunnelState::Failed;
                return Err(Error::Tunnel(format!("failed to start SSH tunnel: {e}")));
            }
        }

        std::thread::sleep(SETTLE_DELAY);
        self.state = TunnelState::Verifying;

        if !self.verify() {
            error!("SSH tunnel verification failed, cleaning up");
            self.stop();
            self.state = TunnelState::Failed;
            return Err(Error::Tunnel("SSH tunnel verification failed".to_string()));
        }

        self.state = TunnelState::Running;
        self.reporter.success(&format!(
            "SSH tunnel established on port {}",
            self.config.tunnel_port
        ));
        info!("SSH tunnel started");
        Ok(())
    }

    /// Stop the tunnel. Never fails; residual port occupancy is a warning.
    pub fn stop(&mut self) {
        info!("Stopping SSH tunnel");
        self.state = TunnelState::Stopping;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.supervisor.terminate(handle) {
                warn!("Error terminating tunnel process group: {e}");
            }
        }

        // ssh -f detaches from our handle; sweep by command signature too.
        self.supervisor
            .kill_matching(&format!("ssh.*-D.*{}", self.config.tunnel_port));

        if port_in_use(self.config.tunnel_port) {
            self.reporter.warning(&format!(
                "Port {} is still in use after stopping SSH tunnel",
                self.config.tunnel_port
            ));
        } else {
            self.reporter.success("SSH tunnel stopped");
            info!("SSH tunnel stopped");
        }
        self.state = TunnelState::Stopped;
    }

    /// Whether the tunnel is alive: owned handle running, or the port
    /// independently occupied (detects externally-surviving tunnels after
    /// a lost handle).
    pub fn is_running(&mut self) -> bool {
        if let Some(handle) = self.handle.as_mut() {
            if handle.is_running() {
                return true;
            }
        }
        port_in_use(self.config.tunnel_port)
    }

    /// Assemble the ssh invocation, checking helper availability.
    fn build_command(&self) -> Result<Vec<String>, Error> {
        if matches!(self.config.auth, AuthMethod::Password(_)) && !tool_available("sshpass") {
            return Err(Error::Tunnel(
                "sshpass is not installed; it is required for password authentication".to_string(),
            ));
        }
        Ok(build_ssh_command(&self.config))
    }

    fn verify(&self) -> bool {
        for attempt in 1..=VERIFY_ATTEMPTS {
            if socks5_reachable("127.0.0.1", self.config.tunnel_port, VERIFY_TIMEOUT) {
                return true;
            }
            if attempt < VERIFY_ATTEMPTS {
                info!("Tunnel verification attempt {attempt} failed, retrying");
                std::thread::sleep(VERIFY_DELAY);
            }
        }
        false
    }
}

/// Build the ssh argument vector for `config`.
///
/// Key auth: `ssh -D <port> -N -f -i <key> <options> user@host`.
/// Password auth: the same prefixed with `sshpass -p <password>`.
pub fn build_ssh_command(config: &TunnelConfig) -> Vec<String> {
    let ssh_options = [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
    ];
    let destination = format!("{}@{}", config.ssh_user, config.remote_host);

    let mut command: Vec<String> = Vec::new();
    match &config.auth {
        AuthMethod::Key(key_path) => {
            command.extend([
                "ssh".to_string(),
                "-D".to_string(),
                config.tunnel_port.to_string(),
                "-N".to_string(),
                "-f".to_string(),
                "-i".to_string(),
                key_path.display().to_string(),
            ]);
        }
        AuthMethod::Password(password) => {
            command.extend([
                "sshpass".to_string(),
                "-p".to_string(),
                password.clone(),
                "ssh".to_string(),
                "-D".to_string(),
                config.tunnel_port.to_string(),
                "-N".to_string(),
                "-f".to_string(),
            ]);
        }
    }
    command.extend(ssh_options.iter().map(|s| s.to_string()));
    command.push(destination);
    command
}

/// Replace secret-bearing argument values with [`REDACTION_TOKEN`].
///
/// Covers `sshpass -p <pw>` (and the fused `-p<pw>` form), `-i <key>` (and
/// fused `-i<key>`), `-o` options whose value names a password, and any
/// `password=`/`passwd=`/`pass=` token. All other arguments are preserved
/// verbatim and in order so operators can audit the invocation shape.
pub fn sanitize_command(command: &[String]) -> Vec<String> {
    let mut sanitized = Vec::with_capacity(command.len());
    let mut i = 0;

    while i < command.len() {
        let arg = &command[i];

        if arg == "sshpass" {
            sanitized.push(arg.clone());
            i += 1;
            if i < command.len() && command[i] == "-p" {
                sanitized.push("-p".to_string());
                sanitized.push(REDACTION_TOKEN.to_string());
                i += 2;
            } else if i < command.len() && command[i].starts_with("-p") {
                sanitized.push(format!("-p{REDACTION_TOKEN}"));
                i += 1;
            }
        } else if arg == "-i" {
            sanitized.push(arg.clone());
            if i + 1 < command.len() {
                sanitized.push(REDACTION_TOKEN.to_string());
                i += 2;
            } else {
                i += 1;
            }
        } else if arg.starts_with("-i") && arg.len() > 2 {
            sanitized.push(format!("-i{REDACTION_TOKEN}"));
            i += 1;
        } else if (arg == "-o" || arg == "--option") && i + 1 < command.len() {
            let value = &command[i + 1];
            sanitized.push(arg.clone());
            let lower = value.to_lowercase();
            if lower.contains("password") || lower.contains("passwd") {
                sanitized.push(REDACTION_TOKEN.to_string());
            } else {
                sanitized.push(value.clone());
            }
            i += 2;
        } else if contains_secret_assignment(arg) {
            match arg.split_once('=') {
                Some((key, _)) => sanitized.push(format!("{key}={REDACTION_TOKEN}")),
                None => sanitized.push(REDACTION_TOKEN.to_string()),
            }
            i += 1;
        } else {
            sanitized.push(arg.clone());
            i += 1;
        }
    }

    sanitized
}

fn contains_secret_assignment(arg: &str) -> bool {
    let lower = arg.to_lowercase();
    ["password=", "passwd=", "pass="]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::CapturingReporter;
    use crate::process::AutoPolicy;
    use std::path::PathBuf;

    fn key_config(port: u16) -> TunnelConfig {
        TunnelConfig {
            remote_host: "vps.example.com".to_string(),
            ssh_user: "tunnel".to_string(),
            auth: AuthMethod::Key(PathBuf::from("/home/op/.ssh/id_ed25519")),
            tunnel_port: port,
        }
    }

    fn password_config(port: u16) -> TunnelConfig {
        TunnelConfig {
            remote_host: "vps.example.com".to_string(),
            ssh_user: "tunnel".to_string(),
            auth: AuthMethod::Password("s3cr3t-pw".to_string()),
            tunnel_port: port,
        }
    }

    #[test]
    fn key_command_shape() {
        let command = build_ssh_command(&key_config(1080));
        assert_eq!(
            command,
            vec![
                "ssh",
                "-D",
                "1080",
                "-N",
                "-f",
                "-i",
                "/home/op/.ssh/id_ed25519",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "tunnel@vps.example.com",
            ]
        );
    }

    #[test]
    fn password_command_uses_sshpass() {
        let command = build_ssh_command(&password_config(1080));
        assert_eq!(&command[..3], &["sshpass", "-p", "s3cr3t-pw"]);
        assert_eq!(command[3], "ssh");
        assert_eq!(*command.last().unwrap(), "tunnel@vps.example.com");
    }

    #[test]
    fn sanitize_hides_password_and_preserves_shape() {
        let command = build_ssh_command(&password_config(1080));
        let sanitized = sanitize_command(&command);

        assert!(!sanitized.iter().any(|arg| arg.contains("s3cr3t-pw")));
        assert_eq!(sanitized[0], "sshpass");
        assert_eq!(sanitized[1], "-p");
        assert_eq!(sanitized[2], REDACTION_TOKEN);
        // everything after the secret is untouched and ordered
        assert_eq!(&sanitized[3..], &command[3..]);
    }

    #[test]
    fn sanitize_hides_key_path() {
        let command = build_ssh_command(&key_config(1080));
        let sanitized = sanitize_command(&command);

        assert!(!sanitized.iter().any(|arg| arg.contains("id_ed25519")));
        let i = sanitized.iter().position(|a| a == "-i").unwrap();
        assert_eq!(sanitized[i + 1], REDACTION_TOKEN);
        assert_eq!(sanitized.len(), command.len());
    }

    #[test]
    fn sanitize_fused_forms() {
        let command: Vec<String> = ["sshpass", "-pTopSecret", "ssh", "-iMyKeyFile", "host"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let sanitized = sanitize_command(&command);
        assert_eq!(sanitized[1], format!("-p{REDACTION_TOKEN}"));
        assert_eq!(sanitized[3], format!("-i{REDACTION_TOKEN}"));
        assert!(!sanitized.iter().any(|a| a.contains("TopSecret")));
        assert!(!sanitized.iter().any(|a| a.contains("MyKeyFile")));
    }

    #[test]
    fn sanitize_option_values_and_assignments() {
        let command: Vec<String> = [
            "ssh",
            "-o",
            "PasswordAuthentication=yes",
            "-o",
            "LogLevel=ERROR",
            "ProxyPassword=letmein",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let sanitized = sanitize_command(&command);

        assert_eq!(sanitized[2], REDACTION_TOKEN);
        assert_eq!(sanitized[4], "LogLevel=ERROR");
        assert_eq!(sanitized[5], format!("ProxyPassword={REDACTION_TOKEN}"));
        assert!(!sanitized.iter().any(|a| a.contains("letmein")));
    }

    #[test]
    fn new_controller_is_stopped_and_stop_is_idempotent() {
        let mut controller = TunnelController::new(
            key_config(58231),
            Arc::new(ProcessSupervisor::new()),
            Arc::new(AutoPolicy::reject_all()),
            Arc::new(CapturingReporter::new()),
        );
        assert_eq!(controller.state(), TunnelState::Stopped);

        controller.stop();
        assert_eq!(controller.state(), TunnelState::Stopped);
        controller.stop();
        assert_eq!(controller.state(), TunnelState::Stopped);
    }
}
