//! External process supervision and port-conflict resolution.
//!
//! Owner lookup goes through the [`ProcessIdentityResolver`] trait with two
//! backends: a procfs scanner (no external tools needed) and an `lsof`
//! fallback. The backend is picked once at startup, not per call.
//!
//! Termination always targets the **process group** of a handle we started,
//! because ssh forks helper processes that would otherwise survive their
//! parent.

use std::fs;
use std::path::Path;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::console::{ask_confirmation, Reporter};
use crate::error::Error;
use crate::net::port_in_use;

/// How long to wait for graceful exit before escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);

/// Best-effort identity of a process owning a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    /// Process ID.
    pub pid: i32,
    /// Process name, when readable.
    pub name: Option<String>,
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "PID {} ({})", self.pid, name),
            None => write!(f, "PID {}", self.pid),
        }
    }
}

/// Resolves which process owns a listening TCP port.
///
/// Returning `None` means "unknown", which callers must treat as a distinct
/// case from a known owner; it is never an error.
pub trait ProcessIdentityResolver: Send + Sync {
    /// Find the process listening on `port`, best effort.
    fn find_by_port(&self, port: u16) -> Option<ProcessIdentity>;
}

/// Resolver backed by `/proc/net/tcp{,6}` and `/proc/*/fd`.
///
/// Maps the listening socket's inode to the process holding it. Needs no
/// external tools; other users' processes stay invisible without root,
/// which is fine since we run privileged anyway.
pub struct ProcfsResolver;

impl ProcessIdentityResolver for ProcfsResolver {
    fn find_by_port(&self, port: u16) -> Option<ProcessIdentity> {
        let mut inodes = Vec::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            if let Ok(content) = fs::read_to_string(table) {
                inodes.extend(listening_inodes(&content, port));
            }
        }
        if inodes.is_empty() {
            return None;
        }

        let pid = find_pid_by_inodes(&inodes)?;
        Some(ProcessIdentity {
            pid,
            name: process_name(pid),
        })
    }
}

/// Socket inodes of LISTEN entries on `port` in a procfs TCP table.
fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
    let mut inodes = Vec::new();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        // fields: sl local_address rem_address st ... inode
        let Some(local_port_hex) = fields[1].rsplit(':').next() else {
            continue;
        };
        let Ok(local_port) = u16::from_str_radix(local_port_hex, 16) else {
            continue;
        };
        // 0A == TCP_LISTEN
        if local_port == port && fields[3] == "0A" {
            if let Ok(inode) = fields[9].parse::<u64>() {
                inodes.push(inode);
            }
        }
    }
    inodes
}

/// Scan `/proc/*/fd` for a process holding any of the given socket inodes.
fn find_pid_by_inodes(inodes: &[u64]) -> Option<i32> {
    let targets: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

    let entries = fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = fs::read_link(fd.path()) {
                let link = link.to_string_lossy();
                if targets.iter().any(|t| *t == link) {
                    return Some(pid);
                }
            }
        }
    }
    None
}

fn process_name(pid: i32) -> Option<String> {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolver backed by the `lsof` CLI.
pub struct LsofResolver;

impl ProcessIdentityResolver for LsofResolver {
    fn find_by_port(&self, port: u16) -> Option<ProcessIdentity> {
        let output = Command::new("lsof")
            .args(["-i", &format!(":{port}"), "-t"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid: i32 = stdout.lines().next()?.trim().parse().ok()?;
        Some(ProcessIdentity {
            pid,
            name: process_name(pid),
        })
    }
}

/// Pick a resolver backend once, based on what the host offers.
pub fn select_resolver() -> Box<dyn ProcessIdentityResolver> {
    if Path::new("/proc/net/tcp").exists() {
        debug!("Using procfs-backed process identity resolver");
        Box::new(ProcfsResolver)
    } else {
        debug!("procfs unavailable, using lsof-backed resolver");
        Box::new(LsofResolver)
    }
}

/// Decides whether an occupying process may be terminated to free a port.
pub trait ConflictPolicy: Send + Sync {
    /// `owner` is `None` when the occupant could not be identified.
    fn should_resolve(&self, port: u16, owner: Option<&ProcessIdentity>) -> bool;
}

/// Asks the operator on stdin.
pub struct InteractivePolicy;

impl ConflictPolicy for InteractivePolicy {
    fn should_resolve(&self, port: u16, owner: Option<&ProcessIdentity>) -> bool {
        let occupant = match owner {
            Some(identity) => identity.to_string(),
            None => "an unidentified process".to_string(),
        };
        ask_confirmation(&format!("Port {port} is in use by {occupant}. Kill it?"), false)
            .unwrap_or(false)
    }
}

/// Non-interactive policy for headless/CI runs.
pub struct AutoPolicy {
    accept: bool,
}

impl AutoPolicy {
    /// Terminate any occupant without asking.
    pub fn accept_all() -> Self {
        Self { accept: true }
    }

    /// Never terminate; occupied ports fail immediately.
    pub fn reject_all() -> Self {
        Self { accept: false }
    }
}

impl ConflictPolicy for AutoPolicy {
    fn should_resolve(&self, _port: u16, _owner: Option<&ProcessIdentity>) -> bool {
        self.accept
    }
}

/// Handle to a supervised external process launched in its own group.
pub struct ProcessHandle {
    pub(crate) child: Child,
    /// PID of the direct child (== its process group ID).
    pub pid: u32,
}

impl ProcessHandle {
    /// Wrap a spawned child.
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child, pid }
    }

    /// Whether the direct child is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

/// Starts, signals, and force-terminates external processes.
pub struct ProcessSupervisor {
    resolver: Box<dyn ProcessIdentityResolver>,
}

impl ProcessSupervisor {
    /// Supervisor with the backend picked by [`select_resolver`].
    pub fn new() -> Self {
        Self {
            resolver: select_resolver(),
        }
    }

    /// Supervisor with an explicit resolver (tests inject stubs here).
    pub fn with_resolver(resolver: Box<dyn ProcessIdentityResolver>) -> Self {
        Self { resolver }
    }

    /// Identify the process occupying `port`, best effort.
    pub fn find_by_port(&self, port: u16) -> Option<ProcessIdentity> {
        self.resolver.find_by_port(port)
    }

    /// Free `port` if occupied, consulting `policy` before terminating.
    ///
    /// A free port is a no-op: the policy is never consulted and nothing is
    /// signaled. On rejection, or when the occupant survives the kill, the
    /// caller gets [`Error::PortInUse`] carrying whatever identity we found.
    pub fn resolve_conflict(
        &self,
        port: u16,
        policy: &dyn ConflictPolicy,
        reporter: &dyn Reporter,
    ) -> Result<(), Error> {
        if !port_in_use(port) {
            return Ok(());
        }

        let owner = self.find_by_port(port);
        if !policy.should_resolve(port, owner.as_ref()) {
            return Err(Error::PortInUse { port, owner });
        }

        match &owner {
            Some(identity) => reporter.step(&format!("Terminating {identity} on port {port}")),
            None => reporter.step(&format!("Terminating unidentified process on port {port}")),
        }

        if self.kill_process_on_port(port) {
            std::thread::sleep(Duration::from_secs(1));
        }

        if port_in_use(port) {
            return Err(Error::PortInUse { port, owner });
        }
        Ok(())
    }

    /// Terminate whatever listens on `port`: SIGTERM, bounded wait, SIGKILL.
    pub fn kill_process_on_port(&self, port: u16) -> bool {
        let Some(identity) = self.find_by_port(port) else {
            warn!("No identifiable process on port {port} to kill");
            return false;
        };

        info!("Killing {identity} on port {port}");
        let pid = Pid::from_raw(identity.pid);

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            if e == Errno::ESRCH {
                return true;
            }
            warn!("SIGTERM to {identity} failed: {e}");
        }

        if wait_for_exit(identity.pid, KILL_GRACE) {
            return true;
        }

        warn!("{identity} did not exit gracefully, sending SIGKILL");
        match kill(pid, Signal::SIGKILL) {
            Ok(()) => wait_for_exit(identity.pid, Duration::from_secs(1)),
            Err(Errno::ESRCH) => true,
            Err(e) => {
                warn!("SIGKILL to {identity} failed: {e}");
                false
            }
        }
    }

    /// Release a handle: group SIGTERM, bounded wait, group SIGKILL.
    ///
    /// "No such process" means the group already exited and counts as
    /// success, so repeated stop paths stay idempotent.
    pub fn terminate(&self, mut handle: ProcessHandle) -> Result<(), Error> {
        let pgid = Pid::from_raw(handle.pid as i32);

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("SIGTERM to process group {pgid} failed: {e}"),
        }

        let deadline = Instant::now() + KILL_GRACE;
        loop {
            match handle.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Process {} exited with {status}", handle.pid);
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(KILL_POLL),
                Ok(None) => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        warn!("Process group {pgid} did not exit gracefully, forcing kill");
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("SIGKILL to process group {pgid} failed: {e}"),
        }
        let _ = handle.child.wait();
        Ok(())
    }

    /// `pkill -f` fallback for daemons that detached from our handle.
    pub fn kill_matching(&self, pattern: &str) {
        debug!("pkill -f {pattern}");
        match Command::new("pkill").args(["-f", pattern]).status() {
            // pkill exits 1 when nothing matched, which is fine here
            Ok(_) => {}
            Err(e) => warn!("pkill -f {pattern} failed to run: {e}"),
        }
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `/proc/<pid>` until it disappears or the timeout elapses.
fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !Path::new(&format!("/proc/{pid}")).exists() {
            return true;
        }
        std::thread::sleep(KILL_POLL);
    }
    !Path::new(&format!("/proc/{pid}")).exists()
}
