//! sockstun: transparent SOCKS5 tunneling over SSH.
//!
//! An SSH tunnel exposes a local SOCKS5 endpoint; on Linux, redsocks and an
//! iptables NAT chain then redirect all outbound TCP traffic through it.
//! The tunnel, proxy, and firewall pieces are external programs — this
//! crate is the lifecycle manager that sequences them: startup with
//! rollback, idempotent system-state mutation, port-conflict resolution,
//! verification, and guaranteed teardown.
//!
//! # Architecture
//!
//! - **Config**: environment-sourced settings, validated before anything
//!   starts, plus the generated redsocks artifact
//! - **Process**: port-conflict resolution and process-group termination
//! - **Tunnel / Proxy**: controllers for the ssh and redsocks processes
//! - **Redirect**: the iptables NAT chain, installed atomically from the
//!   caller's view and removable from any failure path
//! - **Verify**: a tolerant connectivity suite plus the hard redirection
//!   check, and the background log tailer
//! - **Orchestrator**: the startup/shutdown protocol tying it together

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod net;
pub mod orchestrator;
pub mod platform;
pub mod process;
pub mod proxy;
pub mod redirect;
pub mod tunnel;
pub mod verify;
