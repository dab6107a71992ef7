//! Post-startup verification and monitoring.
//!
//! The generic connectivity suite ([`connectivity`]) records failures but
//! never raises them; only the redirection check in [`traffic`] is fatal to
//! startup, because without it no traffic actually flows through the tunnel.

pub mod connectivity;
pub mod monitor;
pub mod traffic;

pub use connectivity::{ConnectivityTester, VerificationReport};
pub use monitor::LogMonitor;
pub use traffic::TrafficVerifier;
