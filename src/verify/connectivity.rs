//! Generic connectivity checks through the tunnel path.
//!
//! Every check records its outcome instead of raising: the suite always
//! completes and returns a full report for the orchestrator to judge.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{error, info};

use crate::console::Reporter;
use crate::error::Error;
use crate::net::{resolve_hostname, socks5_reachable};

/// Hostname resolved by the DNS check.
const PROBE_HOSTNAME: &str = "google.com";
/// Echo endpoint returning the apparent external address.
const HTTP_ECHO_URL: &str = "https://httpbin.org/ip";
/// Endpoint for the certificate-validated HTTPS check.
const HTTPS_PROBE_URL: &str = "https://www.google.com";

/// SOCKS5 endpoint reachability.
#[derive(Debug, Clone)]
pub struct SocksCheck {
    /// Endpoint accepted a TCP connection.
    pub success: bool,
}

/// DNS resolution outcome.
#[derive(Debug, Clone)]
pub struct DnsCheck {
    /// Hostname that was resolved.
    pub hostname: String,
    /// Resolution succeeded.
    pub success: bool,
    /// Resolved address on success.
    pub ip_address: Option<IpAddr>,
    /// Failure detail.
    pub error: Option<String>,
}

/// HTTP echo check outcome.
#[derive(Debug, Clone)]
pub struct HttpCheck {
    /// URL that was fetched.
    pub url: String,
    /// Request completed with a success status.
    pub success: bool,
    /// HTTP status code when a response arrived.
    pub status_code: Option<u16>,
    /// Apparent external address extracted from the body, best effort.
    pub external_ip: Option<String>,
    /// Round-trip time.
    pub response_time: Option<Duration>,
    /// Failure detail.
    pub error: Option<String>,
}

/// HTTPS check outcome, certificate validation enabled.
#[derive(Debug, Clone)]
pub struct HttpsCheck {
    /// URL that was fetched.
    pub url: String,
    /// Request completed with a success status.
    pub success: bool,
    /// HTTP status code when a response arrived.
    pub status_code: Option<u16>,
    /// Certificate chain validated.
    pub ssl_verified: bool,
    /// Round-trip time.
    pub response_time: Option<Duration>,
    /// Failure detail.
    pub error: Option<String>,
}

/// Aggregated result of one verification run. Built fresh per run and
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// SOCKS5 reachability.
    pub socks5: SocksCheck,
    /// DNS resolution.
    pub dns: DnsCheck,
    /// HTTP echo fetch.
    pub http: HttpCheck,
    /// Certificate-validated HTTPS fetch.
    pub https: HttpsCheck,
}

impl VerificationReport {
    /// True iff every individual check succeeded.
    pub fn overall_success(&self) -> bool {
        self.socks5.success && self.dns.success && self.http.success && self.https.success
    }
}

/// Runs the generic connectivity suite.
pub struct ConnectivityTester {
    timeout: Duration,
    reporter: Arc<dyn Reporter>,
}

impl ConnectivityTester {
    /// Tester with the default 10s per-request timeout.
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            timeout: Duration::from_secs(10),
            reporter,
        }
    }

    /// Run all checks sequentially and aggregate the report.
    pub fn run_comprehensive_test(&self, tunnel_port: u16) -> VerificationReport {
        info!("Running comprehensive connectivity tests");

        let report = VerificationReport {
            socks5: self.test_socks5("127.0.0.1", tunnel_port),
            dns: self.test_dns_resolution(PROBE_HOSTNAME),
            http: self.test_http_connectivity(HTTP_ECHO_URL),
            https: self.test_https_connectivity(HTTPS_PROBE_URL),
        };

        if report.overall_success() {
            self.reporter.success("All connectivity tests passed");
        } else {
            self.reporter.warning("Some connectivity tests failed");
        }
        report
    }

    /// SOCKS5 endpoint TCP reachability.
    pub fn test_socks5(&self, host: &str, port: u16) -> SocksCheck {
        SocksCheck {
            success: socks5_reachable(host, port, self.timeout),
        }
    }

    /// Resolve `hostname`, recording the outcome.
    pub fn test_dns_resolution(&self, hostname: &str) -> DnsCheck {
        info!("Testing DNS resolution for {hostname}");
        match resolve_hostname(hostname) {
            Ok(ip) => {
                self.reporter
                    .success(&format!("DNS resolution for {hostname}: {ip}"));
                DnsCheck {
                    hostname: hostname.to_string(),
                    success: true,
                    ip_address: Some(ip),
                    error: None,
                }
            }
            Err(e) => {
                self.reporter
                    .error(&format!("DNS resolution failed for {hostname}: {e}"));
                DnsCheck {
                    hostname: hostname.to_string(),
                    success: false,
                    ip_address: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Fetch the echo endpoint and extract the apparent external address.
    pub fn test_http_connectivity(&self, url: &str) -> HttpCheck {
        info!("Testing HTTP connectivity to {url}");

        let mut check = HttpCheck {
            url: url.to_string(),
            success: false,
            status_code: None,
            external_ip: None,
            response_time: None,
            error: None,
        };

        let started = Instant::now();
        match self.fetch(url) {
            Ok((status, body)) => {
                check.success = true;
                check.status_code = Some(status);
                check.response_time = Some(started.elapsed());
                check.external_ip = extract_external_ip(&body);

                match &check.external_ip {
                    Some(ip) => self
                        .reporter
                        .success(&format!("HTTP test successful. External IP: {ip}")),
                    None => self.reporter.success("HTTP test successful"),
                }
            }
            Err(e) => {
                check.error = Some(e.to_string());
                self.reporter.error(&format!("HTTP test failed: {e}"));
                error!("HTTP connectivity test failed: {e}");
            }
        }
        check
    }

    /// Fetch over HTTPS with certificate validation enabled.
    pub fn test_https_connectivity(&self, url: &str) -> HttpsCheck {
        info!("Testing HTTPS connectivity to {url}");

        let mut check = HttpsCheck {
            url: url.to_string(),
            success: false,
            status_code: None,
            ssl_verified: false,
            response_time: None,
            error: None,
        };

        let started = Instant::now();
        match self.fetch(url) {
            Ok((status, _body)) => {
                check.success = true;
                check.status_code = Some(status);
                check.ssl_verified = true;
                check.response_time = Some(started.elapsed());
                self.reporter
                    .success(&format!("HTTPS test successful to {url}"));
            }
            Err(e) => {
                check.error = Some(e.to_string());
                self.reporter
                    .error(&format!("HTTPS test failed: {e}"));
                error!("HTTPS connectivity test failed: {e}");
            }
        }
        check
    }

    /// GET `url` with the configured timeout; non-2xx statuses are errors.
    fn fetch(&self, url: &str) -> Result<(u16, String), Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Connectivity(format!("failed to build HTTP client: {e}")))?;

        let response = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Connectivity(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| Error::Connectivity(e.to_string()))?;
        Ok((status, body))
    }
}

/// Pull an apparent external address out of an echo-endpoint body.
///
/// JSON bodies are preferred (`origin` or `ip` keys); anything else falls
/// back to the first dotted-quad in the text. `None` is tolerated.
pub fn extract_external_ip(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["origin", "ip"] {
            if let Some(ip) = value.get(key).and_then(|v| v.as_str()) {
                return Some(ip.to_string());
            }
        }
    }

    let pattern = Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").ok()?;
    pattern.find(body).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_report() -> VerificationReport {
        VerificationReport {
            socks5: SocksCheck { success: true },
            dns: DnsCheck {
                hostname: "google.com".to_string(),
                success: true,
                ip_address: Some("142.250.74.46".parse().unwrap()),
                error: None,
            },
            http: HttpCheck {
                url: HTTP_ECHO_URL.to_string(),
                success: true,
                status_code: Some(200),
                external_ip: Some("203.0.113.9".to_string()),
                response_time: Some(Duration::from_millis(120)),
                error: None,
            },
            https: HttpsCheck {
                url: HTTPS_PROBE_URL.to_string(),
                success: true,
                status_code: Some(200),
                ssl_verified: true,
                response_time: Some(Duration::from_millis(140)),
                error: None,
            },
        }
    }

    #[test]
    fn overall_success_requires_every_check() {
        let report = passing_report();
        assert!(report.overall_success());

        let mut failing = passing_report();
        failing.socks5.success = false;
        assert!(!failing.overall_success());

        let mut failing = passing_report();
        failing.dns.success = false;
        assert!(!failing.overall_success());

        let mut failing = passing_report();
        failing.http.success = false;
        assert!(!failing.overall_success());

        let mut failing = passing_report();
        failing.https.success = false;
        assert!(!failing.overall_success());
    }

    #[test]
    fn external_ip_from_json_origin() {
        let body = r#"{"origin": "203.0.113.9"}"#;
        assert_eq!(extract_external_ip(body), Some("203.0.113.9".to_string()));
    }

    #[test]
    fn external_ip_from_json_ip_key() {
        let body = r#"{"ip": "198.51.100.4"}"#;
        assert_eq!(extract_external_ip(body), Some("198.51.100.4".to_string()));
    }

    #[test]
    fn external_ip_regex_fallback() {
        let body = "your address is 192.0.2.77, have a nice day";
        assert_eq!(extract_external_ip(body), Some("192.0.2.77".to_string()));
    }

    #[test]
    fn external_ip_absent_is_tolerated() {
        assert_eq!(extract_external_ip("<html>no address here</html>"), None);
        assert_eq!(extract_external_ip(""), None);
    }
}
