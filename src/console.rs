//! Human-facing status output.
//!
//! Components receive a [`Reporter`] at construction instead of writing to a
//! global console, so tests can substitute a capturing sink. The console
//! stream is for operators; machine-readable output goes to the tracing log.

use std::io::Write;
use std::sync::Mutex;

/// Severity styling for raw passthrough lines (used by the log monitor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    /// Red bold.
    Error,
    /// Yellow.
    Warning,
    /// Cyan.
    Notice,
    /// Green.
    Info,
    /// Dim.
    Debug,
    /// No styling.
    Plain,
}

/// Status reporting capability injected into every component.
pub trait Reporter: Send + Sync {
    /// Report a completed step.
    fn success(&self, message: &str);
    /// Report a failure.
    fn error(&self, message: &str);
    /// Report a non-fatal problem.
    fn warning(&self, message: &str);
    /// Report neutral information.
    fn info(&self, message: &str);
    /// Report the start of a step.
    fn step(&self, message: &str);
    /// Print a section header.
    fn header(&self, title: &str);
    /// Print a raw line with the given style (log passthrough).
    fn line(&self, text: &str, style: LineStyle);
}

/// ANSI-colored console reporter for interactive use.
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn success(&self, message: &str) {
        println!("\x1b[32m✓ {message}\x1b[0m");
    }

    fn error(&self, message: &str) {
        println!("\x1b[1;31m✗ {message}\x1b[0m");
    }

    fn warning(&self, message: &str) {
        println!("\x1b[33m⚠ {message}\x1b[0m");
    }

    fn info(&self, message: &str) {
        println!("\x1b[36mℹ {message}\x1b[0m");
    }

    fn step(&self, message: &str) {
        println!("\x1b[34m→ {message}\x1b[0m");
    }

    fn header(&self, title: &str) {
        println!("\n\x1b[1;36m━━━ {title} ━━━\x1b[0m");
    }

    fn line(&self, text: &str, style: LineStyle) {
        match style {
            LineStyle::Error => println!("\x1b[1;31m{text}\x1b[0m"),
            LineStyle::Warning => println!("\x1b[33m{text}\x1b[0m"),
            LineStyle::Notice => println!("\x1b[36m{text}\x1b[0m"),
            LineStyle::Info => println!("\x1b[32m{text}\x1b[0m"),
            LineStyle::Debug => println!("\x1b[2m{text}\x1b[0m"),
            LineStyle::Plain => println!("{text}"),
        }
    }
}

/// Reporter that records every event instead of printing.
///
/// Substituted for [`ConsoleReporter`] in tests to assert on emitted status
/// messages deterministically.
#[derive(Default)]
pub struct CapturingReporter {
    events: Mutex<Vec<(String, String)>>,
}

impl CapturingReporter {
    /// Create an empty capturing reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(kind, message)` pairs recorded so far.
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    /// Whether any recorded message of `kind` contains `needle`.
    pub fn contains(&self, kind: &str, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(k, m)| k == kind && m.contains(needle))
    }

    fn record(&self, kind: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((kind.to_string(), message.to_string()));
    }
}

impl Reporter for CapturingReporter {
    fn success(&self, message: &str) {
        self.record("success", message);
    }

    fn error(&self, message: &str) {
        self.record("error", message);
    }

    fn warning(&self, message: &str) {
        self.record("warning", message);
    }

    fn info(&self, message: &str) {
        self.record("info", message);
    }

    fn step(&self, message: &str) {
        self.record("step", message);
    }

    fn header(&self, title: &str) {
        self.record("header", title);
    }

    fn line(&self, text: &str, _style: LineStyle) {
        self.record("line", text);
    }
}

/// Ask the operator a yes/no question on stdin.
///
/// Empty input picks `default`.
pub fn ask_confirmation(question: &str, default: bool) -> std::io::Result<bool> {
    let hint = if default { "Y/n" } else { "y/N" };
    print!("{question} ({hint}): ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim().to_lowercase();

    if input.is_empty() {
        return Ok(default);
    }
    Ok(matches!(input.as_str(), "y" | "yes" | "true" | "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capturing_reporter_records_in_order() {
        let reporter = CapturingReporter::new();
        reporter.step("starting tunnel");
        reporter.success("tunnel up");
        reporter.warning("port still bound");

        let events = reporter.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ("step".to_string(), "starting tunnel".to_string()));
        assert_eq!(events[2].0, "warning");
    }

    #[test]
    fn capturing_reporter_contains() {
        let reporter = CapturingReporter::new();
        reporter.error("redsocks failed to bind port 5020");
        assert!(reporter.contains("error", "5020"));
        assert!(!reporter.contains("success", "5020"));
    }
}
