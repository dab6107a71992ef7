//! Background tailing of the redsocks log.
//!
//! One thread reads the file from its end-of-file forward, sleeping briefly
//! when no new data is available. The foreground control flow is never
//! blocked by the monitor.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use regex::RegexBuilder;
use tracing::{info, warn};

use crate::console::{LineStyle, Reporter};

/// Sleep between polls when the log has no new data.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Tails a log file on a background thread.
pub struct LogMonitor {
    log_path: PathBuf,
    reporter: Arc<dyn Reporter>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LogMonitor {
    /// Monitor for `log_path`; nothing starts until
    /// [`start`](Self::start).
    pub fn new(log_path: PathBuf, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            log_path,
            reporter,
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Start tailing. A missing file is a warning, not an error.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            warn!("Log monitoring already started");
            return;
        }

        info!("Starting log monitoring for {}", self.log_path.display());
        self.stop_flag.store(false, Ordering::SeqCst);

        let path = self.log_path.clone();
        let reporter = Arc::clone(&self.reporter);
        let stop_flag = Arc::clone(&self.stop_flag);

        self.thread = Some(std::thread::spawn(move || {
            tail_log(&path, reporter.as_ref(), &stop_flag);
        }));
    }

    /// Stop tailing and join the thread.
    pub fn stop(&mut self) {
        info!("Stopping log monitoring");
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Last `count` lines of the log, empty when the file is missing.
    pub fn recent_lines(&self, count: usize) -> Vec<String> {
        let Ok(content) = std::fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };
        let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
        let skip = lines.len().saturating_sub(count);
        lines[skip..].to_vec()
    }

    /// Case-insensitive regex search over the log, capped at `max_lines`
    /// matches. Invalid patterns and unreadable files yield no matches.
    pub fn search(&self, pattern: &str, max_lines: usize) -> Vec<String> {
        let regex = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => regex,
            Err(e) => {
                warn!("Invalid log search pattern '{pattern}': {e}");
                return Vec::new();
            }
        };
        let Ok(content) = std::fs::read_to_string(&self.log_path) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|line| regex.is_match(line))
            .take(max_lines)
            .map(|line| line.to_string())
            .collect()
    }
}

impl Drop for LogMonitor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

/// The tail loop: seek to EOF, then stream appended lines until stopped.
fn tail_log(path: &Path, reporter: &dyn Reporter, stop_flag: &AtomicBool) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            reporter.warning(&format!("Log file doesn't exist: {} ({e})", path.display()));
            return;
        }
    };

    let mut reader = BufReader::new(file);
    if let Err(e) = reader.seek(SeekFrom::End(0)) {
        reporter.warning(&format!("Cannot seek log file: {e}"));
        return;
    }

    let mut line = String::new();
    while !stop_flag.load(Ordering::SeqCst) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => std::thread::sleep(IDLE_SLEEP),
            Ok(_) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    reporter.line(trimmed, classify_line(trimmed));
                }
            }
            Err(e) => {
                warn!("Error reading log file: {e}");
                return;
            }
        }
    }
}

/// Map a log line to a display style by keyword.
fn classify_line(line: &str) -> LineStyle {
    let lower = line.to_lowercase();
    if lower.contains("error") {
        LineStyle::Error
    } else if lower.contains("warning") || lower.contains("warn") {
        LineStyle::Warning
    } else if lower.contains("notice") {
        LineStyle::Notice
    } else if lower.contains("info") {
        LineStyle::Info
    } else if lower.contains("debug") {
        LineStyle::Debug
    } else {
        LineStyle::Plain
    }
}
