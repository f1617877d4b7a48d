//! Bounded capture of merge diagnostics
//!
//! Keeps the most recent lines for error reports and forwards the
//! interesting ones to a progress callback.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Lines retained for error reports
pub const MAX_OUTPUT_LINES: usize = 400;

/// Characters kept per line before truncation
pub const MAX_LINE_CHARS: usize = 2000;

const QUIET_PREFIXES: [&str; 4] = ["Added:", "Added [", "Loading:", "ORDER:"];

/// Callback receiving forwarded diagnostic lines
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Ring buffer of recent output lines
pub struct OutputCapture {
    lines: Mutex<VecDeque<String>>,
    forward: Option<LineSink>,
}

impl OutputCapture {
    /// Capture, optionally forwarding lines
    #[must_use]
    pub fn new(forward: Option<LineSink>) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(MAX_OUTPUT_LINES)),
            forward,
        }
    }

    /// Record one line; blank lines are dropped
    pub fn record(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let normalized = limit_line_length(trimmed);
        {
            let mut lines = self.lines.lock();
            if lines.len() == MAX_OUTPUT_LINES {
                lines.pop_front();
            }
            lines.push_back(normalized.clone());
        }
        if should_forward(trimmed) {
            if let Some(forward) = &self.forward {
                forward(&normalized);
            }
        }
    }

    /// Recorded lines joined with newlines
    #[must_use]
    pub fn tail(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// Number of retained lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// `true` if nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    /// `"<headline>. <tail>"`, or just `"<headline>."` without output
    #[must_use]
    pub fn failure_message(&self, headline: &str) -> String {
        let tail = self.tail();
        if tail.is_empty() {
            format!("{headline}.")
        } else {
            format!("{headline}. {tail}")
        }
    }
}

/// `false` for per-entry noise and protocol lines
#[must_use]
pub fn should_forward(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !QUIET_PREFIXES.iter().any(|prefix| trimmed.starts_with(prefix))
}

fn limit_line_length(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        None => line.to_string(),
        Some((cut, _)) => format!("{}…", &line[..cut]),
    }
}
