//! Collapsed transcript of raw script output.
//!
//! The downloader re-prints its progress line many times a second. Keeping
//! every repetition would drown the transcript, so the accumulator holds a
//! "current line" and only promotes it into the persistent buffer when the
//! incoming line is not just another transient progress update. At least one
//! sample of every transient burst survives the collapse.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::classify;

/// Matches transient downloader progress lines such as `[#a1b2c3 ...`.
/// The hex token differs per download, so only the shape is matched.
static TRANSIENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\[#\w+ ").unwrap());

/// True when the line is a transient progress update that later updates
/// supersede.
pub fn is_transient(line: &str) -> bool {
    TRANSIENT_RE.is_match(line)
}

/// Append-mostly transcript with transient-burst collapsing.
#[derive(Debug, Default)]
pub struct Transcript {
    current: Option<String>,
    prior: Vec<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line into the transcript.
    ///
    /// The previously-current line is flushed into the prior buffer unless
    /// both it and the new line are transient; consecutive transients
    /// collapse to the most recent one. Keep-alive padding never enters the
    /// transcript at all.
    pub fn push(&mut self, line: &str) {
        if classify::is_padding(line) {
            return;
        }

        if let Some(current) = self.current.take() {
            if !(is_transient(&current) && is_transient(line)) {
                self.prior.push(current);
            }
        }

        self.current = Some(line.to_string());
    }

    /// The line most recently received, if any.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// All flushed lines, oldest first.
    pub fn prior(&self) -> &[String] {
        &self.prior
    }

    /// Render the full transcript (prior lines plus the current one) for
    /// the diagnostic view.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.prior {
            out.push_str(line);
            out.push('\n');
        }
        if let Some(current) = &self.current {
            out.push_str(current);
            out.push('\n');
        }
        out
    }
}
