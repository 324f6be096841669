//! Batch counters and end-of-run summaries

use serde::{Deserialize, Serialize};

/// Counters accumulated over a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResults {
    /// Checks that passed, or records created in a generate run
    pub successful: u64,
    /// Checks that failed or raised an error
    pub failed: u64,
    /// Objects whose last check was still current
    pub skipped: u64,
    /// Requested ids that matched no object
    pub ignored: u64,
    /// Diagnostic messages, oldest first
    pub errors: Vec<String>,
    /// Diagnostics not kept because the list was full
    pub errors_dropped: u64,
}

impl BatchResults {
    /// Create empty counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Items accounted for
    pub fn processed(&self) -> u64 {
        self.successful + self.failed + self.skipped + self.ignored
    }

    /// Diagnostics raised, including dropped ones
    pub fn error_count(&self) -> u64 {
        self.errors.len() as u64 + self.errors_dropped
    }

    /// Keep a diagnostic while fewer than `max` are held
    pub fn record_error(&mut self, message: impl Into<String>, max: usize) {
        if self.errors.len() < max {
            self.errors.push(message.into());
        } else {
            self.errors_dropped += 1;
        }
    }

    /// Fold in the counters of a finished chunk
    pub fn merge(&mut self, chunk: BatchResults, max: usize) {
        self.successful += chunk.successful;
        self.failed += chunk.failed;
        self.skipped += chunk.skipped;
        self.ignored += chunk.ignored;
        self.errors_dropped += chunk.errors_dropped;
        for message in chunk.errors {
            self.record_error(message, max);
        }
    }

    /// End-of-run lines for a check run
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            plural(self.processed(), "Processed 1 item in total.", "Processed {} items in total."),
            plural(self.successful, "1 was successful.", "{} were successful."),
            plural(self.ignored, "1 was ignored.", "{} were ignored."),
            plural(self.skipped, "1 was skipped.", "{} were skipped."),
            format!("{} failed.", self.failed),
        ];
        self.push_errors(&mut lines);
        lines
    }

    /// End-of-run lines for a generate run
    pub fn generation_summary(&self) -> Vec<String> {
        let mut lines = vec![
            plural(
                self.successful + self.failed,
                "Processed 1 item in total.",
                "Processed {} items in total.",
            ),
            plural(self.successful, "1 was successful.", "{} were successful."),
            format!("{} failed.", self.failed),
        ];
        self.push_errors(&mut lines);
        lines
    }

    fn push_errors(&self, lines: &mut Vec<String>) {
        let count = self.error_count();
        if count == 0 {
            return;
        }
        lines.push(plural(count, "1 error occurred.", "{} errors occurred."));
        lines.extend(self.errors.iter().cloned());
        if self.errors_dropped > 0 {
            lines.push(format!("{} further errors were not kept.", self.errors_dropped));
        }
    }
}

fn plural(count: u64, one: &str, many: &str) -> String {
    if count == 1 {
        one.to_string()
    } else {
        many.replace("{}", &count.to_string())
    }
}
