//! The scrubber's typed result.
//!
//! A scrub never throws at its boundary: whatever happens, the caller gets
//! a [`ScrubberResult`] carrying the counters accumulated so far, and the
//! terminating error when the run did not drain both phases.

use std::time::Duration;

use taxis_core::{IndexError, KvsError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueCounts {
    pub detected: u64,
    pub repaired: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ScrubSummary {
    pub time_elapsed: Duration,
    /// Index entries visited in phase 1.
    pub entries_scanned: u64,
    /// Records visited in phase 2.
    pub records_scanned: u64,
    /// Index entries with no backing record.
    pub dangling: IssueCounts,
    /// Records whose expected index entries were absent.
    pub missing: IssueCounts,
    /// Oversized entries skipped to preserve forward progress.
    pub skipped: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ScrubError {
    #[error(
        "{phase}: retries exhausted during {operation} over {key_range} after {attempts} \
         attempts (last error: {last_error}); {recommendation}"
    )]
    RetryExhausted {
        phase: &'static str,
        operation: &'static str,
        key_range: String,
        attempts: u32,
        last_error: String,
        recommendation: &'static str,
    },

    #[error("failed to skip oversized entry {key}: {reason} after {attempts} attempts")]
    SkipFailed {
        key: String,
        reason: String,
        attempts: u32,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Kvs(#[from] KvsError),
}

#[derive(Debug)]
pub struct ScrubberResult {
    /// No issues were detected in this run.
    pub is_healthy: bool,
    /// Both phases drained their ranges.
    pub completed_successfully: bool,
    pub summary: ScrubSummary,
    /// Why the run stopped early, when it did.
    pub termination_reason: Option<String>,
    pub error: Option<ScrubError>,
}

impl ScrubberResult {
    pub(crate) fn completed(summary: ScrubSummary) -> Self {
        Self {
            is_healthy: summary.dangling.detected == 0 && summary.missing.detected == 0,
            completed_successfully: true,
            summary,
            termination_reason: None,
            error: None,
        }
    }

    pub(crate) fn cancelled(summary: ScrubSummary) -> Self {
        Self {
            is_healthy: summary.dangling.detected == 0 && summary.missing.detected == 0,
            completed_successfully: false,
            summary,
            termination_reason: Some("cancelled between batches".to_string()),
            error: None,
        }
    }

    pub(crate) fn terminated(summary: ScrubSummary, error: ScrubError) -> Self {
        Self {
            is_healthy: summary.dangling.detected == 0 && summary.missing.detected == 0,
            completed_successfully: false,
            summary,
            termination_reason: Some(error.to_string()),
            error: Some(error),
        }
    }
}
