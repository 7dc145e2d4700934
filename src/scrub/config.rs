//! Scrubber configuration and presets.

use std::time::Duration;

use taxis_core::IndexKind;

/// Hard ceiling on the per-batch byte budget, kept under the store's
/// 10 MB commit limit.
pub const MAX_TRANSACTION_BYTES: usize = 9 * 1024 * 1024;

/// Hard ceiling on the per-transaction deadline, kept under the store's
/// 5 s commit limit.
pub const MAX_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
pub struct ScrubberConfig {
    /// Entries processed per batch before handing back a continuation.
    pub entries_scan_limit: usize,
    /// Byte budget per batch; at least one entry is always processed.
    pub max_transaction_bytes: usize,
    pub transaction_timeout: Duration,
    /// Read the batch through the transaction's own writes instead of at
    /// snapshot isolation.
    pub read_your_writes: bool,
    /// Repair issues as they are found instead of only reporting them.
    pub allow_repair: bool,
    /// Index kinds this scrubber knows how to check.
    pub supported_kinds: Vec<IndexKind>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Emit per-batch progress logs.
    pub log_progress: bool,
    /// Recompute the progress gauge every this many batches.
    pub progress_refresh_batches: u64,
}

impl Default for ScrubberConfig {
    fn default() -> Self {
        Self {
            entries_scan_limit: 1_000,
            max_transaction_bytes: MAX_TRANSACTION_BYTES,
            transaction_timeout: MAX_TRANSACTION_TIMEOUT,
            read_your_writes: false,
            allow_repair: false,
            supported_kinds: vec![IndexKind::Value],
            max_retries: 5,
            retry_delay: Duration::from_millis(100),
            log_progress: true,
            progress_refresh_batches: 10,
        }
    }
}

impl ScrubberConfig {
    /// Small batches, short deadlines, report-only.
    pub fn conservative() -> Self {
        Self {
            entries_scan_limit: 100,
            max_transaction_bytes: 1024 * 1024,
            transaction_timeout: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_millis(250),
            ..Self::default()
        }
    }

    /// Full budgets and automatic repair.
    pub fn aggressive() -> Self {
        Self {
            entries_scan_limit: 5_000,
            allow_repair: true,
            max_retries: 8,
            ..Self::default()
        }
    }

    /// Clamp budgets to the hard ceilings.
    pub fn clamped(mut self) -> Self {
        self.max_transaction_bytes = self.max_transaction_bytes.min(MAX_TRANSACTION_BYTES);
        self.transaction_timeout = self.transaction_timeout.min(MAX_TRANSACTION_TIMEOUT);
        self
    }
}
