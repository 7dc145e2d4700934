//! Scrubber observability through the global meter.

use opentelemetry::metrics::{Counter, Gauge, Histogram};
use opentelemetry::{global, KeyValue};

#[derive(Clone, Debug)]
pub struct ScrubMetrics {
    entries_scanned: Counter<u64>,
    issues: Counter<u64>,
    skipped: Counter<u64>,
    batch_duration: Histogram<f64>,
    batch_size: Histogram<u64>,
    progress_ratio: Gauge<f64>,
}

impl ScrubMetrics {
    pub fn new() -> Self {
        let meter = global::meter("taxis-scrubber");

        Self {
            entries_scanned: meter.u64_counter("entries_scanned_total").build(),
            issues: meter.u64_counter("issues_total").build(),
            skipped: meter.u64_counter("skipped_total").build(),
            batch_duration: meter.f64_histogram("batch_duration_seconds").build(),
            batch_size: meter.u64_histogram("batch_size").build(),
            progress_ratio: meter.f64_gauge("progress_ratio").build(),
        }
    }

    pub fn record_scanned(&self, phase: &'static str, count: u64) {
        self.entries_scanned
            .add(count, &[KeyValue::new("phase", phase)]);
    }

    pub fn record_issue(&self, kind: &'static str, repaired: bool) {
        self.issues.add(
            1,
            &[
                KeyValue::new("type", kind),
                KeyValue::new("repaired", repaired),
            ],
        );
    }

    pub fn record_skipped(&self, phase: &'static str, reason: &'static str) {
        self.skipped.add(
            1,
            &[
                KeyValue::new("phase", phase),
                KeyValue::new("reason", reason),
            ],
        );
    }

    pub fn record_batch(&self, phase: &'static str, seconds: f64, size: u64) {
        let attrs = [KeyValue::new("phase", phase)];
        self.batch_duration.record(seconds, &attrs);
        self.batch_size.record(size, &attrs);
    }

    pub fn record_progress(&self, phase: &'static str, ratio: f64) {
        self.progress_ratio
            .record(ratio, &[KeyValue::new("phase", phase)]);
    }
}

impl Default for ScrubMetrics {
    fn default() -> Self {
        Self::new()
    }
}
