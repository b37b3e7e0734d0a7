//! Ingestion Metrics
//!
//! Thread-safe counters for scan passes, emitted events and archive moves.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Thread-safe metrics shared between the scanner and its callers
#[derive(Debug, Clone, Default)]
pub struct IngestMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Completed scan passes
    passes: AtomicUsize,
    /// Passes aborted because the listing failed
    failed_passes: AtomicUsize,
    /// Objects fully read and recorded
    objects_processed: AtomicUsize,
    /// Objects whose processing failed and will be retried
    objects_failed: AtomicUsize,
    /// Objects skipped because they were already seen
    objects_skipped: AtomicUsize,
    /// Events handed to the sink
    events_emitted: AtomicU64,
    /// Objects moved to the archive destination
    objects_archived: AtomicUsize,
    /// Failed copy or delete attempts
    archive_failures: AtomicUsize,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pass(&self) {
        self.inner.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_pass(&self) {
        self.inner.failed_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_object_processed(&self) {
        self.inner.objects_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_object_failed(&self) {
        self.inner.objects_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_object_skipped(&self) {
        self.inner.objects_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_emitted(&self, count: u64) {
        self.inner
            .events_emitted
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_object_archived(&self) {
        self.inner.objects_archived.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive_failure(&self) {
        self.inner.archive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passes(&self) -> usize {
        self.inner.passes.load(Ordering::Relaxed)
    }

    pub fn failed_passes(&self) -> usize {
        self.inner.failed_passes.load(Ordering::Relaxed)
    }

    pub fn objects_processed(&self) -> usize {
        self.inner.objects_processed.load(Ordering::Relaxed)
    }

    pub fn objects_failed(&self) -> usize {
        self.inner.objects_failed.load(Ordering::Relaxed)
    }

    pub fn objects_skipped(&self) -> usize {
        self.inner.objects_skipped.load(Ordering::Relaxed)
    }

    pub fn events_emitted(&self) -> u64 {
        self.inner.events_emitted.load(Ordering::Relaxed)
    }

    pub fn objects_archived(&self) -> usize {
        self.inner.objects_archived.load(Ordering::Relaxed)
    }

    pub fn archive_failures(&self) -> usize {
        self.inner.archive_failures.load(Ordering::Relaxed)
    }
}
