//! The polling scan loop.
//!
//! Each pass lists the bucket, emits every line of every object not yet seen,
//! records the object and then hands it to the archiver. Passes repeat after
//! `poll_interval` until shutdown is signalled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::config::Configuration;
use common::{Bucket, ObjectRef, StorageError, Tracker, TrackerError};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::archiver::{ArchiveOutcome, ArchivePolicy, Archiver};
use crate::clock::{Clock, SystemClock};
use crate::codec::{Codec, PlainCodec, codec_for};
use crate::event::Decorator;
use crate::metrics::IngestMetrics;
use crate::reader::{ReadError, read_lines};
use crate::sink::{EventSink, SinkError};

/// Attempts at recording an object as seen before giving up on it.
const VISIT_ATTEMPTS: u32 = 3;
/// Linear backoff step between visit attempts.
const VISIT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub prefix: Option<String>,
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl ScanConfig {
    pub fn from_config(config: &Configuration) -> Self {
        Self {
            prefix: config.prefix().map(str::to_string),
            poll_interval: config.poll_interval,
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub listed: usize,
    pub processed: usize,
    pub skipped_seen: usize,
    pub failed: usize,
    pub events_emitted: u64,
    pub archived: usize,
    pub archive_failures: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("failed to list objects: {0}")]
    List(#[source] StorageError),
}

/// Why an object was left unseen.
#[derive(Debug, thiserror::Error)]
enum ObjectError {
    #[error("read failed: {0}")]
    Read(#[from] ReadError),
    #[error("emit failed: {0}")]
    Sink(#[from] SinkError),
}

pub struct Scanner {
    bucket: Arc<dyn Bucket>,
    tracker: Tracker,
    sink: Arc<dyn EventSink>,
    archiver: Archiver,
    codec: Arc<dyn Codec>,
    decorator: Decorator,
    clock: Arc<dyn Clock>,
    metrics: IngestMetrics,
    config: ScanConfig,
}

impl Scanner {
    /// A scanner emitting plain-text events with archiving disabled.
    pub fn new(
        bucket: Arc<dyn Bucket>,
        tracker: Tracker,
        sink: Arc<dyn EventSink>,
        config: ScanConfig,
    ) -> Self {
        let archiver = Archiver::new(bucket.clone(), tracker.clone(), ArchivePolicy::disabled());
        Self {
            bucket,
            tracker,
            sink,
            archiver,
            codec: Arc::new(PlainCodec),
            decorator: Decorator::default(),
            clock: Arc::new(SystemClock),
            metrics: IngestMetrics::new(),
            config,
        }
    }

    /// Wire a scanner from configuration.
    ///
    /// `archive_bucket` is the destination handle; archiving still requires
    /// `archive_after` to be set.
    pub fn from_config(
        config: &Configuration,
        bucket: Arc<dyn Bucket>,
        archive_bucket: Option<Arc<dyn Bucket>>,
        tracker: Tracker,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(bucket, tracker, sink, ScanConfig::from_config(config))
            .with_codec(codec_for(config.codec))
            .with_decorator(Decorator::new(
                config.tags.clone(),
                config.add_field.clone(),
            ))
            .with_archive_policy(ArchivePolicy::from_config(config, archive_bucket))
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_decorator(mut self, decorator: Decorator) -> Self {
        self.decorator = decorator;
        self
    }

    pub fn with_archive_policy(mut self, policy: ArchivePolicy) -> Self {
        self.archiver = Archiver::new(self.bucket.clone(), self.tracker.clone(), policy);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: IngestMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Run one full pass over the bucket.
    pub async fn run_pass(&self) -> Result<PassSummary, ScanError> {
        self.pass(None).await
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    ///
    /// A pass in progress finishes its current object before stopping.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            bucket = self.bucket.name(),
            prefix = self.config.prefix.as_deref().unwrap_or_default(),
            poll_interval = ?self.config.poll_interval,
            archive = self.archiver.policy().is_enabled(),
            "Starting scan loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.pass(Some(&shutdown)).await {
                warn!(error = %e, "Scan pass failed, retrying after poll interval");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(bucket = self.bucket.name(), "Scan loop stopped");
    }

    async fn pass(
        &self,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<PassSummary, ScanError> {
        let started = Instant::now();
        let cutoff = self.archiver.cutoff(self.clock.now());

        let objects = match self.bucket.list(self.config.prefix.as_deref()).await {
            Ok(objects) => objects,
            Err(e) => {
                self.metrics.record_failed_pass();
                return Err(ScanError::List(e));
            }
        };

        let mut summary = PassSummary {
            listed: objects.len(),
            ..Default::default()
        };

        for object in &objects {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                info!("Shutdown requested, ending pass early");
                break;
            }

            let key = object.key.as_str();
            match self.tracker.seen(key).await {
                Err(e) => {
                    warn!(key, error = %e, "Failed to check tracker, skipping object");
                    self.record_failure(&mut summary);
                    continue;
                }
                Ok(true) => {
                    summary.skipped_seen += 1;
                    self.metrics.record_object_skipped();
                }
                Ok(false) => {
                    let mut emitted = 0;
                    let result = self.emit_object(object, &mut emitted).await;
                    summary.events_emitted += emitted;
                    self.metrics.record_events_emitted(emitted);

                    if let Err(e) = result {
                        warn!(key, error = %e, events = emitted, "Failed to process object, it will be retried");
                        self.record_failure(&mut summary);
                        continue;
                    }
                    if let Err(e) = self.mark_visited(key).await {
                        error!(key, error = %e, "Failed to record object, it will be processed again");
                        self.record_failure(&mut summary);
                        continue;
                    }

                    debug!(key, events = emitted, "Processed object");
                    summary.processed += 1;
                    self.metrics.record_object_processed();
                }
            }

            match self.archiver.maybe_archive(object, cutoff).await {
                Ok(ArchiveOutcome::Archived { .. }) => {
                    summary.archived += 1;
                    self.metrics.record_object_archived();
                }
                Ok(ArchiveOutcome::Disabled | ArchiveOutcome::NotEligible | ArchiveOutcome::Gone) => {}
                Err(e) => {
                    warn!(key, error = %e, "Failed to archive object");
                    summary.archive_failures += 1;
                    self.metrics.record_archive_failure();
                }
            }
        }

        self.metrics.record_pass();
        info!(
            listed = summary.listed,
            processed = summary.processed,
            skipped = summary.skipped_seen,
            failed = summary.failed,
            events = summary.events_emitted,
            archived = summary.archived,
            archive_failures = summary.archive_failures,
            duration_ms = started.elapsed().as_millis() as u64,
            "Scan pass complete"
        );
        Ok(summary)
    }

    fn record_failure(&self, summary: &mut PassSummary) {
        summary.failed += 1;
        self.metrics.record_object_failed();
    }

    /// Decode, decorate and push every line in order.
    ///
    /// `emitted` counts pushed events even when the object fails part way.
    async fn emit_object(&self, object: &ObjectRef, emitted: &mut u64) -> Result<(), ObjectError> {
        let mut lines = read_lines(self.bucket.as_ref(), object).await?;
        while let Some(line) = lines.next().await {
            let line = line?;
            let now = self.clock.now();
            for mut event in self.codec.decode(&line) {
                self.decorator.decorate(&mut event, object, now);
                self.sink.push(event).await?;
                *emitted += 1;
            }
        }
        Ok(())
    }

    async fn mark_visited(&self, key: &str) -> Result<(), TrackerError> {
        let mut attempt = 1;
        loop {
            match self.tracker.visit(key).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < VISIT_ATTEMPTS => {
                    warn!(key, attempt, error = %e, "Failed to record object, retrying");
                    tokio::time::sleep(VISIT_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use chrono::Utc;
    use common::testing::MemoryBucket;
    use tokio::sync::mpsc;

    async fn scanner(bucket: Arc<MemoryBucket>) -> (Scanner, mpsc::Receiver<Event>) {
        let tracker = Tracker::in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        let scanner = Scanner::new(bucket, tracker, Arc::new(tx), ScanConfig::default());
        (scanner, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_pass_emits_lines_in_order() {
        let bucket = Arc::new(MemoryBucket::new("b"));
        bucket.put("a.txt", "one\ntwo\nthree\n", Utc::now());
        let (scanner, mut rx) = scanner(bucket).await;

        let summary = scanner.run_pass().await.unwrap();
        assert_eq!(summary.listed, 1);
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.events_emitted, 3);

        let messages: Vec<String> = drain(&mut rx)
            .iter()
            .map(|e| e.message().unwrap().to_string())
            .collect();
        assert_eq!(messages, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_second_pass_skips_seen_objects() {
        let bucket = Arc::new(MemoryBucket::new("b"));
        bucket.put("a.txt", "one\n", Utc::now());
        let (scanner, mut rx) = scanner(bucket.clone()).await;

        scanner.run_pass().await.unwrap();
        drain(&mut rx);

        let summary = scanner.run_pass().await.unwrap();
        assert_eq!(summary.skipped_seen, 1);
        assert_eq!(summary.events_emitted, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(bucket.read_count("a.txt"), 1);
        assert_eq!(scanner.metrics().passes(), 2);
        assert_eq!(scanner.metrics().objects_skipped(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_fails_the_pass() {
        let bucket = Arc::new(MemoryBucket::new("b"));
        bucket.fail_list(true);
        let (scanner, _rx) = scanner(bucket).await;

        assert!(matches!(scanner.run_pass().await, Err(ScanError::List(_))));
        assert_eq!(scanner.metrics().failed_passes(), 1);
        assert_eq!(scanner.metrics().passes(), 0);
    }

    #[tokio::test]
    async fn test_closed_sink_leaves_object_unseen() {
        let bucket = Arc::new(MemoryBucket::new("b"));
        bucket.put("a.txt", "one\n", Utc::now());
        let (scanner, rx) = scanner(bucket).await;
        drop(rx);

        let summary = scanner.run_pass().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 0);
        assert!(!scanner.tracker.seen("a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let bucket = Arc::new(MemoryBucket::new("b"));
        bucket.put("a.txt", "one\n", Utc::now());
        let (scanner, mut rx) = scanner(bucket).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            scanner.run(shutdown_rx).await;
            scanner
        });

        // The first pass runs immediately
        let event = rx.recv().await.unwrap();
        assert_eq!(event.message(), Some("one"));

        shutdown_tx.send(true).unwrap();
        let scanner = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(scanner.metrics().passes() >= 1);
    }
}
