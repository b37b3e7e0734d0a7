//! Scan passes against `file://` stores built through the DSN factory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::testing::TestConfigBuilder;
use common::{Bucket, ObjectStoreBucket, Tracker};
use ingester::{Event, Scanner};
use tokio::sync::mpsc;

fn file_dsn(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn write_object(root: &Path, key: &str, body: &str) {
    let path = root.join(key);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<String> {
    let mut messages = Vec::new();
    while let Ok(event) = rx.try_recv() {
        messages.push(event.message().unwrap_or_default().to_string());
    }
    messages
}

#[tokio::test]
async fn test_file_store_pass_and_archive() {
    let source_dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    write_object(source_dir.path(), "logs/a.txt", "first\nsecond\n");
    write_object(source_dir.path(), "skip/b.txt", "ignored\n");

    let mut config = TestConfigBuilder::new("local")
        .with_prefix("logs/")
        .with_archive("cold", Duration::from_millis(1))
        .with_archive_prefix("done")
        .with_tracker_location(&state_dir.path().join("seen.db"))
        .build();
    config.storage_dsn = Some(file_dsn(source_dir.path()));
    config.archive_dsn = Some(file_dsn(archive_dir.path()));
    assert!(config.archive_enabled());

    let source: Arc<dyn Bucket> =
        Arc::new(ObjectStoreBucket::from_dsn(&config.bucket, &config.source_dsn()).unwrap());
    let archive: Arc<dyn Bucket> = Arc::new(
        ObjectStoreBucket::from_dsn("cold", &config.archive_dsn().unwrap()).unwrap(),
    );
    let tracker = Tracker::open(&config.tracker_path(None).unwrap())
        .await
        .unwrap();

    // Let the objects age past the archive threshold
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, mut rx) = mpsc::channel(16);
    let scanner = Scanner::from_config(
        &config,
        source,
        Some(archive),
        tracker.clone(),
        Arc::new(tx),
    );

    let summary = scanner.run_pass().await.unwrap();
    assert_eq!(summary.listed, 1);
    assert_eq!(summary.events_emitted, 2);
    assert_eq!(summary.archived, 1);
    assert_eq!(drain(&mut rx), vec!["first", "second"]);

    assert!(!source_dir.path().join("logs/a.txt").exists());
    assert_eq!(
        std::fs::read_to_string(archive_dir.path().join("done/logs/a.txt")).unwrap(),
        "first\nsecond\n"
    );
    assert!(source_dir.path().join("skip/b.txt").exists());
    assert!(tracker.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_file_store_without_archive_keeps_records() {
    let source_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    write_object(source_dir.path(), "a.log", "one\n");
    write_object(source_dir.path(), "nested/b.log", "two\n");

    let mut config = TestConfigBuilder::new("local").build();
    config.storage_dsn = Some(file_dsn(source_dir.path()));

    let source: Arc<dyn Bucket> =
        Arc::new(ObjectStoreBucket::from_dsn(&config.bucket, &config.source_dsn()).unwrap());
    let tracker_path = config.tracker_path(Some(state_dir.path())).unwrap();
    let tracker = Tracker::open(&tracker_path).await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let scanner = Scanner::from_config(&config, source, None, tracker.clone(), Arc::new(tx));

    assert_eq!(scanner.run_pass().await.unwrap().events_emitted, 2);
    let mut messages = drain(&mut rx);
    messages.sort();
    assert_eq!(messages, vec!["one", "two"]);

    let again = scanner.run_pass().await.unwrap();
    assert_eq!(again.skipped_seen, 2);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(tracker.len().await.unwrap(), 2);
    assert!(tracker_path.starts_with(state_dir.path()));
}

#[tokio::test]
async fn test_file_store_keys_with_punctuation_are_ingested_and_archived() {
    let source_dir = tempfile::tempdir().unwrap();
    let archive_dir = tempfile::tempdir().unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    write_object(source_dir.path(), "logs/app~1.log", "tilde\n");
    write_object(source_dir.path(), "logs/run[2].log", "brackets\n");

    let mut config = TestConfigBuilder::new("local")
        .with_prefix("logs/")
        .with_archive("cold", Duration::from_millis(1))
        .with_tracker_location(&state_dir.path().join("seen.db"))
        .build();
    config.storage_dsn = Some(file_dsn(source_dir.path()));
    config.archive_dsn = Some(file_dsn(archive_dir.path()));

    let source: Arc<dyn Bucket> =
        Arc::new(ObjectStoreBucket::from_dsn(&config.bucket, &config.source_dsn()).unwrap());
    let archive: Arc<dyn Bucket> = Arc::new(
        ObjectStoreBucket::from_dsn("cold", &config.archive_dsn().unwrap()).unwrap(),
    );
    let tracker = Tracker::open(&config.tracker_path(None).unwrap())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (tx, mut rx) = mpsc::channel(16);
    let scanner = Scanner::from_config(
        &config,
        source,
        Some(archive),
        tracker.clone(),
        Arc::new(tx),
    );

    let summary = scanner.run_pass().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.archived, 2);
    let mut messages = drain(&mut rx);
    messages.sort();
    assert_eq!(messages, vec!["brackets", "tilde"]);

    assert!(archive_dir.path().join("logs/app~1.log").exists());
    assert!(archive_dir.path().join("logs/run[2].log").exists());
    assert!(!source_dir.path().join("logs/app~1.log").exists());
}
