//! s3tail
//!
//! Polls a bucket for new objects and writes one JSON line per event to
//! stdout. Logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use common::{Bucket, ObjectStoreBucket, Tracker};
use ingester::{Event, Scanner};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Events buffered between the scanner and the stdout writer.
const EVENT_BUFFER: usize = 1024;

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

fn tracker_path(config: &Configuration) -> Result<PathBuf> {
    config
        .tracker_path(home_dir().as_deref())
        .context("Cannot determine tracker location")
}

async fn open_tracker(config: &Configuration) -> Result<Tracker> {
    let path = tracker_path(config)?;
    let tracker = Tracker::open(&path)
        .await
        .with_context(|| format!("Failed to open tracker at {}", path.display()))?;
    log::info!("Using tracker at {}", path.display());
    Ok(tracker)
}

/// Report the tracker without creating it.
async fn print_status(config: &Configuration) -> Result<()> {
    let path = tracker_path(config)?;
    let records = match Tracker::open_read_only(&path)
        .await
        .with_context(|| format!("Failed to open tracker at {}", path.display()))?
    {
        Some(tracker) => {
            let records = tracker
                .len()
                .await
                .context("Failed to count tracked keys")?;
            tracker.close().await;
            records
        }
        None => 0,
    };
    println!("Tracker: {}", path.display());
    println!("Tracked keys: {records}");
    Ok(())
}

/// Build the source bucket and, when archiving is on, the destination.
///
/// The destination shares the source handle when it names the same store.
fn open_buckets(config: &Configuration) -> Result<(Arc<dyn Bucket>, Option<Arc<dyn Bucket>>)> {
    let source_dsn = config.source_dsn();
    let source: Arc<dyn Bucket> = Arc::new(
        ObjectStoreBucket::from_dsn(&config.bucket, &source_dsn)
            .with_context(|| format!("Failed to open bucket '{}'", config.bucket))?,
    );

    let archive = match (config.archive_destination(), config.archive_dsn()) {
        (Some(destination), Some(dsn)) if config.archive_enabled() => {
            if destination == config.bucket && dsn == source_dsn {
                Some(source.clone())
            } else {
                let bucket = ObjectStoreBucket::from_dsn(destination, &dsn).with_context(|| {
                    format!("Failed to open archive bucket '{destination}'")
                })?;
                Some(Arc::new(bucket) as Arc<dyn Bucket>)
            }
        }
        _ => None,
    };

    Ok((source, archive))
}

/// Write events to stdout as JSON lines until every sender is gone.
fn spawn_event_writer(mut events: mpsc::Receiver<Event>) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = std::io::BufWriter::new(stdout.lock());
        while let Some(event) = events.blocking_recv() {
            let line = event
                .to_json_line()
                .context("Failed to serialize event")?;
            writeln!(out, "{line}").context("Failed to write event to stdout")?;
            if events.is_empty() {
                out.flush().context("Failed to flush stdout")?;
            }
        }
        out.flush().context("Failed to flush stdout")?;
        Ok(())
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CommonArgs::parse();
    utils::init_logging(&args);

    let config = utils::load_config(args.config.as_ref())?;
    let command = args.command.clone().unwrap_or_default();
    if utils::handle_common_command(&command, &config)? {
        return Ok(());
    }
    utils::validate_config(&config)?;

    if let CommonCommands::Status = command {
        return print_status(&config).await;
    }

    let tracker = open_tracker(&config).await?;

    let (source, archive) = open_buckets(&config)?;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let writer = spawn_event_writer(rx);
    let scanner = Scanner::from_config(&config, source, archive, tracker.clone(), Arc::new(tx));

    if let CommonCommands::Once = command {
        let summary = scanner.run_pass().await.context("Scan pass failed")?;
        log::info!(
            "Pass complete: {} listed, {} processed, {} events, {} archived",
            summary.listed,
            summary.processed,
            summary.events_emitted,
            summary.archived
        );
        drop(scanner);
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scan = tokio::spawn(async move { scanner.run(shutdown_rx).await });

        log::info!("s3tail running, waiting for shutdown signal");
        wait_for_shutdown_signal().await?;
        log::info!("Received shutdown signal, stopping s3tail");

        let _ = shutdown_tx.send(true);
        scan.await.context("Scan loop failed")?;
    }

    writer
        .await
        .context("Event writer failed")?
        .context("Failed to emit events")?;
    tracker.close().await;

    log::info!("s3tail stopped");
    Ok(())
}
