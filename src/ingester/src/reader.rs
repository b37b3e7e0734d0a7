//! Streaming line reader over bucket objects.
//!
//! Bytes are pulled from the bucket as they are consumed; only the current
//! chunk and the current line are held in memory. Objects whose key ends in
//! `.gz` are gunzipped on the fly.

use std::future::Future;
use std::io::{self, BufRead, BufReader};
use std::pin::Pin;
use std::task::{Context, Poll};

use common::{Bucket, ObjectRef, StorageError};
use flate2::read::MultiGzDecoder;
use futures::{Stream, TryStreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};

/// Key suffix marking gzip-compressed objects.
pub const GZIP_SUFFIX: &str = ".gz";

/// Lines decoded ahead of the consumer.
const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_key(key: &str) -> Self {
        if key.ends_with(GZIP_SUFFIX) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed to open object: {0}")]
    Open(#[from] StorageError),

    #[error("transport failure while reading '{key}': {source}")]
    Transport {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt or truncated content in '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("line reader for '{key}' stopped unexpectedly")]
    Closed { key: String },
}

impl ReadError {
    fn classify(key: &str, source: io::Error) -> Self {
        let from_store = source
            .get_ref()
            .is_some_and(|inner| inner.is::<StorageError>());
        if from_store {
            ReadError::Transport {
                key: key.to_string(),
                source,
            }
        } else {
            ReadError::Corrupt {
                key: key.to_string(),
                source,
            }
        }
    }
}

type LineResult = Result<String, ReadError>;

/// Lazy sequence of lines from one object.
///
/// The sequence ends after the first error. Dropping it releases the
/// underlying object stream and any decompressor.
#[derive(Debug)]
pub struct Lines {
    key: String,
    rx: mpsc::Receiver<LineResult>,
    task: JoinHandle<()>,
    done: bool,
}

impl Stream for Lines {
    type Item = LineResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(line))) => Poll::Ready(Some(Ok(line))),
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            // Sender gone: either a clean end of object or a panicked reader
            Poll::Ready(None) => match Pin::new(&mut this.task).poll(cx) {
                Poll::Ready(Ok(())) => {
                    this.done = true;
                    Poll::Ready(None)
                }
                Poll::Ready(Err(_)) => {
                    this.done = true;
                    Poll::Ready(Some(Err(ReadError::Closed {
                        key: this.key.clone(),
                    })))
                }
                Poll::Pending => Poll::Pending,
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Open `object` and stream its lines from the first byte.
///
/// Each call starts a fresh read. Open failures (including not-found) are
/// returned here; failures after the first byte end the stream with an error.
pub async fn read_lines(bucket: &dyn Bucket, object: &ObjectRef) -> Result<Lines, ReadError> {
    let body = bucket.read(&object.key).await?;
    let compression = Compression::from_key(&object.key);
    let reader = SyncIoBridge::new(StreamReader::new(body.map_err(io::Error::other)));

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let key = object.key.clone();
    let task = tokio::task::spawn_blocking(move || match compression {
        Compression::Gzip => pump(BufReader::new(MultiGzDecoder::new(reader)), &key, &tx),
        Compression::None => pump(reader, &key, &tx),
    });

    Ok(Lines {
        key: object.key.clone(),
        rx,
        task,
        done: false,
    })
}

fn pump<R: BufRead>(mut reader: R, key: &str, tx: &mpsc::Sender<LineResult>) {
    let mut buf = Vec::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                if tx.blocking_send(Ok(decode_line(&buf))).is_err() {
                    // Consumer dropped the stream
                    return;
                }
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(ReadError::classify(key, e)));
                return;
            }
        }
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
