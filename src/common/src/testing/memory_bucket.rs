//! In-memory [`Bucket`] with controllable timestamps and failure injection.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};

use crate::storage::{Bucket, ByteStream, ObjectRef, StorageError};

/// Default size of the chunks a read is split into.
const DEFAULT_CHUNK_SIZE: usize = 7;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Failures {
    list: bool,
    write: bool,
    delete: bool,
    /// Fail a read of this key after this many bytes were streamed
    read_after: HashMap<String, usize>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    failures: Failures,
    reads: HashMap<String, usize>,
}

/// A bucket that keeps objects in a sorted map.
///
/// Listing returns keys in lexical order, like S3. Reads are split into small
/// chunks so line splitting across chunk boundaries gets exercised.
#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    chunk_size: usize,
    inner: Mutex<Inner>,
}

impl MemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object with an explicit modification time.
    pub fn put(&self, key: &str, body: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                last_modified,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().objects.get(key).map(|o| o.body.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// How many times `key` was opened for reading.
    pub fn read_count(&self, key: &str) -> usize {
        self.lock().reads.get(key).copied().unwrap_or(0)
    }

    pub fn fail_list(&self, fail: bool) {
        self.lock().failures.list = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().failures.write = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().failures.delete = fail;
    }

    /// Make reads of `key` fail once `bytes` bytes have been streamed.
    pub fn fail_read_after(&self, key: &str, bytes: usize) {
        self.lock()
            .failures
            .read_after
            .insert(key.to_string(), bytes);
    }

    pub fn clear_read_failure(&self, key: &str) {
        self.lock().failures.read_after.remove(key);
    }

    fn injected(key: &str, what: &str) -> StorageError {
        StorageError::Io {
            key: key.to_string(),
            source: io::Error::other(format!("injected {what} failure")),
        }
    }
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectRef>, StorageError> {
        let inner = self.lock();
        if inner.failures.list {
            return Err(Self::injected(prefix.unwrap_or_default(), "list"));
        }

        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| prefix.is_none_or(|p| key.starts_with(p)))
            .map(|(key, object)| ObjectRef {
                bucket: self.name.clone(),
                key: key.clone(),
                last_modified: object.last_modified,
                size: object.body.len() as u64,
            })
            .collect())
    }

    async fn read(&self, key: &str) -> Result<ByteStream, StorageError> {
        let mut inner = self.lock();
        let body = inner
            .objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })?;
        *inner.reads.entry(key.to_string()).or_default() += 1;

        let fail_after = inner.failures.read_after.get(key).copied();
        let readable = match fail_after {
            Some(limit) => body.slice(..limit.min(body.len())),
            None => body,
        };

        let mut chunks: Vec<Result<Bytes, StorageError>> = readable
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if fail_after.is_some() {
            chunks.push(Err(Self::injected(key, "read")));
        }

        Ok(stream::iter(chunks).boxed())
    }

    async fn write(&self, key: &str, mut body: ByteStream) -> Result<(), StorageError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        if self.lock().failures.write {
            return Err(Self::injected(key, "write"));
        }
        self.put(key, buffer.freeze(), Utc::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.failures.delete {
            return Err(Self::injected(key, "delete"));
        }
        inner.objects.remove(key);
        Ok(())
    }
}
