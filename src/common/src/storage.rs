use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryFutureExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{
    MultipartUpload, ObjectMeta, ObjectStore, PutPayload, PutPayloadMut, aws::AmazonS3Builder,
    local::LocalFileSystem, memory::InMemory,
};
use url::Url;

/// Number of in-flight multipart chunks allowed while streaming a copy.
const MAX_CONCURRENT_PARTS: usize = 8;

/// Smallest part S3 accepts for anything but the last part.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// A snapshot of one object taken at listing time.
///
/// The object may have changed or disappeared by the time it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

impl ObjectRef {
    /// `bucket/key`, used as event provenance.
    pub fn path(&self) -> String {
        join_key(&self.bucket, &self.key)
    }
}

/// Join two key segments with exactly one `/` between them.
pub fn join_key(head: &str, tail: &str) -> String {
    let head = head.trim_end_matches('/');
    let tail = tail.trim_start_matches('/');
    if head.is_empty() {
        tail.to_string()
    } else {
        format!("{head}/{tail}")
    }
}

/// Streaming object body.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("object store error on '{key}': {source}")]
    Store {
        key: String,
        #[source]
        source: object_store::Error,
    },

    #[error("invalid object key '{key}': {source}")]
    InvalidKey {
        key: String,
        #[source]
        source: object_store::path::Error,
    },

    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn from_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => StorageError::NotFound {
                key: key.to_string(),
            },
            source => StorageError::Store {
                key: key.to_string(),
                source,
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// The object-store capabilities the ingester relies on.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// Bucket name used for provenance and logging
    fn name(&self) -> &str;

    /// List every object whose key starts with `prefix`.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectRef>, StorageError>;

    /// Open an object for a streaming read from the first byte.
    async fn read(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Store `body` under `key`, replacing any existing object.
    async fn write(&self, key: &str, body: ByteStream) -> Result<(), StorageError>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Keys are listed already encoded, so parse them back verbatim.
fn object_path(key: &str) -> Result<ObjectPath, StorageError> {
    ObjectPath::parse(key).map_err(|source| StorageError::InvalidKey {
        key: key.to_string(),
        source,
    })
}

/// Object-store prefixes are path based, so list from the last complete
/// directory and filter the rest by string prefix.
fn listing_root(prefix: Option<&str>) -> Option<ObjectPath> {
    let prefix = prefix?;
    let dir = &prefix[..prefix.rfind('/')?];
    if dir.trim_matches('/').is_empty() {
        None
    } else {
        ObjectPath::parse(dir).ok()
    }
}

fn matches_prefix(key: &str, prefix: Option<&str>) -> bool {
    match prefix {
        Some(prefix) => key.starts_with(prefix.trim_start_matches('/')),
        None => true,
    }
}

/// [`Bucket`] backed by an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreBucket {
    name: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn from_dsn(name: impl Into<String>, dsn: &str) -> Result<Self> {
        Ok(Self::new(name, create_object_store_from_dsn(dsn)?))
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    fn to_object_ref(&self, meta: ObjectMeta) -> ObjectRef {
        ObjectRef {
            bucket: self.name.clone(),
            key: meta.location.to_string(),
            last_modified: meta.last_modified,
            size: meta.size,
        }
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectRef>, StorageError> {
        let root = listing_root(prefix);
        let metas: Vec<ObjectMeta> = self
            .store
            .list(root.as_ref())
            .try_collect()
            .await
            .map_err(|e| StorageError::from_store(prefix.unwrap_or_default(), e))?;

        Ok(metas
            .into_iter()
            .map(|meta| self.to_object_ref(meta))
            .filter(|object| matches_prefix(&object.key, prefix))
            .collect())
    }

    async fn read(&self, key: &str) -> Result<ByteStream, StorageError> {
        let result = self
            .store
            .get(&object_path(key)?)
            .await
            .map_err(|e| StorageError::from_store(key, e))?;

        let owned_key = key.to_string();
        Ok(result
            .into_stream()
            .map_err(move |e| StorageError::from_store(&owned_key, e))
            .boxed())
    }

    async fn write(&self, key: &str, body: ByteStream) -> Result<(), StorageError> {
        let mut upload = self
            .store
            .put_multipart(&object_path(key)?)
            .await
            .map_err(|e| StorageError::from_store(key, e))?;

        let result = match upload_parts(upload.as_mut(), key, body).await {
            Ok(()) => upload
                .complete()
                .await
                .map(drop)
                .map_err(|e| StorageError::from_store(key, e)),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if let Err(abort_err) = upload.abort().await {
                log::warn!("Failed to abort multipart upload for {key}: {abort_err}");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&object_path(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::from_store(key, e)),
        }
    }
}

/// Send `body` as parts of at least [`PART_SIZE`] bytes, keeping up to
/// [`MAX_CONCURRENT_PARTS`] uploads in flight.
async fn upload_parts(
    upload: &mut dyn MultipartUpload,
    key: &str,
    body: ByteStream,
) -> Result<(), StorageError> {
    stream::try_unfold(Some(body), |body| async move {
        match body {
            Some(body) => next_part(body).await,
            None => Ok(None),
        }
    })
    .boxed()
    .map_ok(|part| {
        let key = key.to_string();
        upload
            .put_part(part)
            .map_err(move |e| StorageError::from_store(&key, e))
    })
    .try_buffer_unordered(MAX_CONCURRENT_PARTS)
    .try_collect()
    .await
}

/// Buffer the next part from `body`. The stream is handed back until it ends.
async fn next_part(
    mut body: ByteStream,
) -> Result<Option<(PutPayload, Option<ByteStream>)>, StorageError> {
    let mut part = PutPayloadMut::new();
    while let Some(chunk) = body.next().await {
        part.push(chunk?);
        if part.content_length() >= PART_SIZE {
            return Ok(Some((part.freeze(), Some(body))));
        }
    }
    if part.content_length() == 0 {
        Ok(None)
    } else {
        Ok(Some((part.freeze(), None)))
    }
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
pub fn create_s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_matches('/');

    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("us-east-1");

    let access_key = dsn.username();
    let secret_key = dsn.password().unwrap_or("");

    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    }

    // S3-compatible stores (MinIO etc) need an explicit endpoint
    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    if access_key.is_empty() {
        if let Ok(env_key) = std::env::var("AWS_ACCESS_KEY_ID") {
            builder = builder.with_access_key_id(env_key);
        }
        if let Ok(env_secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            builder = builder.with_secret_access_key(env_secret);
        }
        if let Ok(env_region) = std::env::var("AWS_DEFAULT_REGION") {
            builder = builder.with_region(env_region);
        }
    }

    Ok(builder)
}
