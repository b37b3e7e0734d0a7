use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{SqlitePool, query, query_scalar};

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("failed to open tracker database at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("tracker query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Derive the default tracker location for a bucket and prefix.
///
/// The file name is the hex SHA-256 of `"{bucket}+{prefix}"`.
pub fn default_tracker_path(base_dir: &Path, bucket: &str, prefix: Option<&str>) -> PathBuf {
    let digest = Sha256::digest(format!("{bucket}+{}", prefix.unwrap_or_default()));
    base_dir.join(format!(".seendb_{}", hex::encode(digest)))
}

/// Durable set of object keys that have been fully emitted.
///
/// `seen` followed by `visit` is a check-then-act sequence; callers run it
/// from a single worker. Each `visit` and `destroy` is one atomic statement.
#[derive(Clone, Debug)]
pub struct Tracker {
    pool: SqlitePool,
}

impl Tracker {
    /// Open (creating if absent) the tracker database at `path`.
    pub async fn open(path: &Path) -> Result<Self, TrackerError> {
        log::info!("Opening tracker database at {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|source| {
                log::error!("Failed to open tracker database {}: {source}", path.display());
                TrackerError::Open {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        let tracker = Self { pool };
        tracker.init().await.map_err(|source| TrackerError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(tracker)
    }

    /// A tracker that lives only as long as the process.
    pub async fn in_memory() -> Result<Self, TrackerError> {
        // A second connection to `:memory:` would see a different database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .map_err(|source| TrackerError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;

        let tracker = Self { pool };
        tracker.init().await?;
        Ok(tracker)
    }

    /// Open an existing tracker database without writing to it.
    ///
    /// Returns `None` when nothing has been tracked at `path` yet.
    pub async fn open_read_only(path: &Path) -> Result<Option<Self>, TrackerError> {
        if !path.exists() {
            return Ok(None);
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|source| TrackerError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(Self { pool }))
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        let create_seen = r#"
        CREATE TABLE IF NOT EXISTS seen (
            key TEXT NOT NULL PRIMARY KEY
        )"#;
        query(create_seen).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns true if `key` has been visited.
    pub async fn seen(&self, key: &str) -> Result<bool, TrackerError> {
        let found: Option<String> = query_scalar("SELECT key FROM seen WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Record `key` as visited. Leaves exactly one record whatever the prior state.
    pub async fn visit(&self, key: &str) -> Result<(), TrackerError> {
        query("INSERT INTO seen (key) VALUES (?) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the record for `key`, if any.
    pub async fn destroy(&self, key: &str) -> Result<(), TrackerError> {
        query("DELETE FROM seen WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of records stored for `key` (0 or 1).
    pub async fn records(&self, key: &str) -> Result<i64, TrackerError> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM seen WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Total number of tracked keys.
    pub async fn len(&self) -> Result<i64, TrackerError> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM seen")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> Result<bool, TrackerError> {
        Ok(self.len().await? == 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
