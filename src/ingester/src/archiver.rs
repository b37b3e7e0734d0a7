//! Age-based relocation of processed objects.
//!
//! An eligible object is copied to the destination bucket, deleted from the
//! source and only then forgotten by the tracker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::Configuration;
use common::storage::join_key;
use common::{Bucket, ObjectRef, StorageError, Tracker};

/// When and where processed objects are moved.
#[derive(Debug, Clone, Default)]
pub struct ArchivePolicy {
    /// Minimum age before an object is moved.
    pub after: Option<Duration>,
    pub destination: Option<Arc<dyn Bucket>>,
    /// Key prefix inside the destination bucket.
    pub prefix: Option<String>,
}

impl ArchivePolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Policy from configuration, with the destination bucket already built.
    ///
    /// Archiving stays off unless both an age and a destination are set.
    pub fn from_config(config: &Configuration, destination: Option<Arc<dyn Bucket>>) -> Self {
        Self {
            after: config.archive_after,
            destination,
            prefix: config.archive_prefix().map(str::to_string),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.after.is_some() && self.destination.is_some()
    }

    pub fn destination_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => join_key(prefix, key),
            None => key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Disabled,
    NotEligible,
    Archived { destination_key: String },
    /// The source was already gone; its stale record was dropped.
    Gone,
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("failed to copy '{key}' to '{destination_key}': {source}")]
    Copy {
        key: String,
        destination_key: String,
        #[source]
        source: StorageError,
    },

    #[error("refusing to archive '{key}' onto itself in bucket '{bucket}'")]
    OntoSource { key: String, bucket: String },

    #[error("failed to delete archived object '{key}': {source}")]
    Delete {
        key: String,
        #[source]
        source: StorageError,
    },
}

pub struct Archiver {
    source: Arc<dyn Bucket>,
    tracker: Tracker,
    policy: ArchivePolicy,
}

impl Archiver {
    pub fn new(source: Arc<dyn Bucket>, tracker: Tracker, policy: ArchivePolicy) -> Self {
        Self {
            source,
            tracker,
            policy,
        }
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }

    /// Objects last modified strictly before the cutoff are eligible.
    ///
    /// `None` when archiving is disabled.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.policy.is_enabled() {
            return None;
        }
        let after = chrono::Duration::from_std(self.policy.after?).ok()?;
        now.checked_sub_signed(after)
    }

    pub async fn maybe_archive(
        &self,
        object: &ObjectRef,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<ArchiveOutcome, ArchiveError> {
        let (Some(cutoff), Some(destination)) = (cutoff, self.policy.destination.as_deref())
        else {
            return Ok(ArchiveOutcome::Disabled);
        };
        if object.last_modified >= cutoff {
            return Ok(ArchiveOutcome::NotEligible);
        }

        let key = object.key.as_str();
        let destination_key = self.policy.destination_key(key);

        // Copying onto the same key and then deleting it would lose the object
        if destination_key == key && destination.name() == self.source.name() {
            return Err(ArchiveError::OntoSource {
                key: key.to_string(),
                bucket: destination.name().to_string(),
            });
        }

        let body = match self.source.read(key).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                tracing::info!(key, "Object already relocated, dropping its record");
                self.forget(key).await;
                return Ok(ArchiveOutcome::Gone);
            }
            Err(source) => {
                return Err(ArchiveError::Copy {
                    key: key.to_string(),
                    destination_key,
                    source,
                });
            }
        };

        if let Err(source) = destination.write(&destination_key, body).await {
            return Err(ArchiveError::Copy {
                key: key.to_string(),
                destination_key,
                source,
            });
        }

        self.source
            .delete(key)
            .await
            .map_err(|source| ArchiveError::Delete {
                key: key.to_string(),
                source,
            })?;

        self.forget(key).await;

        tracing::info!(
            key,
            bucket = destination.name(),
            destination_key = %destination_key,
            "Archived object"
        );
        Ok(ArchiveOutcome::Archived { destination_key })
    }

    /// Drop the tracker record of a relocated object.
    ///
    /// A leftover record is harmless since the key no longer lists.
    async fn forget(&self, key: &str) {
        if let Err(e) = self.tracker.destroy(key).await {
            tracing::error!(key, error = %e, "Failed to remove record of archived object");
        }
    }
}
