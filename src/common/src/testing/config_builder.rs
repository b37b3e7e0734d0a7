//! Test configuration builder for creating test setups quickly.

use std::path::Path;
use std::time::Duration;

use crate::config::{CodecKind, Configuration};

/// Builder for creating test configurations.
///
/// Starts from an in-memory object store so nothing touches the network.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let config = TestConfigBuilder::new("logs")
///     .with_prefix("logs/")
///     .with_archive("cold", Duration::from_secs(24 * 3600))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl TestConfigBuilder {
    /// Create a configuration for `bucket` backed by `memory://` storage.
    pub fn new(bucket: &str) -> Self {
        Self {
            config: Configuration {
                bucket: bucket.to_string(),
                storage_dsn: Some("memory://".to_string()),
                poll_interval: Duration::from_millis(10),
                ..Configuration::default()
            },
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.config.prefix = Some(prefix.to_string());
        self
    }

    /// Enable archiving to `destination` once objects are older than `after`.
    pub fn with_archive(mut self, destination: &str, after: Duration) -> Self {
        self.config.archive_destination = Some(destination.to_string());
        self.config.archive_dsn = Some("memory://".to_string());
        self.config.archive_after = Some(after);
        self
    }

    pub fn with_archive_prefix(mut self, prefix: &str) -> Self {
        self.config.archive_prefix = Some(prefix.to_string());
        self
    }

    pub fn with_tracker_location(mut self, path: &Path) -> Self {
        self.config.tracker_location = Some(path.to_path_buf());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.config.codec = codec;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.config.tags.push(tag.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.config
            .add_field
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Configuration {
        self.config
    }
}
