use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::storage::join_key;
use crate::tracker::default_tracker_path;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "s3tail.toml";

/// Prefix for environment overrides, nested with `__`.
pub const ENV_PREFIX: &str = "S3TAIL__";

/// Line codec used to turn raw lines into events.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// One event per line, the line becomes `message`
    #[default]
    Plain,
    /// Each line is a JSON object
    JsonLines,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Bucket to read logs from
    pub bucket: String,
    /// Only keys starting with this prefix are listed
    pub prefix: Option<String>,
    /// Object store DSN for the source bucket (s3://, file://, memory://)
    pub storage_dsn: Option<String>,
    /// Age after which an object is archived. Hours or a humantime string;
    /// negative disables archiving.
    #[serde(with = "archive_after")]
    pub archive_after: Option<Duration>,
    /// Bucket to archive objects to; empty disables archiving
    pub archive_destination: Option<String>,
    /// Object store DSN for the archive bucket
    pub archive_dsn: Option<String>,
    /// Prefix prepended to archived keys
    pub archive_prefix: Option<String>,
    /// Where the seen-keys database lives
    pub tracker_location: Option<PathBuf>,
    /// Wait between two passes
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub codec: CodecKind,
    /// Tags appended to every event
    pub tags: Vec<String>,
    /// Extra fields added to every event
    pub add_field: BTreeMap<String, String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: None,
            storage_dsn: None,
            archive_after: None,
            archive_destination: None,
            archive_dsn: None,
            archive_prefix: None,
            tracker_location: None,
            poll_interval: Duration::from_secs(60),
            codec: CodecKind::Plain,
            tags: Vec::new(),
            add_field: BTreeMap::new(),
        }
    }
}

/// Errors raised while validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bucket is required")]
    MissingBucket,

    #[error("poll_interval must be greater than zero")]
    InvalidPollInterval,

    #[error(
        "archiving into the source bucket would overwrite or rescan objects, set an archive_prefix outside the scanned prefix"
    )]
    ArchiveOverlapsSource,

    #[error("no tracker_location configured and no home directory to derive one from")]
    NoTrackerLocation,
}

impl Configuration {
    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_FILE))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::MissingBucket);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.archive_enabled() && self.archive_overlaps_source() {
            return Err(ConfigError::ArchiveOverlapsSource);
        }
        if self.archive_after.is_some() && self.archive_destination().is_none() {
            log::warn!("archive_after is set but archive_destination is empty, archiving stays off");
        }
        Ok(())
    }

    pub fn prefix(&self) -> Option<&str> {
        non_empty(self.prefix.as_deref())
    }

    pub fn archive_destination(&self) -> Option<&str> {
        non_empty(self.archive_destination.as_deref())
    }

    pub fn archive_prefix(&self) -> Option<&str> {
        non_empty(self.archive_prefix.as_deref())
    }

    /// Archiving needs both a destination and an age threshold.
    pub fn archive_enabled(&self) -> bool {
        self.archive_destination().is_some() && self.archive_after.is_some()
    }

    /// True when archived keys land in the scanned store under the scanned
    /// prefix, so they would be overwritten or listed again.
    pub fn archive_overlaps_source(&self) -> bool {
        let same_store = self.archive_destination() == Some(self.bucket.as_str())
            && self.archive_dsn().as_deref() == Some(self.source_dsn().as_str());
        if !same_store {
            return false;
        }
        let archive_prefix = self.archive_prefix().unwrap_or_default();
        if archive_prefix.trim_matches('/').is_empty() {
            return true;
        }
        // Archived keys all start with `{archive_prefix}/{prefix}`
        let prefix = self.prefix().unwrap_or_default().trim_start_matches('/');
        join_key(archive_prefix, prefix).starts_with(prefix)
    }

    pub fn source_dsn(&self) -> String {
        match non_empty(self.storage_dsn.as_deref()) {
            Some(dsn) => dsn.to_string(),
            None => s3_dsn_for_bucket(&self.bucket),
        }
    }

    pub fn archive_dsn(&self) -> Option<String> {
        let destination = self.archive_destination()?;
        Some(match non_empty(self.archive_dsn.as_deref()) {
            Some(dsn) => dsn.to_string(),
            None => s3_dsn_for_bucket(destination),
        })
    }

    /// Resolve the tracker database path.
    ///
    /// An explicit `tracker_location` wins. Otherwise the path is derived from
    /// bucket and prefix under `home`.
    pub fn tracker_path(&self, home: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(location) = &self.tracker_location
            && !location.as_os_str().is_empty()
        {
            return Ok(location.clone());
        }
        let home = home.ok_or(ConfigError::NoTrackerLocation)?;
        Ok(default_tracker_path(home, &self.bucket, self.prefix()))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn s3_dsn_for_bucket(bucket: &str) -> String {
    format!("s3://s3.amazonaws.com/{bucket}")
}

/// `archive_after` accepts a number of hours (negative disables) or a
/// humantime duration such as `"36h"` or `"2days"`.
mod archive_after {
    use std::time::Duration;

    use humantime_serde::re::humantime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Hours(i64),
        FractionalHours(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<Raw>::deserialize(d)? {
            None => Ok(None),
            Some(Raw::Hours(h)) => Ok(from_hours(h as f64)),
            Some(Raw::FractionalHours(h)) => Ok(from_hours(h)),
            Some(Raw::Text(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                if let Ok(hours) = text.parse::<f64>() {
                    return Ok(from_hours(hours));
                }
                humantime::parse_duration(text)
                    .map(Some)
                    .map_err(|e| D::Error::custom(format!("invalid archive_after '{text}': {e}")))
            }
        }
    }

    fn from_hours(hours: f64) -> Option<Duration> {
        if hours < 0.0 || !hours.is_finite() {
            None
        } else {
            Some(Duration::from_secs_f64(hours * 3600.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert!(config.bucket.is_empty());
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.archive_after.is_none());
        assert!(!config.archive_enabled());
        assert_eq!(config.codec, CodecKind::Plain);
    }

    #[test]
    fn test_configless_operation() {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .extract::<Configuration>()
            .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.archive_after.is_none());
        assert!(config.prefix().is_none());
    }

    #[test]
    fn test_load_from_toml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "s3tail.toml",
                r#"
                bucket = "logs-bucket"
                prefix = "logs/"
                archive_after = 24
                archive_destination = "cold-bucket"
                archive_prefix = "archived"
                poll_interval = "5m"
                codec = "json_lines"
                tags = ["s3"]

                [add_field]
                env = "prod"
                "#,
            )?;

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.bucket, "logs-bucket");
            assert_eq!(config.prefix(), Some("logs/"));
            assert_eq!(config.archive_after, Some(Duration::from_secs(24 * 3600)));
            assert_eq!(config.archive_destination(), Some("cold-bucket"));
            assert_eq!(config.archive_prefix(), Some("archived"));
            assert_eq!(config.poll_interval, Duration::from_secs(300));
            assert_eq!(config.codec, CodecKind::JsonLines);
            assert_eq!(config.tags, vec!["s3".to_string()]);
            assert_eq!(config.add_field.get("env").map(String::as_str), Some("prod"));
            assert!(config.archive_enabled());
            Ok(())
        });
    }

    #[test]
    fn test_archive_after_accepts_humantime() {
        Jail::expect_with(|jail| {
            jail.create_file("s3tail.toml", "bucket = \"b\"\narchive_after = \"90m\"")?;
            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.archive_after, Some(Duration::from_secs(90 * 60)));
            Ok(())
        });
    }

    #[test]
    fn test_negative_archive_after_disables_archiving() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "s3tail.toml",
                "bucket = \"b\"\narchive_after = -1\narchive_destination = \"cold\"",
            )?;
            let config = Configuration::load().map_err(|e| *e)?;
            assert!(config.archive_after.is_none());
            assert!(!config.archive_enabled());
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        Jail::expect_with(|jail| {
            jail.create_file("s3tail.toml", "bucket = \"from-file\"")?;
            jail.set_env("S3TAIL__BUCKET", "from-env");
            jail.set_env("S3TAIL__ARCHIVE_AFTER", "12");
            jail.set_env("S3TAIL__POLL_INTERVAL", "30s");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.bucket, "from-env");
            assert_eq!(config.archive_after, Some(Duration::from_secs(12 * 3600)));
            assert_eq!(config.poll_interval, Duration::from_secs(30));
            Ok(())
        });
    }

    #[test]
    fn test_validate_requires_bucket() {
        let config = Configuration::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingBucket)));

        let config = Configuration {
            bucket: "b".to_string(),
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPollInterval)
        ));
    }

    #[test]
    fn test_empty_destination_disables_archiving() {
        let config = Configuration {
            bucket: "b".to_string(),
            archive_after: Some(Duration::from_secs(3600)),
            archive_destination: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(!config.archive_enabled());
        assert!(config.archive_dsn().is_none());
    }

    #[test]
    fn test_archive_into_source_bucket() {
        let base = Configuration {
            bucket: "logs".to_string(),
            prefix: Some("app/".to_string()),
            archive_after: Some(Duration::from_secs(3600)),
            archive_destination: Some("logs".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            base.validate(),
            Err(ConfigError::ArchiveOverlapsSource)
        ));

        let inside = Configuration {
            prefix: None,
            archive_prefix: Some("archive".to_string()),
            ..base.clone()
        };
        assert!(matches!(
            inside.validate(),
            Err(ConfigError::ArchiveOverlapsSource)
        ));

        let under_prefix = Configuration {
            prefix: Some("a".to_string()),
            archive_prefix: Some("archive".to_string()),
            ..base.clone()
        };
        assert!(under_prefix.archive_overlaps_source());

        let outside = Configuration {
            archive_prefix: Some("archive".to_string()),
            ..base.clone()
        };
        assert!(outside.validate().is_ok());

        let other_store = Configuration {
            archive_dsn: Some("memory://".to_string()),
            ..base
        };
        assert!(!other_store.archive_overlaps_source());
    }

    #[test]
    fn test_dsn_defaults_to_s3_bucket() {
        let config = Configuration {
            bucket: "logs".to_string(),
            archive_destination: Some("cold".to_string()),
            ..Default::default()
        };
        assert_eq!(config.source_dsn(), "s3://s3.amazonaws.com/logs");
        assert_eq!(
            config.archive_dsn().as_deref(),
            Some("s3://s3.amazonaws.com/cold")
        );

        let config = Configuration {
            bucket: "logs".to_string(),
            storage_dsn: Some("memory://".to_string()),
            ..Default::default()
        };
        assert_eq!(config.source_dsn(), "memory://");
    }

    #[test]
    fn test_tracker_path_resolution() {
        let config = Configuration {
            bucket: "logs".to_string(),
            prefix: Some("app/".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            config.tracker_path(None),
            Err(ConfigError::NoTrackerLocation)
        ));

        let derived = config.tracker_path(Some(Path::new("/home/ops"))).unwrap();
        assert_eq!(
            derived,
            default_tracker_path(Path::new("/home/ops"), "logs", Some("app/"))
        );

        let explicit = Configuration {
            tracker_location: Some(PathBuf::from("/var/lib/s3tail/seen.db")),
            ..config
        };
        assert_eq!(
            explicit.tracker_path(None).unwrap(),
            PathBuf::from("/var/lib/s3tail/seen.db")
        );
    }
}
