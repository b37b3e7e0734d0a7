//! Test utilities for s3tail.
//!
//! This module provides an in-memory bucket with failure injection and a
//! builder for test configurations.
//!
//! # Feature Flag
//!
//! This module is only available when the `testing` feature is enabled or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::{MemoryBucket, TestConfigBuilder};
//!
//! let bucket = MemoryBucket::new("logs");
//! let config = TestConfigBuilder::new("logs")
//!     .with_prefix("app/")
//!     .with_archive("cold", Duration::from_secs(3600))
//!     .build();
//! ```

mod config_builder;
mod memory_bucket;

pub use config_builder::TestConfigBuilder;
pub use memory_bucket::MemoryBucket;
