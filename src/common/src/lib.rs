pub mod cli;
pub mod config;
pub mod storage;
pub mod tracker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use storage::{Bucket, ObjectRef, ObjectStoreBucket, StorageError};
pub use tracker::{Tracker, TrackerError};
