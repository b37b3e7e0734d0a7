//! Polls an object-store bucket and turns new objects into events.
//!
//! [`Scanner`] drives the loop: list, read unseen objects line by line,
//! decode and decorate each line, push events into an [`EventSink`], record
//! the object in the tracker, then hand it to the [`Archiver`].

pub mod archiver;
pub mod clock;
pub mod codec;
pub mod event;
pub mod metrics;
pub mod reader;
pub mod scanner;
pub mod sink;

pub use archiver::{ArchiveError, ArchiveOutcome, ArchivePolicy, Archiver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Codec, JsonLinesCodec, PlainCodec};
pub use event::{Decorator, Event};
pub use metrics::IngestMetrics;
pub use reader::{Lines, ReadError, read_lines};
pub use scanner::{PassSummary, ScanConfig, ScanError, Scanner};
pub use sink::{EventSink, SinkError};
