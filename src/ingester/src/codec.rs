//! Line codecs: turn one raw line into zero or more events.

use std::sync::Arc;

use common::config::CodecKind;
use serde_json::Value;

use crate::event::Event;

/// Tag added when a JSON line cannot be parsed into an object.
pub const JSON_PARSE_FAILURE_TAG: &str = "_jsonparsefailure";

/// Decodes a raw line into events.
///
/// Called exactly once per line, in line order. Must not block.
pub trait Codec: Send + Sync {
    fn decode(&self, line: &str) -> Vec<Event>;
}

/// One event per line with the line as `message`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn decode(&self, line: &str) -> Vec<Event> {
        vec![Event::from_message(line)]
    }
}

/// Each line is a JSON object whose fields become the event.
///
/// Blank lines are skipped. Lines that are not a JSON object are kept as a
/// `message` and tagged with [`JSON_PARSE_FAILURE_TAG`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl Codec for JsonLinesCodec {
    fn decode(&self, line: &str) -> Vec<Event> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(fields)) => vec![Event::from_fields(fields)],
            Ok(_) | Err(_) => {
                tracing::debug!(line = %trimmed, "Line is not a JSON object");
                let mut event = Event::from_message(line);
                event.add_tag(JSON_PARSE_FAILURE_TAG);
                vec![event]
            }
        }
    }
}

pub fn codec_for(kind: CodecKind) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Plain => Arc::new(PlainCodec),
        CodecKind::JsonLines => Arc::new(JsonLinesCodec),
    }
}
