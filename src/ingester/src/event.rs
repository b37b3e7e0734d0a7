//! Structured events and provenance decoration.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use common::ObjectRef;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const MESSAGE_FIELD: &str = "message";
pub const TIMESTAMP_FIELD: &str = "@timestamp";
pub const PATH_FIELD: &str = "path";
pub const TAGS_FIELD: &str = "tags";

/// A decoded log event: an ordered JSON object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event carrying a single `message` field.
    pub fn from_message(message: impl Into<String>) -> Self {
        let mut event = Self::new();
        event.set(MESSAGE_FIELD, message.into());
        event
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn message(&self) -> Option<&str> {
        self.get_str(MESSAGE_FIELD)
    }

    pub fn tags(&self) -> Vec<&str> {
        match self.fields.get(TAGS_FIELD) {
            Some(Value::Array(tags)) => tags.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(tag)) => vec![tag.as_str()],
            _ => Vec::new(),
        }
    }

    /// Append `tag` unless it is already present.
    ///
    /// A scalar `tags` value is turned into an array first.
    pub fn add_tag(&mut self, tag: &str) {
        let entry = self
            .fields
            .entry(TAGS_FIELD.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));

        if !entry.is_array() {
            let previous = entry.take();
            *entry = Value::Array(if previous.is_null() {
                Vec::new()
            } else {
                vec![previous]
            });
        }

        if let Value::Array(tags) = entry
            && !tags.iter().any(|t| t.as_str() == Some(tag))
        {
            tags.push(Value::String(tag.to_string()));
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Serialize as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.fields)
    }
}

/// Adds provenance and static fields to every decoded event.
#[derive(Debug, Clone, Default)]
pub struct Decorator {
    tags: Vec<String>,
    add_field: BTreeMap<String, String>,
}

impl Decorator {
    pub fn new(tags: Vec<String>, add_field: BTreeMap<String, String>) -> Self {
        Self { tags, add_field }
    }

    /// Set `path` to `bucket/key`, stamp `@timestamp` when the codec did
    /// not, then apply configured tags and fields. Existing fields win over
    /// configured ones.
    pub fn decorate(&self, event: &mut Event, object: &ObjectRef, now: DateTime<Utc>) {
        if !event.contains(TIMESTAMP_FIELD) {
            event.set(
                TIMESTAMP_FIELD,
                now.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }
        event.set(PATH_FIELD, object.path());

        for tag in &self.tags {
            event.add_tag(tag);
        }
        for (key, value) in &self.add_field {
            if !event.contains(key) {
                event.set(key.clone(), value.clone());
            }
        }
    }
}
