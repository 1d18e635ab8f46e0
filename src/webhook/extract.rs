//! Layered field extraction from event payloads.
//!
//! The same identifier lives at different paths depending on the provider's
//! API version and expand settings. Each lookup runs an ordered chain:
//! the typed field, then the raw delivered JSON, then the event's canonical
//! re-serialization. The first layer that yields a value wins.

use serde_json::Value;
use std::cell::OnceCell;

use super::event::WebhookEvent;

/// A JSON path from the event root, e.g. `&["data", "object", "id"]`.
/// Numeric segments index arrays.
pub type JsonPath<'p> = &'p [&'p str];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Typed,
    RawPayload,
    CanonicalEvent,
}

/// Sources for one delivery; JSON documents are parsed on first use.
pub struct Payload<'a> {
    event: &'a WebhookEvent,
    raw: &'a [u8],
    raw_json: OnceCell<Option<Value>>,
    canonical: OnceCell<Option<Value>>,
}

impl<'a> Payload<'a> {
    pub fn new(event: &'a WebhookEvent, raw: &'a [u8]) -> Self {
        Self {
            event,
            raw,
            raw_json: OnceCell::new(),
            canonical: OnceCell::new(),
        }
    }

    pub fn event(&self) -> &WebhookEvent {
        self.event
    }

    fn raw_json(&self) -> Option<&Value> {
        self.raw_json
            .get_or_init(|| serde_json::from_slice(self.raw).ok())
            .as_ref()
    }

    fn canonical(&self) -> Option<&Value> {
        self.canonical
            .get_or_init(|| serde_json::to_value(self.event).ok())
            .as_ref()
    }

    /// Identifier at the first matching path; values may be a bare string or
    /// an expanded object carrying `id`.
    pub fn id(&self, field: &str, typed: Option<String>, paths: &[JsonPath<'_>]) -> Option<String> {
        self.extract(field, typed, |doc| first_match(doc, paths, as_id))
    }

    /// Integer at the first matching path.
    pub fn int(&self, field: &str, typed: Option<i64>, paths: &[JsonPath<'_>]) -> Option<i64> {
        self.extract(field, typed, |doc| first_match(doc, paths, Value::as_i64))
    }

    /// String at the first matching path.
    pub fn text(&self, field: &str, typed: Option<String>, paths: &[JsonPath<'_>]) -> Option<String> {
        self.extract(field, typed, |doc| {
            first_match(doc, paths, |v| v.as_str().map(str::to_string))
        })
    }

    fn extract<T: Clone>(
        &self,
        field: &str,
        typed: Option<T>,
        from_doc: impl Fn(&Value) -> Option<T>,
    ) -> Option<T> {
        let layers: [(Layer, &dyn Fn() -> Option<T>); 3] = [
            (Layer::Typed, &|| typed.clone()),
            (Layer::RawPayload, &|| self.raw_json().and_then(&from_doc)),
            (Layer::CanonicalEvent, &|| self.canonical().and_then(&from_doc)),
        ];

        for (layer, lookup) in layers {
            if let Some(value) = lookup() {
                if layer != Layer::Typed {
                    tracing::trace!(event_id = %self.event.id, field, ?layer, "Field resolved by fallback");
                }
                return Some(value);
            }
        }
        tracing::debug!(event_id = %self.event.id, field, "Field absent from every payload layer");
        None
    }
}

fn first_match<T>(doc: &Value, paths: &[JsonPath<'_>], convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
    paths
        .iter()
        .find_map(|path| lookup(doc, path).and_then(&convert))
}

/// Walk `path` from `doc`.
pub fn lookup<'v>(doc: &'v Value, path: JsonPath<'_>) -> Option<&'v Value> {
    path.iter().try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// A bare non-empty string id, or the `id` of an expanded object.
pub fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(map) => map.get("id").and_then(as_id),
        _ => None,
    }
}
