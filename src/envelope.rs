//! The bus envelope: a JSON-object-backed value carrying one platform
//! message between an adapter and the core.
//!
//! The envelope is intentionally opaque beyond the handful of fields the
//! runtime reads to route and log messages. All other keys a caller puts
//! on the envelope are preserved verbatim across serialization, matching,
//! and dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single message envelope.
///
/// Wraps a JSON object. Construction from a non-object value fails, since
/// every recognized field (`message_info`, `message_segment`, ...) assumes
/// object-shaped top-level access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Envelope(Value);

impl Envelope {
    /// Build an envelope from an already-validated JSON object.
    pub fn new(object: Map<String, Value>) -> Self {
        Self(Value::Object(object))
    }

    /// Parse an envelope out of an arbitrary JSON value, failing if it is
    /// not an object.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        if value.is_object() {
            Ok(Self(value))
        } else {
            Err(EnvelopeError::NotAnObject)
        }
    }

    /// Borrow the underlying JSON object.
    pub fn as_object(&self) -> &Map<String, Value> {
        self.0.as_object().expect("Envelope invariant: always an object")
    }

    /// Mutably borrow the underlying JSON object.
    pub fn as_object_mut(&mut self) -> &mut Map<String, Value> {
        self.0.as_object_mut().expect("Envelope invariant: always an object")
    }

    /// Consume the envelope, returning the backing JSON value.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// The opaque `id` field, used only for error messages and logging.
    pub fn id(&self) -> Option<&str> {
        self.as_object().get("id").and_then(Value::as_str)
    }

    /// The originating/target platform tag.
    ///
    /// Checks `message_info.platform` first, then falls back to the legacy
    /// top-level `platform` field, matching the original bus's tolerance of
    /// either location.
    pub fn platform(&self) -> Option<&str> {
        self.message_info_platform()
            .or_else(|| self.as_object().get("platform").and_then(Value::as_str))
    }

    fn message_info_platform(&self) -> Option<&str> {
        self.as_object()
            .get("message_info")?
            .as_object()?
            .get("platform")?
            .as_str()
    }

    /// The event-type tag: first defined of the top-level `event_type` and
    /// `message_info.additional_config.event_type`.
    pub fn event_type(&self) -> Option<&str> {
        self.as_object()
            .get("event_type")
            .and_then(Value::as_str)
            .or_else(|| self.additional_config_event_type())
    }

    fn additional_config_event_type(&self) -> Option<&str> {
        self.as_object()
            .get("message_info")?
            .as_object()?
            .get("additional_config")?
            .as_object()?
            .get("event_type")?
            .as_str()
    }

    /// Extract the segment type: `message_segment` if present, otherwise
    /// the first element of `message_chain`.
    pub fn segment_type(&self) -> Option<&str> {
        let obj = self.as_object();
        if let Some(segment) = obj.get("message_segment") {
            return segment.as_object()?.get("type")?.as_str();
        }
        if let Some(chain) = obj.get("message_chain") {
            let first = chain.as_array()?.first()?;
            return first.as_object()?.get("type")?.as_str();
        }
        None
    }
}

impl TryFrom<Value> for Envelope {
    type Error = EnvelopeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Envelope::from_value(value)
    }
}

impl From<Envelope> for Value {
    fn from(envelope: Envelope) -> Self {
        envelope.0
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope must be a JSON object")]
    NotAnObject,
}
