//! Fields: named, typed values shared between reports and artificial-field functions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The serialized representation of a single field value, living under a message-id in
/// its sub-stream. A JSON scalar or object; `null` represents a missing historical slot.
pub type FieldValue = Value;

/// Where a field's declaration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    /// Declared by an input report's schema.
    Source,
    /// Computed by an artificial-field function.
    Derived,
}

/// A named, typed field known to the compiled model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// The broker stream this field's per-message values live under.
    pub stream_name: String,
    /// JSON Schema-ish type tag surfaced to `/pybrook-schema.json`, e.g. "number",
    /// "string", "boolean", "object". Informational only; not enforced at runtime.
    pub json_type: String,
    /// Source field (input schema) or derived field (artificial-field function). Set by
    /// the constructor used, never by the caller directly.
    pub origin: FieldOrigin,
}

impl FieldDef {
    /// A field declared by an input report's schema.
    pub fn new(name: impl Into<String>, report: &str, json_type: impl Into<String>) -> Self {
        Self::with_origin(name, report, json_type, FieldOrigin::Source)
    }

    /// A field computed by an artificial-field function.
    pub fn derived(name: impl Into<String>, namespace: &str, json_type: impl Into<String>) -> Self {
        Self::with_origin(name, namespace, json_type, FieldOrigin::Derived)
    }

    fn with_origin(name: impl Into<String>, report: &str, json_type: impl Into<String>, origin: FieldOrigin) -> Self {
        let name = name.into();
        let stream_name = format!("{report}:{name}");
        Self {
            name,
            stream_name,
            json_type: json_type.into(),
            origin,
        }
    }
}
