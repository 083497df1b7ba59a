//! Typed split between document metadata and business payload.
//!
//! On disk a participating document carries its version vector under the
//! reserved top-level key [`VERSION_VECTOR_KEY`]. In memory the vector lives
//! in [`DocumentEnvelope::metadata`] and never appears in the payload.

use serde_json::{Map, Value};

use crate::vector::VersionVector;

/// Reserved top-level field holding the document's version vector.
pub const VERSION_VECTOR_KEY: &str = "_version_vector";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentEnvelope {
    pub metadata: VersionVector,
    pub payload: Map<String, Value>,
}

impl DocumentEnvelope {
    pub fn new(metadata: VersionVector, payload: Map<String, Value>) -> Self {
        Self { metadata, payload }
    }

    /// Split a stored document. Non-object documents yield an empty payload;
    /// an unreadable vector yields an empty vector.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut payload) = value else {
            return Self::default();
        };
        let metadata = payload
            .remove(VERSION_VECTOR_KEY)
            .and_then(|raw| match serde_json::from_value(raw) {
                Ok(vector) => Some(vector),
                Err(err) => {
                    tracing::debug!(error = %err, "ignoring malformed version vector");
                    None
                }
            })
            .unwrap_or_default();
        Self { metadata, payload }
    }

    /// Storage form with the vector embedded. An empty vector is omitted.
    pub fn into_value(self) -> Value {
        let mut out = self.payload;
        if !self.metadata.is_empty() {
            // A BTreeMap<WriterId, u64> always serializes to a JSON object.
            if let Ok(vector) = serde_json::to_value(&self.metadata) {
                out.insert(VERSION_VECTOR_KEY.to_owned(), vector);
            }
        }
        Value::Object(out)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}
