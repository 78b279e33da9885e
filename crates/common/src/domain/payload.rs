use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical field mapping produced from a raw payload.
///
/// The parser never produces an empty mapping; the constructors used by the
/// parser each insert at least one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParsedPayload(Map<String, Value>);

impl ParsedPayload {
    /// Wrap a structured mapping. Returns `None` for an empty mapping.
    pub fn from_map(fields: Map<String, Value>) -> Option<Self> {
        if fields.is_empty() {
            None
        } else {
            Some(Self(fields))
        }
    }

    /// `{"values": [...]}`
    pub fn values(values: Vec<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert("values".to_string(), Value::Array(values));
        Self(fields)
    }

    /// `{"raw": "..."}`
    pub fn raw(text: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("raw".to_string(), Value::String(text.into()));
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}
