use serde::Serialize;
use serde_json::{Map, Value};

/// The write intention a document should be translated into. `Insert`,
/// `Update`, and `Upsert` all become a replace-one with `upsert=true` in
/// the dispatcher; only `Delete` becomes a delete-one (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Insert,
    Update,
    Upsert,
    Delete,
}

/// A single target-store write intention produced by the mapper from one
/// source event.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub op_type: OpType,
    /// Must contain `_id` (enforced by the mapper, not the buffer).
    pub document: Map<String, Value>,
    /// Duplicate of `document["_id"]` for fast keying; empty string means
    /// "derive from document, or fall back to a placeholder".
    #[serde(skip)]
    pub id: String,
    /// Resolved by the mapper, or left empty for the dispatcher to resolve
    /// via `collectionMapping`.
    #[serde(skip)]
    pub target_collection: String,
}

impl Action {
    pub fn new(op_type: OpType, document: Map<String, Value>) -> Self {
        let id = document
            .get("_id")
            .map(|v| stringify_id(v))
            .unwrap_or_default();
        Self {
            op_type,
            document,
            id,
            target_collection: String::new(),
        }
    }

    pub fn with_target_collection(mut self, target_collection: impl Into<String>) -> Self {
        self.target_collection = target_collection.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

pub fn stringify_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
