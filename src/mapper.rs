use std::collections::HashMap;

use serde_json::{Map, Value};
use tracing::error;

use crate::action::{Action, OpType};
use crate::error::{SinkError, SinkResult};
use crate::event::{Event, EventKind};

/// Translates one normalised source [`Event`] into zero or more target-store
/// [`Action`]s (§6). The default implementation always produces exactly one.
pub trait Mapper: Send + Sync {
    fn map(&self, event: &Event) -> SinkResult<Vec<Action>>;
}

/// The built-in mapper: resolves the target collection via
/// `collectionMapping`, falling back to `default_collection` when the source
/// collection has no entry (a `collection`-only config routes every event
/// there), determines the operation from the event kind, and parses the
/// event body as the replacement document.
pub struct DefaultMapper {
    collection_mapping: HashMap<String, String>,
    default_collection: Option<String>,
}

impl DefaultMapper {
    pub fn new(collection_mapping: HashMap<String, String>, default_collection: Option<String>) -> Self {
        Self {
            collection_mapping,
            default_collection,
        }
    }

    fn resolve_target_collection(&self, event: &Event) -> SinkResult<String> {
        if let Some(target) = self.collection_mapping.get(&event.source_collection) {
            return Ok(target.clone());
        }
        if let Some(default) = &self.default_collection {
            return Ok(default.clone());
        }
        Err(SinkError::MissingCollectionMapping {
            source_collection: event.source_collection.clone(),
        })
    }
}

impl Mapper for DefaultMapper {
    fn map(&self, event: &Event) -> SinkResult<Vec<Action>> {
        let target_collection = self.resolve_target_collection(event)?;
        let op_type = determine_operation(event.kind);
        let id = event.key_str();

        let mut document = match parse_event_value(event) {
            Ok(value) => value,
            Err(err) => {
                error!(
                    key = %id,
                    collection = %event.source_collection,
                    error = %err,
                    "failed to parse document body"
                );
                Map::new()
            }
        };
        document.insert("_id".to_string(), Value::String(id.clone()));

        if op_type == OpType::Delete {
            document = Map::new();
            document.insert("_id".to_string(), Value::String(id.clone()));
        }

        let action = Action::new(op_type, document)
            .with_id(id)
            .with_target_collection(target_collection);

        Ok(vec![action])
    }
}

/// Determines the write operation from the event kind, mirroring the
/// original mapper's `IsDeleted || IsExpired` / `IsMutated` branching —
/// here folded into the three `EventKind` variants the Event Adapter
/// already normalises upstream events into.
fn determine_operation(kind: EventKind) -> OpType {
    match kind {
        EventKind::Delete | EventKind::Expire => OpType::Delete,
        EventKind::Mutate => OpType::Upsert,
    }
}

/// Parses the raw event body as a JSON object. A `Delete`/`Expire` event
/// carries no value and parses to an empty document.
fn parse_event_value(event: &Event) -> SinkResult<Map<String, Value>> {
    let raw = match &event.value {
        Some(raw) => raw,
        None => return Ok(Map::new()),
    };

    if raw.is_empty() {
        return Ok(Map::new());
    }

    let value: Value = serde_json::from_slice(raw).map_err(|source| SinkError::Admission {
        id: event.key_str(),
        source,
    })?;

    match value {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceCoordinates;
    use chrono::Utc;

    fn coords() -> SourceCoordinates {
        SourceCoordinates {
            vbucket_id: 1,
            cas: 1,
            sequence: 1,
        }
    }

    fn mapping() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("orders".to_string(), "orders_target".to_string());
        m
    }

    #[test]
    fn mutate_event_upserts_with_parsed_document() {
        let mapper = DefaultMapper::new(mapping(), None);
        let event = Event::new_mutate(
            b"order-1".to_vec(),
            br#"{"status":"paid","total":42}"#.to_vec(),
            "orders",
            Utc::now(),
            coords(),
        );

        let actions = mapper.map(&event).expect("mapping should succeed");
        assert_eq!(actions.len(), 1);
        let action = &actions[0];
        assert_eq!(action.op_type, OpType::Upsert);
        assert_eq!(action.target_collection, "orders_target");
        assert_eq!(action.id, "order-1");
        assert_eq!(
            action.document.get("status").and_then(|v| v.as_str()),
            Some("paid")
        );
        assert_eq!(action.document.get("_id").and_then(|v| v.as_str()), Some("order-1"));
    }

    #[test]
    fn delete_event_produces_id_only_document() {
        let mapper = DefaultMapper::new(mapping(), None);
        let event = Event::new_delete(b"order-2".to_vec(), "orders", Utc::now(), coords());

        let actions = mapper.map(&event).expect("mapping should succeed");
        let action = &actions[0];
        assert_eq!(action.op_type, OpType::Delete);
        assert_eq!(action.document.len(), 1);
        assert_eq!(action.document.get("_id").and_then(|v| v.as_str()), Some("order-2"));
    }

    #[test]
    fn expire_event_is_treated_as_delete() {
        let mapper = DefaultMapper::new(mapping(), None);
        let event = Event::new_expire(b"order-3".to_vec(), "orders", Utc::now(), coords());

        let actions = mapper.map(&event).expect("mapping should succeed");
        assert_eq!(actions[0].op_type, OpType::Delete);
    }

    #[test]
    fn unmapped_source_collection_is_an_error() {
        let mapper = DefaultMapper::new(mapping(), None);
        let event = Event::new_mutate(b"k".to_vec(), b"{}".to_vec(), "unknown", Utc::now(), coords());

        let err = mapper.map(&event).unwrap_err();
        assert!(matches!(err, SinkError::MissingCollectionMapping { .. }));
    }

    #[test]
    fn malformed_json_body_falls_back_to_id_only_document_instead_of_failing_admission() {
        let mapper = DefaultMapper::new(mapping(), None);
        let event = Event::new_mutate(b"order-4".to_vec(), b"{not json".to_vec(), "orders", Utc::now(), coords());

        let actions = mapper.map(&event).expect("mapping should still succeed");
        assert_eq!(actions[0].document.get("_id").and_then(|v| v.as_str()), Some("order-4"));
    }

    #[test]
    fn unmapped_collection_routes_to_default_collection_when_configured() {
        let mapper = DefaultMapper::new(HashMap::new(), Some("everything".to_string()));
        let event = Event::new_mutate(b"k".to_vec(), b"{}".to_vec(), "whatever", Utc::now(), coords());

        let actions = mapper.map(&event).expect("mapping should succeed via default collection");
        assert_eq!(actions[0].target_collection, "everything");
    }
}
