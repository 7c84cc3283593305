use chrono::{DateTime, Utc};

/// The three kinds of mutation the upstream stream protocol can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Mutate,
    Delete,
    Expire,
}

/// Opaque per-event stream coordinates, used only to route the per-event
/// acknowledgement back to the upstream client. The core never interprets
/// these fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCoordinates {
    pub vbucket_id: u16,
    pub cas: u64,
    pub sequence: u64,
}

/// A single normalised mutation event, produced by the Event Adapter from
/// whatever variant the upstream stream client delivered.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub key: Vec<u8>,
    /// Absent for `Delete`/`Expire`.
    pub value: Option<Vec<u8>>,
    pub source_collection: String,
    pub event_time: DateTime<Utc>,
    pub source_coordinates: SourceCoordinates,
}

impl Event {
    pub fn new_mutate(
        key: Vec<u8>,
        value: Vec<u8>,
        source_collection: impl Into<String>,
        event_time: DateTime<Utc>,
        coords: SourceCoordinates,
    ) -> Self {
        Self {
            kind: EventKind::Mutate,
            key,
            value: Some(value),
            source_collection: source_collection.into(),
            event_time,
            source_coordinates: coords,
        }
    }

    pub fn new_delete(
        key: Vec<u8>,
        source_collection: impl Into<String>,
        event_time: DateTime<Utc>,
        coords: SourceCoordinates,
    ) -> Self {
        Self {
            kind: EventKind::Delete,
            key,
            value: None,
            source_collection: source_collection.into(),
            event_time,
            source_coordinates: coords,
        }
    }

    pub fn new_expire(
        key: Vec<u8>,
        source_collection: impl Into<String>,
        event_time: DateTime<Utc>,
        coords: SourceCoordinates,
    ) -> Self {
        Self {
            kind: EventKind::Expire,
            key,
            value: None,
            source_collection: source_collection.into(),
            event_time,
            source_coordinates: coords,
        }
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}
