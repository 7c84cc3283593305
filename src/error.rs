use thiserror::Error;

/// Errors surfaced by the batch buffer, dispatcher, and connector.
///
/// Recoverable errors ([`SinkError::Admission`] and [`SinkError::SoftWrite`])
/// are logged and absorbed at the point they occur; everything else
/// propagates to the Flush Controller and is treated as fatal (§7 of the
/// spec).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to serialize action for document {id}: {source}")]
    Admission {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("duplicate key error on collection {collection} (code {code})")]
    SoftWrite { collection: String, code: i32 },

    #[error("bulk write to collection {collection} failed: {source}")]
    HardWrite {
        collection: String,
        #[source]
        source: mongodb::error::Error,
    },

    #[error("bulk write to collection {collection} timed out")]
    Timeout { collection: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no collectionMapping entry for source collection '{source_collection}'")]
    MissingCollectionMapping { source_collection: String },

    #[error("upstream source error: {0}")]
    Source(#[from] async_nats::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;
