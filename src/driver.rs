use std::time::Duration;

use mongodb::bson::{self, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{
    BulkWriteOptions, ClientOptions, Credential, DeleteOneModel, ReplaceOneModel, WriteModel,
};
use mongodb::{Client, Namespace};
use tracing::debug;

use crate::config::MongoDbConfig;
use crate::error::{SinkError, SinkResult};

/// A single write operation targeted at one collection, built by the
/// dispatcher from an [`Action`](crate::action::Action).
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// `Insert`/`Update`/`Upsert` all become a replace-one with
    /// `upsert=true`, per §4.E.
    ReplaceUpsert { filter: Document, replacement: Document },
    DeleteOne { filter: Document },
}

/// Outcome counters the dispatcher folds into the Metrics Sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct BulkOutcome {
    pub update_success: i64,
    pub delete_success: i64,
}

const BULK_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin adapter over the MongoDB driver: connection lifecycle plus a single
/// `bulk_write(collection, ops)` entry point (§4.H). The dispatcher never
/// touches the driver client directly.
pub struct MongoDriver {
    client: Client,
    database_name: String,
}

impl MongoDriver {
    pub async fn connect(cfg: &MongoDbConfig) -> SinkResult<Self> {
        let mut options = ClientOptions::parse(&cfg.connection.uri)
            .await
            .map_err(|source| SinkError::HardWrite {
                collection: "<connect>".to_string(),
                source,
            })?;

        if let (Some(username), Some(password)) = (&cfg.connection.username, &cfg.connection.password) {
            options.credential = Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .source(cfg.connection.database.clone())
                    .build(),
            );
        }

        options.max_pool_size = Some(cfg.connection_pool.max_pool_size());
        options.min_pool_size = Some(cfg.connection_pool.min_pool_size());
        options.max_idle_time = Some(Duration::from_millis(cfg.connection_pool.max_idle_time_ms()));
        options.connect_timeout = Some(Duration::from_millis(cfg.timeouts.connect_timeout_ms()));
        options.server_selection_timeout =
            Some(Duration::from_millis(cfg.timeouts.server_selection_timeout_ms()));
        options.socket_timeout = Some(Duration::from_millis(cfg.timeouts.socket_timeout_ms()));

        let client = Client::with_options(options).map_err(|source| SinkError::HardWrite {
            collection: "<connect>".to_string(),
            source,
        })?;

        Ok(Self {
            client,
            database_name: cfg.connection.database.clone(),
        })
    }

    /// Issues one unordered bulk write against `collection` (§4.E, step 4).
    /// A single bad document does not abort the remainder of the batch.
    pub async fn bulk_write(&self, collection: &str, ops: Vec<WriteOp>) -> SinkResult<BulkOutcome> {
        if ops.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let namespace = Namespace::new(self.database_name.clone(), collection.to_string());
        let models: Vec<WriteModel> = ops
            .into_iter()
            .map(|op| to_write_model(namespace.clone(), op))
            .collect();

        debug!(collection, count = models.len(), "issuing bulk write");

        let options = BulkWriteOptions::builder()
            .ordered(false)
            .build();

        let result = tokio::time::timeout(
            BULK_WRITE_TIMEOUT,
            self.client.bulk_write(models).with_options(options),
        )
        .await
        .map_err(|_| SinkError::Timeout {
            collection: collection.to_string(),
        })?;

        match result {
            Ok(outcome) => Ok(BulkOutcome {
                update_success: outcome.modified_count + outcome.upserted_count,
                delete_success: outcome.deleted_count,
            }),
            Err(err) => classify_bulk_error(collection, err),
        }
    }
}

/// Classifies a bulk write failure per §7: a pure duplicate-key (code 11000)
/// envelope is a soft error — logged elsewhere, never returned as fatal, and
/// the writes that did succeed in the same bulk result are still counted
/// (§9, Open Question 1). Anything else is hard and propagates.
fn classify_bulk_error(collection: &str, err: mongodb::error::Error) -> SinkResult<BulkOutcome> {
    if let ErrorKind::BulkWrite(ref failure) = *err.kind {
        let all_duplicate_key = !failure.write_errors.is_empty()
            && failure.write_errors.values().all(|we| we.code == 11000);

        if all_duplicate_key {
            let outcome = failure
                .partial_result
                .as_ref()
                .map(|partial| BulkOutcome {
                    update_success: partial.modified_count + partial.upserted_count,
                    delete_success: partial.deleted_count,
                })
                .unwrap_or_default();
            return Ok(outcome);
        }
    }

    Err(SinkError::HardWrite {
        collection: collection.to_string(),
        source: err,
    })
}

fn to_write_model(namespace: Namespace, op: WriteOp) -> WriteModel {
    match op {
        WriteOp::ReplaceUpsert { filter, replacement } => WriteModel::ReplaceOne(
            ReplaceOneModel::builder()
                .namespace(namespace)
                .filter(filter)
                .replacement(replacement)
                .upsert(true)
                .build(),
        ),
        WriteOp::DeleteOne { filter } => WriteModel::DeleteOne(
            DeleteOneModel::builder()
                .namespace(namespace)
                .filter(filter)
                .build(),
        ),
    }
}

/// Builds the write filter for a document (§4.E): `_id` plus one equality
/// clause per configured shard-key path.
pub fn build_filter(document: &Document, shard_keys: &[String]) -> Document {
    let mut filter = bson::doc! { "_id": document.get("_id").cloned().unwrap_or(bson::Bson::Null) };

    for shard_key in shard_keys {
        if let Some(value) = get_nested_value(document, shard_key) {
            filter.insert(shard_key.clone(), value);
        }
    }

    filter
}

/// Walks `document` as a tree of string-keyed maps along `path`'s dotted
/// segments. The first non-document value encountered terminates the walk
/// and is returned; a missing segment yields `None`.
pub fn get_nested_value(document: &Document, path: &str) -> Option<bson::Bson> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current: bson::Bson = document.get(first)?.clone();

    for part in parts {
        match current.as_document() {
            Some(nested) => current = nested.get(part)?.clone(),
            None => return Some(current),
        }
    }

    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn build_filter_includes_configured_shard_keys() {
        let document = doc! {
            "_id": "t1",
            "customer": { "id": "c1" },
        };

        let filter = build_filter(&document, &["customer.id".to_string()]);

        assert_eq!(filter, doc! { "_id": "t1", "customer.id": "c1" });
    }

    #[test]
    fn build_filter_omits_missing_shard_key() {
        let document = doc! { "_id": "t1" };
        let filter = build_filter(&document, &["customer.id".to_string()]);
        assert_eq!(filter, doc! { "_id": "t1" });
    }

    #[test]
    fn get_nested_value_stops_at_first_non_document() {
        let document = doc! {
            "customer": { "id": "c1", "profile": { "name": "a" } },
        };

        assert_eq!(
            get_nested_value(&document, "customer.id"),
            Some(bson::Bson::String("c1".to_string()))
        );
        assert_eq!(
            get_nested_value(&document, "customer.profile.name"),
            Some(bson::Bson::String("a".to_string()))
        );
        assert_eq!(get_nested_value(&document, "nonexistent.path"), None);
    }
}
