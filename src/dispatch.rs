use std::collections::HashMap;
use std::sync::Arc;

use mongodb::bson::{self, Document};
use tokio::task::JoinSet;
use tracing::error;

use crate::action::OpType;
use crate::buffer::BatchItem;
use crate::driver::{build_filter, MongoDriver, WriteOp};
use crate::error::SinkResult;
use crate::metrics::MetricsSink;

/// Partitions a batch into up to `concurrency` contiguous, order-preserving
/// chunks (§4.E step 1). Empty chunks are dropped.
pub fn partition(items: Vec<BatchItem>, concurrency: usize) -> Vec<Vec<BatchItem>> {
    if items.is_empty() || concurrency == 0 {
        return Vec::new();
    }

    let total = items.len();
    let chunk_size = total.div_ceil(concurrency).max(1);

    items
        .into_iter()
        .enumerate()
        .fold(Vec::new(), |mut chunks: Vec<Vec<BatchItem>>, (i, item)| {
            if i % chunk_size == 0 {
                chunks.push(Vec::new());
            }
            chunks.last_mut().unwrap().push(item);
            chunks
        })
        .into_iter()
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

/// The Bulk Dispatcher (§4.E): fans a drained batch out across up to N
/// parallel tasks, each grouping its chunk per target collection and
/// issuing one unordered bulk write per collection.
pub struct BulkDispatcher {
    driver: Arc<MongoDriver>,
    metrics: Arc<dyn MetricsSink>,
    shard_keys: Vec<String>,
    concurrency: usize,
}

impl BulkDispatcher {
    pub fn new(
        driver: Arc<MongoDriver>,
        metrics: Arc<dyn MetricsSink>,
        shard_keys: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            driver,
            metrics,
            shard_keys,
            concurrency,
        }
    }

    /// Dispatches one flush's worth of items. The first hard error aborts
    /// waiting on the remaining chunks and is surfaced to the caller
    /// (§4.E step 2); soft duplicate-key errors never reach this point as
    /// an `Err` (see [`MongoDriver::bulk_write`]).
    pub async fn dispatch(&self, items: Vec<BatchItem>) -> SinkResult<()> {
        let chunks = partition(items, self.concurrency);

        let mut tasks = JoinSet::new();
        for chunk in chunks {
            let driver = self.driver.clone();
            let metrics = self.metrics.clone();
            let shard_keys = self.shard_keys.clone();
            tasks.spawn(async move { process_chunk(driver, metrics, shard_keys, chunk).await });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.expect("dispatcher task panicked");
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

async fn process_chunk(
    driver: Arc<MongoDriver>,
    metrics: Arc<dyn MetricsSink>,
    shard_keys: Vec<String>,
    chunk: Vec<BatchItem>,
) -> SinkResult<()> {
    let mut by_collection: HashMap<String, Vec<WriteOp>> = HashMap::new();

    for item in chunk {
        let collection = item.action.target_collection.clone();
        let document: Document = bson::to_document(&item.action.document)
            .unwrap_or_else(|_| Document::new());

        let op = match item.action.op_type {
            OpType::Insert | OpType::Update | OpType::Upsert => WriteOp::ReplaceUpsert {
                filter: build_filter(&document, &shard_keys),
                replacement: document,
            },
            OpType::Delete => WriteOp::DeleteOne {
                filter: build_filter(&document, &shard_keys),
            },
        };

        by_collection.entry(collection).or_default().push(op);
    }

    for (collection, ops) in by_collection {
        let update_writes = ops
            .iter()
            .filter(|op| matches!(op, WriteOp::ReplaceUpsert { .. }))
            .count();
        let delete_writes = ops
            .iter()
            .filter(|op| matches!(op, WriteOp::DeleteOne { .. }))
            .count();

        match driver.bulk_write(&collection, ops).await {
            Ok(outcome) => {
                metrics.record_update_success(&collection, outcome.update_success);
                metrics.record_delete_success(&collection, outcome.delete_success);
            }
            Err(err) => {
                error!(collection = %collection, error = %err, "bulk write failed");
                metrics.record_update_error(&collection, update_writes as i64);
                metrics.record_delete_error(&collection, delete_writes as i64);
                return Err(err);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use serde_json::json;

    fn item(id: &str, collection: &str) -> BatchItem {
        let doc = json!({"_id": id}).as_object().unwrap().clone();
        let action = Action::new(OpType::Upsert, doc).with_target_collection(collection);
        BatchItem { action, size: 1 }
    }

    #[test]
    fn partition_is_order_preserving_and_drops_empty_chunks() {
        let items = vec![item("a", "c"), item("b", "c"), item("c", "c")];
        let chunks = partition(items, 5);

        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert_eq!(chunk.len(), 1);
        }
    }

    #[test]
    fn partition_handles_empty_input() {
        assert!(partition(Vec::new(), 4).is_empty());
    }

    #[test]
    fn partition_roughly_balances_chunks() {
        let items: Vec<_> = (0..10).map(|i| item(&i.to_string(), "c")).collect();
        let chunks = partition(items, 3);

        assert!(chunks.len() <= 3);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }
}
