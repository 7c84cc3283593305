use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::action::Action;
use crate::error::SinkError;

/// A single buffered write, plus its serialized form (used only to measure
/// size; the write itself uses the structured document).
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub action: Action,
    pub size: usize,
}

fn dedup_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

struct BufferState {
    items: Vec<BatchItem>,
    index: HashMap<String, usize>,
    byte_size: usize,
    mono_index: u64,
    rebalancing: bool,
}

impl BufferState {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            byte_size: 0,
            mono_index: 0,
            rebalancing: false,
        }
    }

    fn item_count(&self) -> usize {
        self.items.len()
    }

    /// Admits a single action, applying the dedup rule of §4.C. Returns the
    /// serialization error, if any, without touching buffer state.
    fn admit_one(&mut self, mut action: Action) -> Result<(), SinkError> {
        let bytes = serde_json::to_vec(&action).map_err(|source| SinkError::Admission {
            id: action.id.clone(),
            source,
        })?;
        let size = bytes.len();

        let key = if !action.id.is_empty() {
            dedup_key(&action.target_collection, &action.id)
        } else if let Some(id_value) = action.document.get("_id") {
            let id = crate::action::stringify_id(id_value);
            action.id = id.clone();
            dedup_key(&action.target_collection, &id)
        } else {
            let key = format!("__placeholder__:{}", self.mono_index);
            self.mono_index += 1;
            self.items.push(BatchItem { action, size });
            self.index.insert(key, self.items.len() - 1);
            self.byte_size += size;
            return Ok(());
        };

        if let Some(&pos) = self.index.get(&key) {
            let old_size = self.items[pos].size;
            self.items[pos] = BatchItem { action, size };
            self.byte_size = self.byte_size + size - old_size;
        } else {
            self.items.push(BatchItem { action, size });
            self.index.insert(key, self.items.len() - 1);
            self.byte_size += size;
        }

        Ok(())
    }

    fn drain(&mut self) -> Vec<BatchItem> {
        self.index.clear();
        self.mono_index = 0;
        self.byte_size = 0;
        std::mem::take(&mut self.items)
    }
}

/// A handle the upstream stream client attaches to a delivered event, used
/// to acknowledge it exactly once after its actions are admitted.
#[async_trait::async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self);
}

/// The Batch Buffer (§4.C): holds pending actions, deduplicates by
/// (targetCollection, id), and tracks aggregate item count / byte size.
///
/// All mutation happens under a single internal lock, which doubles as the
/// "buffer lock" the rest of the spec refers to (§5): admission, rebalance
/// flag writes, and draining for a flush are all serialised through it.
pub struct BatchBuffer {
    state: Mutex<BufferState>,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BufferState::new()),
        }
    }

    /// Admits all actions produced from one source event, then acknowledges
    /// the event exactly once (Invariant 5). Returns `true` if a
    /// threshold-triggering flush should be initiated by the caller.
    pub async fn admit(
        &self,
        actions: Vec<Action>,
        ack: &(dyn AckHandle),
        size_limit: usize,
        byte_size_limit: usize,
    ) -> bool {
        let mut state = self.state.lock().await;

        if state.rebalancing {
            warn!("refusing admission: rebalance in progress");
            return false;
        }

        for action in actions {
            let id = action.id.clone();
            if let Err(err) = state.admit_one(action) {
                error!(id = %id, error = %err, "dropping action that failed to serialize");
            }
        }

        ack.ack().await;

        state.item_count() >= size_limit || state.byte_size >= byte_size_limit
    }

    /// Drains the buffer and runs `f` over the drained items while still
    /// holding the buffer lock, so that nothing can admit a new action (and
    /// ack its source event) between the drain and `f`'s completion — the
    /// dispatch and checkpoint commit that follow a flush must happen before
    /// the upstream replay position can move past the drained actions (§4.F).
    /// Returns `None` without calling `f` if the buffer is rebalancing
    /// (flushes are no-ops while rebalancing).
    pub async fn drain_and<F, Fut, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(Vec<BatchItem>) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut state = self.state.lock().await;
        if state.rebalancing {
            return None;
        }
        let items = state.drain();
        Some(f(items).await)
    }

    pub async fn set_rebalancing(&self, rebalancing: bool) {
        let mut state = self.state.lock().await;
        state.rebalancing = rebalancing;
    }

    pub async fn is_rebalancing(&self) -> bool {
        self.state.lock().await.rebalancing
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.state.lock().await.item_count()
    }

    #[cfg(test)]
    pub async fn byte_size(&self) -> usize {
        self.state.lock().await.byte_size
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::OpType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl AckHandle for CountingAck {
        async fn ack(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn upsert(id: &str, v: i64) -> Action {
        let doc = json!({"_id": id, "v": v}).as_object().unwrap().clone();
        Action::new(OpType::Upsert, doc).with_target_collection("orders")
    }

    #[tokio::test]
    async fn dedup_within_batch_keeps_last_write() {
        let buffer = BatchBuffer::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let ack = CountingAck(acked.clone());

        buffer
            .admit(
                vec![upsert("a", 1), upsert("a", 2), upsert("b", 1)],
                &ack,
                1_000_000,
                usize::MAX,
            )
            .await;

        assert_eq!(buffer.len().await, 2);
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        let items = buffer.drain_and(|items| async move { items }).await.unwrap();
        let a_item = items.iter().find(|i| i.action.id == "a").expect("a present");
        assert_eq!(a_item.action.document.get("v").unwrap(), &json!(2));
    }

    #[tokio::test]
    async fn size_threshold_triggers_on_third_admit() {
        let buffer = BatchBuffer::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let ack = CountingAck(acked.clone());

        let should_flush = buffer
            .admit(
                vec![upsert("a", 1), upsert("b", 1), upsert("c", 1)],
                &ack,
                3,
                usize::MAX,
            )
            .await;

        assert!(should_flush);
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn byte_counters_stay_consistent() {
        let buffer = BatchBuffer::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let ack = CountingAck(acked);

        buffer
            .admit(vec![upsert("a", 1)], &ack, 1_000, usize::MAX)
            .await;
        buffer
            .admit(vec![upsert("a", 2)], &ack, 1_000, usize::MAX)
            .await;

        assert_eq!(buffer.len().await, 1);
        let items = buffer.drain_and(|items| async move { items }).await.unwrap();
        let recorded_size: usize = items.iter().map(|i| i.size).sum();
        assert_eq!(recorded_size, items[0].size);
    }

    #[tokio::test]
    async fn rebalance_refuses_admission_without_ack() {
        let buffer = BatchBuffer::new();
        buffer.set_rebalancing(true).await;

        let acked = Arc::new(AtomicUsize::new(0));
        let ack = CountingAck(acked.clone());

        let should_flush = buffer
            .admit(vec![upsert("a", 1)], &ack, 10, usize::MAX)
            .await;

        assert!(!should_flush);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.len().await, 0);

        buffer.set_rebalancing(false).await;
        buffer
            .admit(vec![upsert("a", 1)], &ack, 10, usize::MAX)
            .await;
        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test]
    async fn placeholder_keys_are_never_deduplicated() {
        let buffer = BatchBuffer::new();
        let acked = Arc::new(AtomicUsize::new(0));
        let ack = CountingAck(acked);

        let mut doc_a = serde_json::Map::new();
        doc_a.insert("name".into(), json!("a"));
        let mut doc_b = serde_json::Map::new();
        doc_b.insert("name".into(), json!("b"));

        buffer
            .admit(
                vec![
                    Action::new(OpType::Insert, doc_a).with_target_collection("logs"),
                    Action::new(OpType::Insert, doc_b).with_target_collection("logs"),
                ],
                &ack,
                1_000,
                usize::MAX,
            )
            .await;

        assert_eq!(buffer.len().await, 2);
    }

    #[tokio::test]
    async fn admission_blocks_until_drain_and_releases_the_buffer_lock() {
        let buffer = Arc::new(BatchBuffer::new());
        buffer
            .admit(vec![upsert("a", 1)], &CountingAck(Arc::new(AtomicUsize::new(0))), 1_000, usize::MAX)
            .await;

        let order = Arc::new(Mutex::new(Vec::new()));

        let flush_buffer = buffer.clone();
        let flush_order = order.clone();
        let flush = tokio::spawn(async move {
            flush_buffer
                .drain_and(|items| async move {
                    flush_order.lock().await.push("drain_start");
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    flush_order.lock().await.push("drain_end");
                    items
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let admit_order = order.clone();
        let admit_buffer = buffer.clone();
        let admit = tokio::spawn(async move {
            admit_order.lock().await.push("admit_start");
            admit_buffer
                .admit(vec![upsert("b", 1)], &CountingAck(Arc::new(AtomicUsize::new(0))), 1_000, usize::MAX)
                .await;
            admit_order.lock().await.push("admit_end");
        });

        flush.await.unwrap();
        admit.await.unwrap();

        let recorded = order.lock().await.clone();
        let admit_end = recorded.iter().position(|e| *e == "admit_end").unwrap();
        let drain_end = recorded.iter().position(|e| *e == "drain_end").unwrap();
        assert!(drain_end < admit_end, "admission must wait for the in-flight flush to release the buffer lock");
    }
}
