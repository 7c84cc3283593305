use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::buffer::BatchBuffer;
use crate::checkpoint::CheckpointCoordinator;
use crate::dispatch::BulkDispatcher;
use crate::error::SinkResult;
use crate::metrics::MetricsSink;

/// The Flush Controller's state machine (§4.D). Backed by a mix of atomics
/// and the buffer's own rebalancing flag rather than one tracked field,
/// since those are read independently from the ticker loop, `flush_once`,
/// and admission — [`FlushController::state`] reconstructs the nominal
/// state from them for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Idle,
    Flushing,
    RebalancePaused,
    Closed,
}

/// Serialises flushes, fires on size/byte/time thresholds, and coordinates
/// with the Checkpoint Coordinator after each successful flush.
pub struct FlushController {
    buffer: Arc<BatchBuffer>,
    dispatcher: BulkDispatcher,
    checkpoint: CheckpointCoordinator,
    metrics: Arc<dyn MetricsSink>,
    size_limit: usize,
    byte_size_limit: usize,
    ticker_duration: Duration,
    closed: AtomicBool,
    flushing: AtomicBool,
    flush_lock: tokio::sync::Mutex<()>,
}

impl FlushController {
    pub fn new(
        buffer: Arc<BatchBuffer>,
        dispatcher: BulkDispatcher,
        checkpoint: CheckpointCoordinator,
        metrics: Arc<dyn MetricsSink>,
        size_limit: usize,
        byte_size_limit: usize,
        ticker_duration: Duration,
    ) -> Self {
        Self {
            buffer,
            dispatcher,
            checkpoint,
            metrics,
            size_limit,
            byte_size_limit,
            ticker_duration,
            closed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn size_limit(&self) -> usize {
        self.size_limit
    }

    pub fn byte_size_limit(&self) -> usize {
        self.byte_size_limit
    }

    /// Reconstructs the nominal flush state for observability/testing.
    pub async fn state(&self) -> FlushState {
        if self.closed.load(Ordering::SeqCst) {
            return FlushState::Closed;
        }
        if self.buffer.is_rebalancing().await {
            return FlushState::RebalancePaused;
        }
        if self.flushing.load(Ordering::SeqCst) {
            return FlushState::Flushing;
        }
        FlushState::Idle
    }

    /// Runs the ticker-driven flush loop. Exits when [`Self::close`] is
    /// called. Size/byte-threshold flushes happen synchronously inline with
    /// admission (§4.C) rather than through this loop; this loop only
    /// covers the time-based flush. Equivalent to the original's `StartBulk`.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.ticker_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            if let Err(err) = self.flush_once().await {
                error!(error = %err, "fatal error during flush; stopping flush loop");
                self.closed.store(true, Ordering::SeqCst);
                return;
            }
        }
    }

    /// One flush cycle (§4.D): drain, dispatch, and commit the checkpoint
    /// all while still holding the buffer lock, so no concurrent admission
    /// can ack a new event — and have it count toward the upstream replay
    /// position — until this flush's writes have actually landed (§4.F).
    ///
    /// `flush_lock` additionally ensures a flush is never concurrent with
    /// another flush (the buffer lock alone only prevents a flush and an
    /// admission from interleaving, not two flushes from interleaving).
    pub async fn flush_once(&self) -> SinkResult<()> {
        let _guard = self.flush_lock.lock().await;

        self.flushing.store(true, Ordering::SeqCst);
        let result = self.flush_once_locked().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn flush_once_locked(&self) -> SinkResult<()> {
        let result = self
            .buffer
            .drain_and(|items| async move {
                if !items.is_empty() {
                    let started = Instant::now();
                    self.dispatcher.dispatch(items).await?;
                    self.metrics
                        .record_bulk_latency(started.elapsed().as_millis() as i64);
                }

                self.checkpoint.maybe_commit().await;
                Ok(())
            })
            .await;

        result.unwrap_or(Ok(()))
    }

    /// Rebalance begin/end transitions (§4.D). Admission and flushes both
    /// become no-ops while rebalancing.
    pub async fn set_rebalancing(&self, rebalancing: bool) {
        if rebalancing {
            info!("entering rebalance pause");
        } else {
            info!("resuming from rebalance pause");
        }
        self.buffer.set_rebalancing(rebalancing).await;
    }

    /// Stops the ticker loop and performs a best-effort final flush.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(err) = self.flush_once().await {
            error!(error = %err, "error during final flush on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, MongoDbConfig};
    use crate::driver::MongoDriver;
    use crate::metrics::PrometheusMetricsSink;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    async fn test_driver() -> Arc<MongoDriver> {
        let cfg = MongoDbConfig {
            connection: ConnectionConfig {
                uri: "mongodb://localhost:27017".to_string(),
                database: "testdb".to_string(),
                username: None,
                password: None,
            },
            ..Default::default()
        };
        // Constructing a client only parses the URI; it never dials out.
        Arc::new(MongoDriver::connect(&cfg).await.expect("client construction is lazy"))
    }

    fn controller(buffer: Arc<BatchBuffer>, dispatcher: BulkDispatcher, checkpoint: CheckpointCoordinator) -> FlushController {
        FlushController::new(
            buffer,
            dispatcher,
            checkpoint,
            Arc::new(PrometheusMetricsSink),
            10,
            1_000_000,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn rebalance_pause_makes_flush_a_no_op() {
        let buffer = Arc::new(BatchBuffer::new());
        buffer.set_rebalancing(true).await;

        let dispatcher = BulkDispatcher::new(test_driver().await, Arc::new(PrometheusMetricsSink), Vec::new(), 1);
        let checkpoint = CheckpointCoordinator::unconditional(Arc::new(|| {}));
        let flush_controller = controller(buffer, dispatcher, checkpoint);

        flush_controller
            .flush_once()
            .await
            .expect("rebalance pause is a no-op, not an error");
        assert_eq!(flush_controller.state().await, FlushState::RebalancePaused);
    }

    #[tokio::test]
    async fn empty_buffer_flush_still_commits_checkpoint_unconditionally() {
        let buffer = Arc::new(BatchBuffer::new());
        let dispatcher = BulkDispatcher::new(test_driver().await, Arc::new(PrometheusMetricsSink), Vec::new(), 1);

        let commits = Arc::new(AtomicUsize::new(0));
        let counted = commits.clone();
        let checkpoint = CheckpointCoordinator::unconditional(Arc::new(move || {
            counted.fetch_add(1, AtomicOrdering::SeqCst);
        }));
        let flush_controller = controller(buffer, dispatcher, checkpoint);

        flush_controller.flush_once().await.unwrap();

        assert_eq!(commits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(flush_controller.state().await, FlushState::Idle);
    }

    #[tokio::test]
    async fn close_marks_closed_and_performs_final_flush() {
        let buffer = Arc::new(BatchBuffer::new());
        let dispatcher = BulkDispatcher::new(test_driver().await, Arc::new(PrometheusMetricsSink), Vec::new(), 1);
        let checkpoint = CheckpointCoordinator::unconditional(Arc::new(|| {}));
        let flush_controller = controller(buffer, dispatcher, checkpoint);

        flush_controller.close().await;
        assert_eq!(flush_controller.state().await, FlushState::Closed);
    }
}
