use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::buffer::{AckHandle, BatchBuffer};
use crate::checkpoint::CheckpointCoordinator;
use crate::config::Config;
use crate::dispatch::BulkDispatcher;
use crate::driver::MongoDriver;
use crate::error::{SinkError, SinkResult};
use crate::event::Event;
use crate::flush::FlushController;
use crate::mapper::{DefaultMapper, Mapper};
use crate::metrics::MetricsSink;
use crate::source::{EventSink, NatsDcpSource, UpstreamSource};

/// Wires the upstream source through the Mapper Invoker into the Batch
/// Buffer, and owns the Flush Controller's background loop (§2's data-flow
/// pipeline end to end).
pub struct Connector {
    source: Arc<NatsDcpSource>,
    mapper: Arc<dyn Mapper>,
    buffer: Arc<BatchBuffer>,
    flush_controller: Arc<FlushController>,
    metrics: Arc<dyn MetricsSink>,
    fatal: AtomicBool,
}

impl Connector {
    pub async fn build(config: Config, metrics: Arc<dyn MetricsSink>) -> SinkResult<Self> {
        let (collection_mapping, default_collection) = config.resolved_collection_mapping()?;
        let mapper: Arc<dyn Mapper> = Arc::new(DefaultMapper::new(collection_mapping, default_collection));

        let driver = Arc::new(MongoDriver::connect(&config.mongodb).await?);
        let dispatcher = BulkDispatcher::new(
            driver,
            metrics.clone(),
            config.mongodb.shard_keys.clone(),
            config.mongodb.batch.concurrent_request(),
        );

        let source = Arc::new(NatsDcpSource::connect(config.source).await?);

        let checkpoint = match config.mongodb.batch.commit_ticker_duration() {
            Some(duration) => {
                let ticker = tokio::time::interval(duration);
                CheckpointCoordinator::throttled(source.commit_fn(), ticker)
            }
            None => CheckpointCoordinator::unconditional(source.commit_fn()),
        };

        let buffer = Arc::new(BatchBuffer::new());
        let flush_controller = Arc::new(FlushController::new(
            buffer.clone(),
            dispatcher,
            checkpoint,
            metrics.clone(),
            config.mongodb.batch.size_limit(),
            config.mongodb.batch.byte_size_limit(),
            config.mongodb.batch.ticker_duration(),
        ));

        Ok(Self {
            source,
            mapper,
            buffer,
            flush_controller,
            metrics,
            fatal: AtomicBool::new(false),
        })
    }

    /// Starts the flush loop in the background, waits for the upstream
    /// source to become ready, then consumes events until the source's
    /// message stream ends or a fatal error stops it — the original's
    /// `<-c.dcp.WaitUntilReady(); c.bulk.StartBulk()` followed by
    /// `c.dcp.Start()`.
    pub async fn start(self: Arc<Self>) -> SinkResult<()> {
        let flush_controller = self.flush_controller.clone();
        tokio::spawn(async move {
            flush_controller.run().await;
        });

        self.source.wait_until_ready().await;

        let sink: Arc<dyn EventSink> = self.clone();
        self.source.run(sink).await
    }

    pub async fn close(&self) {
        info!("closing connector");
        self.source.shutdown().await;
        self.flush_controller.close().await;
    }
}

#[async_trait::async_trait]
impl EventSink for Connector {
    async fn handle(&self, event: Event, ack: Arc<dyn AckHandle>) {
        if self.fatal.load(Ordering::SeqCst) {
            return;
        }

        let event_time = event.event_time;
        let source_collection = event.source_collection.clone();

        let actions = match self.mapper.map(&event) {
            Ok(actions) => actions,
            Err(err @ SinkError::MissingCollectionMapping { .. }) => {
                error!(error = %err, "fatal mapping error, shutting down connector");
                self.fatal.store(true, Ordering::SeqCst);
                self.source.shutdown().await;
                return;
            }
            Err(err) => {
                error!(
                    collection = %source_collection,
                    error = %err,
                    "dropping event that failed to map"
                );
                ack.ack().await;
                return;
            }
        };

        if actions.is_empty() {
            ack.ack().await;
            return;
        }

        let should_flush = self
            .buffer
            .admit(
                actions,
                ack.as_ref(),
                self.flush_controller.size_limit(),
                self.flush_controller.byte_size_limit(),
            )
            .await;

        let process_latency_ms = (Utc::now() - event_time).num_milliseconds();
        self.metrics.record_process_latency(process_latency_ms);

        if should_flush {
            if let Err(err) = self.flush_controller.flush_once().await {
                error!(error = %err, "fatal error during synchronous threshold flush, shutting down connector");
                self.fatal.store(true, Ordering::SeqCst);
                self.source.shutdown().await;
            }
        }
    }
}
