use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::PullConsumer};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::buffer::AckHandle;
use crate::checkpoint::CommitFn;
use crate::config::SourceConfig;
use crate::error::{SinkError, SinkResult};
use crate::event::{Event, SourceCoordinates};

/// Wire shape of one DCP-style envelope carried on a JetStream message.
/// This is the boundary the out-of-scope upstream stream client would
/// normally own; here it lets the crate run end-to-end against a concrete
/// message bus instead of a live Couchbase cluster.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum DcpEnvelope {
    Mutation {
        key: String,
        value: serde_json::Value,
        collection: String,
        event_time: DateTime<Utc>,
        vbucket_id: u16,
        cas: u64,
        sequence: u64,
    },
    Deletion {
        key: String,
        collection: String,
        event_time: DateTime<Utc>,
        vbucket_id: u16,
        cas: u64,
        sequence: u64,
    },
    Expiration {
        key: String,
        collection: String,
        event_time: DateTime<Utc>,
        vbucket_id: u16,
        cas: u64,
        sequence: u64,
    },
}

impl DcpEnvelope {
    fn into_event(self) -> Event {
        match self {
            DcpEnvelope::Mutation {
                key,
                value,
                collection,
                event_time,
                vbucket_id,
                cas,
                sequence,
            } => Event::new_mutate(
                key.into_bytes(),
                serde_json::to_vec(&value).unwrap_or_default(),
                collection,
                event_time,
                SourceCoordinates {
                    vbucket_id,
                    cas,
                    sequence,
                },
            ),
            DcpEnvelope::Deletion {
                key,
                collection,
                event_time,
                vbucket_id,
                cas,
                sequence,
            } => Event::new_delete(
                key.into_bytes(),
                collection,
                event_time,
                SourceCoordinates {
                    vbucket_id,
                    cas,
                    sequence,
                },
            ),
            DcpEnvelope::Expiration {
                key,
                collection,
                event_time,
                vbucket_id,
                cas,
                sequence,
            } => Event::new_expire(
                key.into_bytes(),
                collection,
                event_time,
                SourceCoordinates {
                    vbucket_id,
                    cas,
                    sequence,
                },
            ),
        }
    }
}

/// Per-event acknowledgement handle backed by a JetStream message ack. The
/// Batch Buffer calls this exactly once per event, after admission, per
/// Invariant 5 — never before, and never as a substitute for the checkpoint
/// commit.
pub struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait::async_trait]
impl AckHandle for JetStreamAck {
    async fn ack(&self) {
        if let Err(err) = self.message.ack().await {
            error!(error = %err, "failed to acknowledge upstream message");
        }
    }
}

/// Anything that wants to receive normalised events plus their ack handle.
/// The connector implements this to drive Mapper Invoker → Batch Buffer.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: Event, ack: Arc<dyn AckHandle>);
}

/// Abstracts the out-of-scope upstream stream client's contract (§6): deliver
/// events, signal readiness, expose a commit callable, and shut down
/// gracefully. [`NatsDcpSource`] is the one concrete implementation this
/// crate ships; the trait exists so the connector depends on the contract
/// rather than the NATS-specific wiring underneath it.
#[async_trait::async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn wait_until_ready(&self);
    async fn shutdown(&self);
    fn commit_fn(&self) -> CommitFn;
    async fn run(&self, sink: Arc<dyn EventSink>) -> SinkResult<()>;
}

/// Stand-in for the out-of-scope upstream stream client (§1, §6): delivers
/// ordered events over a NATS JetStream pull consumer, exposes readiness,
/// commit, and shutdown, and always runs in manual-checkpoint mode — the
/// core drives commit timing, never the bus.
pub struct NatsDcpSource {
    client: async_nats::Client,
    config: SourceConfig,
}

impl NatsDcpSource {
    pub async fn connect(config: SourceConfig) -> SinkResult<Self> {
        info!(url = %config.nats_url, "connecting to upstream stream bus");
        let client = async_nats::connect(&config.nats_url)
            .await
            .map_err(|err| SinkError::Source(Box::new(err)))?;
        Ok(Self { client, config })
    }

    async fn ensure_stream(&self, js: &jetstream::Context) -> SinkResult<jetstream::stream::Stream> {
        match js.get_stream(&self.config.stream_name).await {
            Ok(stream) => Ok(stream),
            Err(_) => js
                .create_stream(jetstream::stream::Config {
                    name: self.config.stream_name.clone(),
                    subjects: vec![self.config.subject.clone()],
                    retention: jetstream::stream::RetentionPolicy::Limits,
                    storage: jetstream::stream::StorageType::File,
                    ..Default::default()
                })
                .await
                .map_err(|err| SinkError::Source(Box::new(err))),
        }
    }

    async fn ensure_consumer(&self, stream: &jetstream::stream::Stream) -> SinkResult<PullConsumer> {
        match stream.get_consumer(&self.config.consumer_name).await {
            Ok(consumer) => Ok(consumer),
            Err(_) => stream
                .create_consumer(jetstream::consumer::pull::Config {
                    durable_name: Some(self.config.consumer_name.clone()),
                    filter_subject: self.config.subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: 3,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                })
                .await
                .map_err(|err| SinkError::Source(Box::new(err))),
        }
    }

}

#[async_trait::async_trait]
impl UpstreamSource for NatsDcpSource {
    async fn wait_until_ready(&self) {
        // The bus connection is established synchronously in `connect`;
        // readiness here means the stream/consumer exist.
    }

    /// Drains the underlying NATS client, which ends the consumer's message
    /// stream and causes [`Self::run`] to return. Used both for ordinary
    /// shutdown and to stop the connector after a fatal mapping/dispatch
    /// error (§7).
    async fn shutdown(&self) {
        if let Err(err) = self.client.drain().await {
            error!(error = %err, "error draining upstream connection");
        }
    }

    /// A no-argument callable the Checkpoint Coordinator may invoke to
    /// advance the upstream replay marker. This implementation is a no-op
    /// placeholder: a real Couchbase DCP client exposes a stateful
    /// `Commit()`; wiring it through is the out-of-scope collaborator's
    /// responsibility (§1).
    fn commit_fn(&self) -> CommitFn {
        Arc::new(|| {
            debug!("checkpoint commit invoked");
        })
    }

    /// Consumes messages until the stream ends or `shutdown` is called,
    /// handing each normalised `Event` plus its ack handle to `sink`.
    async fn run(&self, sink: Arc<dyn EventSink>) -> SinkResult<()> {
        let js = jetstream::new(self.client.clone());
        let stream = self.ensure_stream(&js).await?;
        let consumer = self.ensure_consumer(&stream).await?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|err| SinkError::Source(Box::new(err)))?;

        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => {
                    let payload = message.payload.clone();
                    match serde_json::from_slice::<DcpEnvelope>(&payload) {
                        Ok(envelope) => {
                            let event = envelope.into_event();
                            let ack: Arc<dyn AckHandle> = Arc::new(JetStreamAck { message });
                            sink.handle(event, ack).await;
                        }
                        Err(err) => {
                            warn!(error = %err, "dropping malformed upstream message");
                            if let Err(ack_err) = message.ack().await {
                                error!(error = %ack_err, "failed to ack malformed message");
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "error receiving from upstream bus");
                    tokio::time::sleep(Duration::from_millis(1000)).await;
                }
            }
        }

        warn!("upstream message stream ended");
        Ok(())
    }
}
