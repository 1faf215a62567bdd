//! Kafka transport. One topic shared by all replicas; the producer keys
//! records by target server id so per-target order survives partitioning.
//! All replicas join one consumer group, so partitions are load-balanced
//! across them and a replica may read messages addressed to a peer; the
//! subject filter downstream tolerates that over-reading.

use super::{
    EventBusError, EventBusPublisher, EventBusReceiver, ReceiverCounters, ServerMessage,
    ServerMessageHandler, envelope, process_raw_event,
};
use crate::server::record::ServerId;
use crate::utils::retry::next_backoff;
use crate::utils::time::Clock;
use async_trait::async_trait;
use rdkafka::Message as _;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared by every replica so partitions are balanced across the fleet.
pub const CONSUMER_GROUP: &str = "opampcommander-consumer-group";

const PRODUCER_RETRIES: &str = "10";
const PRODUCER_RETRY_BACKOFF_MS: &str = "2000";

const RECEIVE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RECEIVE_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub struct KafkaEventBus {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl KafkaEventBus {
    pub fn new(
        brokers: &str,
        topic: &str,
        send_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EventBusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("retries", PRODUCER_RETRIES)
            .set("retry.backoff.ms", PRODUCER_RETRY_BACKOFF_MS)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .create()
            .map_err(|err| EventBusError::Connect(err.to_string()))?;
        info!(brokers, topic, "Kafka producer created");
        Ok(Self {
            producer,
            topic: topic.to_string(),
            send_timeout,
            clock,
        })
    }
}

#[async_trait]
impl EventBusPublisher for KafkaEventBus {
    async fn send_message_to_server(
        &self,
        target: &ServerId,
        message: ServerMessage,
    ) -> Result<(), EventBusError> {
        let payload = envelope::encode_to_bytes(&message, Uuid::new_v4(), self.clock.now())?;
        debug!(%target, topic = %self.topic, "publishing Kafka event");
        let record = FutureRecord::to(&self.topic)
            .key(target.as_str())
            .payload(&payload);
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _message)| EventBusError::PublishFailed(err.to_string()))?;
        Ok(())
    }
}

pub struct KafkaEventBusReceiver {
    consumer: StreamConsumer,
    topic: String,
    counters: Arc<ReceiverCounters>,
}

impl KafkaEventBusReceiver {
    pub fn new(
        brokers: &str,
        topic: &str,
        counters: Arc<ReceiverCounters>,
    ) -> Result<Self, EventBusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", CONSUMER_GROUP)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|err| EventBusError::Connect(err.to_string()))?;
        consumer
            .subscribe(&[topic])
            .map_err(|err| EventBusError::Connect(err.to_string()))?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            counters,
        })
    }
}

#[async_trait]
impl EventBusReceiver for KafkaEventBusReceiver {
    async fn run(
        self: Box<Self>,
        token: CancellationToken,
        handler: Arc<dyn ServerMessageHandler>,
    ) -> Result<(), EventBusError> {
        info!(topic = %self.topic, group = CONSUMER_GROUP, "Kafka event receiver started");
        let mut backoff = RECEIVE_BACKOFF_INITIAL;
        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = self.consumer.recv() => match result {
                    Ok(record) => {
                        backoff = RECEIVE_BACKOFF_INITIAL;
                        match record.payload() {
                            Some(payload) => {
                                process_raw_event(payload, handler.as_ref(), &self.counters).await;
                            }
                            None => {
                                warn!("Kafka record without payload, skipping");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(error_msg = %err, "Kafka receive failed, backing off");
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff, RECEIVE_BACKOFF_CAP);
                    }
                },
            }
        }
    }
}
