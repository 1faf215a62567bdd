//! NATS transport. One subject shared by all replicas, one plain (non-queue)
//! subscription per replica: every replica sees every event and filters by
//! subject, exactly like the Kafka group with over-reading.

use super::{
    EventBusError, EventBusPublisher, EventBusReceiver, ReceiverCounters, ServerMessage,
    ServerMessageHandler, envelope, process_raw_event,
};
use crate::server::record::ServerId;
use crate::utils::retry::next_backoff;
use crate::utils::time::Clock;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Suffix appended to the configured subject prefix.
const SUBJECT_SUFFIX: &str = "events";

const RESUBSCRIBE_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const RESUBSCRIBE_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
    subject: String,
    clock: Arc<dyn Clock>,
}

impl NatsEventBus {
    /// Connects to the NATS endpoint. A failure here means the bus is
    /// unreachable and the process must not come up.
    pub async fn connect(
        endpoint: &str,
        subject_prefix: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EventBusError> {
        let client = async_nats::connect(endpoint)
            .await
            .map_err(|err| EventBusError::Connect(err.to_string()))?;
        let subject = format!("{subject_prefix}.{SUBJECT_SUFFIX}");
        info!(endpoint, subject, "connected to NATS");
        Ok(Self {
            client,
            subject,
            clock,
        })
    }

    pub fn receiver(&self, counters: Arc<ReceiverCounters>) -> NatsEventBusReceiver {
        NatsEventBusReceiver {
            client: self.client.clone(),
            subject: self.subject.clone(),
            counters,
        }
    }
}

#[async_trait]
impl EventBusPublisher for NatsEventBus {
    async fn send_message_to_server(
        &self,
        target: &ServerId,
        message: ServerMessage,
    ) -> Result<(), EventBusError> {
        let payload = envelope::encode_to_bytes(&message, Uuid::new_v4(), self.clock.now())?;
        debug!(%target, subject = %self.subject, "publishing NATS event");
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|err| EventBusError::PublishFailed(err.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|err| EventBusError::PublishFailed(err.to_string()))?;
        Ok(())
    }
}

pub struct NatsEventBusReceiver {
    client: async_nats::Client,
    subject: String,
    counters: Arc<ReceiverCounters>,
}

#[async_trait]
impl EventBusReceiver for NatsEventBusReceiver {
    async fn run(
        self: Box<Self>,
        token: CancellationToken,
        handler: Arc<dyn ServerMessageHandler>,
    ) -> Result<(), EventBusError> {
        let mut backoff = RESUBSCRIBE_BACKOFF_INITIAL;
        loop {
            let mut subscriber = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                result = self.client.subscribe(self.subject.clone()) => match result {
                    Ok(subscriber) => {
                        info!(subject = %self.subject, "NATS event receiver subscribed");
                        backoff = RESUBSCRIBE_BACKOFF_INITIAL;
                        subscriber
                    }
                    Err(err) => {
                        warn!(error_msg = %err, "NATS subscribe failed, backing off");
                        tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = next_backoff(backoff, RESUBSCRIBE_BACKOFF_CAP);
                        continue;
                    }
                },
            };

            loop {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    maybe = subscriber.next() => match maybe {
                        Some(message) => {
                            process_raw_event(&message.payload, handler.as_ref(), &self.counters)
                                .await;
                        }
                        // Subscription ended; resubscribe after a pause.
                        None => {
                            warn!(subject = %self.subject, "NATS subscription closed, resubscribing");
                            break;
                        }
                    },
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, RESUBSCRIBE_BACKOFF_CAP);
        }
    }
}
