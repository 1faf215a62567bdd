//! The cross-replica event bus: the port pair every transport implements,
//! the routed message shape, and the shared receive-side processing.
//!
//! Bus messages carry agent instance uids only, never command bodies; the
//! receiving replica loads the bodies from persistence. Delivery is
//! at-least-once on every transport, so everything downstream of a receive
//! is idempotent.

pub mod envelope;
pub mod handler;
pub mod in_memory;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod nats;

use crate::opamp::instance_uid::InstanceUid;
use crate::server::record::ServerId;
use crate::storage::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Subject token addressing every replica at once. Each receiver still
/// filters by its own connection registry.
pub const SUBJECT_ALL: &str = "all";

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("consume failed: {0}")]
    ConsumeFailed(String),

    #[error("bus unreachable: {0}")]
    Connect(String),

    #[error("envelope error: {0}")]
    Envelope(#[from] envelope::EnvelopeError),
}

#[derive(Error, Debug)]
pub enum HandleError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// One routed server-to-server message. Constructed by the dispatcher,
/// serialized by the envelope codec, consumed by the inbound handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    /// Replica that published the message.
    pub source: ServerId,
    /// Replica the message addresses, or [`SUBJECT_ALL`].
    pub target: ServerId,
    pub payload: ServerMessagePayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessagePayload {
    SendServerToAgent {
        target_agent_instance_uids: Vec<InstanceUid>,
    },
}

/// Publish side of the bus.
#[async_trait]
pub trait EventBusPublisher: Send + Sync {
    async fn send_message_to_server(
        &self,
        target: &ServerId,
        message: ServerMessage,
    ) -> Result<(), EventBusError>;
}

/// Consumer callback. Implementations must filter by subject before touching
/// persistence; foreign messages are someone else's.
#[async_trait]
pub trait ServerMessageHandler: Send + Sync {
    async fn handle(&self, message: ServerMessage) -> Result<(), HandleError>;
}

/// Receive side of the bus. `run` owns the consumer loop until the token is
/// cancelled; a return with `Err` means the loop died and the process
/// supervisor decides what happens next.
#[async_trait]
pub trait EventBusReceiver: Send {
    async fn run(
        self: Box<Self>,
        token: CancellationToken,
        handler: Arc<dyn ServerMessageHandler>,
    ) -> Result<(), EventBusError>;
}

/// Receive-side error counters. Poison messages must never block the
/// consumer loop, so they are consumed, logged and counted here instead.
#[derive(Debug, Default)]
pub struct ReceiverCounters {
    pub handled: AtomicU64,
    pub handler_failed: AtomicU64,
    pub unknown_event_type: AtomicU64,
    pub payload_decode_failed: AtomicU64,
}

impl ReceiverCounters {
    pub fn unknown_event_type(&self) -> u64 {
        self.unknown_event_type.load(Ordering::Relaxed)
    }

    pub fn payload_decode_failed(&self) -> u64 {
        self.payload_decode_failed.load(Ordering::Relaxed)
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Shared receive-side processing: decode, hand over, count. Decode and
/// handler failures are terminal for the message, never for the loop.
pub(crate) async fn process_raw_event(
    payload: &[u8],
    handler: &dyn ServerMessageHandler,
    counters: &ReceiverCounters,
) {
    match envelope::decode_bytes(payload) {
        Ok(message) => {
            debug!(source = %message.source, target = %message.target, "bus message received");
            match handler.handle(message).await {
                Ok(()) => {
                    counters.handled.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    counters.handler_failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error_msg = %err, "bus message handler failed, message consumed");
                }
            }
        }
        Err(err @ envelope::EnvelopeError::UnknownEventType(_)) => {
            counters.unknown_event_type.fetch_add(1, Ordering::Relaxed);
            warn!(error_msg = %err, "consuming event of unknown type");
        }
        Err(err) => {
            counters.payload_decode_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error_msg = %err, "consuming undecodable event");
        }
    }
}
