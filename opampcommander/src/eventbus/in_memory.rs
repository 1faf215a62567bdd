//! In-process event bus for standalone deployments and tests. One hub, one
//! buffered channel per subscriber; the port shape is identical to the
//! networked transports.

use super::{
    EventBusError, EventBusPublisher, EventBusReceiver, ReceiverCounters, ServerMessage,
    ServerMessageHandler, envelope, process_raw_event,
};
use crate::server::record::ServerId;
use crate::utils::time::Clock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Hub and publish side. Cloning shares the subscriber list, so every
/// replica wired to the same hub sees every event, exactly like a shared
/// topic.
#[derive(Clone)]
pub struct InMemoryEventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>,
    channel_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl InMemoryEventBus {
    pub fn new(channel_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            channel_capacity: channel_capacity.max(1),
            clock,
        }
    }

    /// Registers a new receiver on the hub.
    pub fn subscribe(&self, counters: Arc<ReceiverCounters>) -> InMemoryEventBusReceiver {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers
            .lock()
            .expect("subscriber list lock poisoned")
            .push(tx);
        InMemoryEventBusReceiver { rx, counters }
    }

    /// Injects an already-encoded event. Lets tests exercise the poison
    /// paths the typed publisher cannot produce.
    pub async fn publish_raw(&self, payload: Vec<u8>) {
        let senders: Vec<_> = self
            .subscribers
            .lock()
            .expect("subscriber list lock poisoned")
            .clone();
        for sender in senders {
            let _ = sender.send(payload.clone()).await;
        }
        self.subscribers
            .lock()
            .expect("subscriber list lock poisoned")
            .retain(|sender| !sender.is_closed());
    }
}

#[async_trait]
impl EventBusPublisher for InMemoryEventBus {
    async fn send_message_to_server(
        &self,
        target: &ServerId,
        message: ServerMessage,
    ) -> Result<(), EventBusError> {
        let payload = envelope::encode_to_bytes(&message, Uuid::new_v4(), self.clock.now())?;
        debug!(%target, "publishing in-memory event");
        self.publish_raw(payload).await;
        Ok(())
    }
}

pub struct InMemoryEventBusReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
    counters: Arc<ReceiverCounters>,
}

#[async_trait]
impl EventBusReceiver for InMemoryEventBusReceiver {
    async fn run(
        mut self: Box<Self>,
        token: CancellationToken,
        handler: Arc<dyn ServerMessageHandler>,
    ) -> Result<(), EventBusError> {
        info!("in-memory event receiver started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe = self.rx.recv() => match maybe {
                    Some(payload) => {
                        process_raw_event(&payload, handler.as_ref(), &self.counters).await;
                    }
                    None => break,
                },
            }
        }
        info!("in-memory event receiver stopped");
        Ok(())
    }
}
