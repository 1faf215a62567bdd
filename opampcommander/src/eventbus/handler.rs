//! Inbound bus events → local sessions. The subject gate comes first:
//! messages addressed to another replica cause no persistence read and no
//! enqueue. Agents named in a message but not bound here are silently
//! dropped; the replica that holds them (or its reconciliation loop) is
//! responsible.

use super::{HandleError, SUBJECT_ALL, ServerMessage, ServerMessagePayload, ServerMessageHandler};
use crate::opamp::registry::ConnectionRegistry;
use crate::opamp::session::EnqueueResult;
use crate::server::record::ServerId;
use crate::storage::CommandRepository;
use crate::utils::time::Clock;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub struct InboundEventHandler {
    self_id: ServerId,
    registry: Arc<ConnectionRegistry>,
    commands: Arc<dyn CommandRepository>,
    clock: Arc<dyn Clock>,
}

impl InboundEventHandler {
    pub fn new(
        self_id: ServerId,
        registry: Arc<ConnectionRegistry>,
        commands: Arc<dyn CommandRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            self_id,
            registry,
            commands,
            clock,
        }
    }
}

#[async_trait]
impl ServerMessageHandler for InboundEventHandler {
    async fn handle(&self, message: ServerMessage) -> Result<(), HandleError> {
        if message.target != self.self_id && message.target.as_str() != SUBJECT_ALL {
            trace!(target = %message.target, "dropping event addressed to another replica");
            return Ok(());
        }

        let ServerMessagePayload::SendServerToAgent {
            target_agent_instance_uids,
        } = message.payload;

        let now = self.clock.now();
        for instance_uid in target_agent_instance_uids {
            let Some(session) = self.registry.lookup_by_agent(&instance_uid) else {
                debug!(%instance_uid, "agent not bound here, dropping");
                continue;
            };
            let pending = self.commands.list_pending_by_agent(&instance_uid).await?;
            for command in pending {
                if command.is_expired(now) {
                    continue;
                }
                match session.enqueue(command.to_server_to_agent()) {
                    EnqueueResult::Accepted => {
                        self.commands.increment_delivery_attempts(&command.id).await?;
                        info!(
                            command_id = %command.id,
                            %instance_uid,
                            "command enqueued from bus event"
                        );
                    }
                    EnqueueResult::QueueFull => {
                        // The reconciliation loop retries; pushing more now
                        // would only reorder.
                        warn!(%instance_uid, "outbound queue full, deferring to reconciliation");
                        break;
                    }
                    EnqueueResult::Closed => break,
                }
            }
        }
        Ok(())
    }
}
