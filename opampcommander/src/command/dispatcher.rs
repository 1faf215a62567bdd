//! Routes a freshly issued command to the replica that can deliver it:
//! this one (fast path), the recorded last owner, or every live peer when
//! nobody is known to hold the agent.

use super::Command;
use crate::eventbus::{EventBusError, EventBusPublisher, ServerMessage, ServerMessagePayload};
use crate::opamp::instance_uid::InstanceUid;
use crate::opamp::registry::ConnectionRegistry;
use crate::opamp::session::EnqueueResult;
use crate::server::identity::ServerIdentityService;
use crate::server::record::ServerId;
use crate::storage::{AgentRepository, CommandRepository, StorageError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("bus error: {0}")]
    Bus(#[from] EventBusError),
}

/// Where a dispatch ended up. `Deferred` means the target is held locally
/// but its queue is full; nothing was published, the reconciliation loop
/// retries.
#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    DeliveredLocally,
    Published { targets: Vec<ServerId> },
    Deferred,
    AlreadySettled,
}

/// Port the operator-facing API layer talks to.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn dispatch(&self, command: Command) -> Result<DispatchOutcome, DispatchError>;
}

pub struct CommandDispatcher {
    identity: Arc<ServerIdentityService>,
    registry: Arc<ConnectionRegistry>,
    agents: Arc<dyn AgentRepository>,
    commands: Arc<dyn CommandRepository>,
    bus: Arc<dyn EventBusPublisher>,
}

impl CommandDispatcher {
    pub fn new(
        identity: Arc<ServerIdentityService>,
        registry: Arc<ConnectionRegistry>,
        agents: Arc<dyn AgentRepository>,
        commands: Arc<dyn CommandRepository>,
        bus: Arc<dyn EventBusPublisher>,
    ) -> Self {
        Self {
            identity,
            registry,
            agents,
            commands,
            bus,
        }
    }

    async fn publish(
        &self,
        subject: &ServerId,
        instance_uid: InstanceUid,
    ) -> Result<(), EventBusError> {
        let message = ServerMessage {
            source: self.identity.self_id().clone(),
            target: subject.clone(),
            payload: ServerMessagePayload::SendServerToAgent {
                target_agent_instance_uids: vec![instance_uid],
            },
        };
        self.bus.send_message_to_server(subject, message).await
    }
}

#[async_trait]
impl CommandSink for CommandDispatcher {
    async fn dispatch(&self, command: Command) -> Result<DispatchOutcome, DispatchError> {
        let instance_uid = command.target_instance_uid;

        let inserted = self.commands.insert(command.clone()).await?;
        if !inserted {
            // Replay of a known id. Delivery below is harmless (the agent
            // applies by hash), but a settled command stays settled.
            if let Some(stored) = self.commands.get(&command.id).await? {
                if stored.state.is_terminal() {
                    debug!(command_id = %command.id, "replay of settled command, nothing to do");
                    return Ok(DispatchOutcome::AlreadySettled);
                }
            }
        }

        // Fast path: the target agent is connected to this replica.
        if let Some(session) = self.registry.lookup_by_agent(&instance_uid) {
            match session.enqueue(command.to_server_to_agent()) {
                EnqueueResult::Accepted => {
                    self.commands.increment_delivery_attempts(&command.id).await?;
                    info!(
                        command_id = %command.id,
                        %instance_uid,
                        "command delivered on local fast path"
                    );
                    return Ok(DispatchOutcome::DeliveredLocally);
                }
                EnqueueResult::QueueFull => {
                    // Not locally deliverable right now. Publishing too
                    // would risk a double send once the queue drains.
                    warn!(
                        command_id = %command.id,
                        %instance_uid,
                        "outbound queue full, deferring to reconciliation"
                    );
                    return Ok(DispatchOutcome::Deferred);
                }
                // The session is going away; route via the bus.
                EnqueueResult::Closed => {}
            }
        }

        // The replica that saw the agent last, if it is still alive.
        let last_owner = self
            .agents
            .get(&instance_uid)
            .await?
            .and_then(|agent| agent.last_owner_server_id);
        if let Some(owner) = last_owner {
            if owner != *self.identity.self_id() && self.identity.is_live(&owner).await? {
                self.publish(&owner, instance_uid).await?;
                info!(
                    command_id = %command.id,
                    %instance_uid,
                    target = %owner,
                    "command routed to last owning replica"
                );
                return Ok(DispatchOutcome::Published {
                    targets: vec![owner],
                });
            }
        }

        // Catch-all: fan out to every live peer; whoever holds the agent
        // delivers, everyone else drops. Trades bandwidth for correctness
        // during partitions.
        let peers = self.identity.peers().await?;
        let mut targets = Vec::with_capacity(peers.len());
        for peer in peers {
            self.publish(&peer.server_id, instance_uid).await?;
            targets.push(peer.server_id);
        }
        if targets.is_empty() {
            debug!(
                command_id = %command.id,
                %instance_uid,
                "no live peer to route to; command stays pending for reconciliation"
            );
        } else {
            info!(
                command_id = %command.id,
                %instance_uid,
                peer_count = targets.len(),
                "command fanned out to live peers"
            );
        }
        Ok(DispatchOutcome::Published { targets })
    }
}
