//! The agent usecase: the single write path into the agent aggregate and the
//! read operations the API layer consumes. Every `AgentToServer` report,
//! whichever session it arrived on, goes through [`AgentUsecase::apply`].

use super::{Agent, MergeError, RemoteConfigApplyStatus};
use crate::command::{Command, CommandPayload, CommandState};
use crate::opamp::instance_uid::{InstanceUid, InstanceUidError};
use crate::server::record::ServerId;
use crate::storage::{AgentRepository, AttributeQuery, CommandRepository, Page, StorageError};
use crate::utils::time::Clock;
use async_trait::async_trait;
use opamp_proto::proto::{AgentToServer, ServerToAgent, ServerToAgentFlags};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("malformed instance uid: {0}")]
    InstanceUid(#[from] InstanceUidError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What a processed report asks the owning session to do.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub instance_uid: InstanceUid,
    /// Frame to enqueue on the owning connection, if the agent needs to hear
    /// something: a remote config it has not converged to, or a full-state
    /// request.
    pub push: Option<ServerToAgent>,
    /// The report carried an agent_disconnect marker.
    pub disconnect: bool,
}

/// Port the connection session uses to hand reports to the domain.
#[async_trait]
pub trait ReportProcessor: Send + Sync {
    async fn apply(&self, report: AgentToServer) -> Result<ApplyOutcome, ApplyError>;
}

pub struct AgentUsecase {
    agents: Arc<dyn AgentRepository>,
    commands: Arc<dyn CommandRepository>,
    server_id: ServerId,
    clock: Arc<dyn Clock>,
}

impl AgentUsecase {
    pub fn new(
        agents: Arc<dyn AgentRepository>,
        commands: Arc<dyn CommandRepository>,
        server_id: ServerId,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            agents,
            commands,
            server_id,
            clock,
        }
    }

    pub async fn get(&self, instance_uid: &InstanceUid) -> Result<Option<Agent>, StorageError> {
        self.agents.get(instance_uid).await
    }

    pub async fn list(
        &self,
        limit: usize,
        continue_token: Option<String>,
    ) -> Result<Page<Agent>, StorageError> {
        self.agents.list(limit, continue_token).await
    }

    pub async fn search_by_attributes(
        &self,
        query: &AttributeQuery,
    ) -> Result<Vec<Agent>, StorageError> {
        self.agents.search_by_attributes(query).await
    }

    /// Settles command state against what the agent just reported: a command
    /// whose hash the agent echoes as applied is acknowledged, one it echoes
    /// as failed is failed. Returns the ids that reached a terminal state.
    async fn track_acknowledgements(
        &self,
        agent: &Agent,
        report: &AgentToServer,
        pending: &[Command],
    ) -> Result<Vec<crate::command::CommandId>, StorageError> {
        let mut settled = Vec::new();
        for command in pending {
            let next_state = match &command.payload {
                CommandPayload::UpdateAgentConfig { .. } => {
                    agent.remote_config.as_ref().and_then(|remote| {
                        if remote.last_remote_config_hash != command.ack_hash() {
                            return None;
                        }
                        match &remote.status {
                            RemoteConfigApplyStatus::Applied => Some(CommandState::Acknowledged),
                            RemoteConfigApplyStatus::Failed { error_message } => {
                                Some(CommandState::Failed {
                                    error_message: error_message.clone(),
                                })
                            }
                            _ => None,
                        }
                    })
                }
                CommandPayload::PushPackage { .. } => {
                    report.package_statuses.as_ref().and_then(|statuses| {
                        if statuses.server_provided_all_packages_hash != command.ack_hash() {
                            return None;
                        }
                        if statuses.error_message.is_empty() {
                            Some(CommandState::Acknowledged)
                        } else {
                            Some(CommandState::Failed {
                                error_message: statuses.error_message.clone(),
                            })
                        }
                    })
                }
            };
            if let Some(next) = next_state {
                let transitioned = self
                    .commands
                    .compare_and_set_state(&command.id, &CommandState::Pending, next.clone())
                    .await?;
                if transitioned {
                    info!(
                        command_id = %command.id,
                        instance_uid = %agent.instance_uid,
                        state = ?next,
                        "command settled by agent report"
                    );
                    settled.push(command.id);
                }
            }
        }
        Ok(settled)
    }

    /// The frame the agent still needs, if any: the most recent pending
    /// config command whose hash the agent has not converged to.
    fn desired_push(&self, agent: &Agent, still_pending: &[Command]) -> Option<ServerToAgent> {
        let latest = still_pending
            .iter()
            .filter(|command| command.desired_config_hash().is_some())
            .max_by_key(|command| command.audit.created_at)?;
        let desired = latest.desired_config_hash()?;
        if agent.effective_config_hash() == Some(desired.as_slice()) {
            return None;
        }
        Some(latest.to_server_to_agent())
    }
}

#[async_trait]
impl ReportProcessor for AgentUsecase {
    async fn apply(&self, report: AgentToServer) -> Result<ApplyOutcome, ApplyError> {
        let instance_uid = InstanceUid::try_from(report.instance_uid.as_slice())?;
        let now = self.clock.now();

        let existing = self.agents.get(&instance_uid).await?;
        let created = existing.is_none();
        let mut agent = existing.unwrap_or_else(|| {
            info!(%instance_uid, "first contact from unknown agent");
            Agent::new(instance_uid, now)
        });

        let mut flags = 0u64;
        if created && report.sequence_num > 1 {
            // Mid-stream join: the agent has state we never saw.
            flags |= ServerToAgentFlags::ReportFullState as u64;
        }

        if let Err(MergeError::SequenceRegression { reported, current }) =
            agent.merge_report(&report, now, &self.server_id)
        {
            warn!(
                %instance_uid,
                reported,
                current,
                "dropping report with regressed sequence number"
            );
            return Ok(ApplyOutcome {
                instance_uid,
                push: None,
                disconnect: false,
            });
        }
        self.agents.upsert(agent.clone()).await?;

        let pending = self.commands.list_pending_by_agent(&instance_uid).await?;
        let settled = self.track_acknowledgements(&agent, &report, &pending).await?;
        let still_pending: Vec<Command> = pending
            .into_iter()
            .filter(|command| !settled.contains(&command.id))
            .collect();

        let mut push = self.desired_push(&agent, &still_pending);
        if flags != 0 {
            push = Some(match push {
                Some(mut frame) => {
                    frame.flags |= flags;
                    frame
                }
                None => ServerToAgent {
                    instance_uid: instance_uid.into_bytes(),
                    flags,
                    capabilities: crate::server::SERVER_CAPABILITIES,
                    ..Default::default()
                },
            });
        }

        debug!(
            %instance_uid,
            sequence_num = report.sequence_num,
            push = push.is_some(),
            "agent report applied"
        );
        Ok(ApplyOutcome {
            instance_uid,
            push,
            disconnect: report.agent_disconnect.is_some(),
        })
    }
}
