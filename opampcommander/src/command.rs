//! Server-originated commands and their delivery machinery.
//!
//! A command is created by an operator call on any replica, persisted in
//! `Pending` state, and delivered to the target agent's session by whichever
//! replica holds it. The state machine is monotonic: `Pending` is initial
//! and `Acknowledged`, `Failed` and `Expired` are terminal.

pub mod dispatcher;
pub mod reconciler;

use crate::agent::config::ConfigMap;
use crate::opamp::instance_uid::InstanceUid;
use chrono::{DateTime, Utc};
use opamp_proto::proto::{
    AgentRemoteConfig, DownloadableFile, PackageAvailable, PackageType, PackagesAvailable,
    ServerToAgent,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;
use uuid::Uuid;

/// Content address of a command. Replays with the same id are idempotent.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    pub fn create() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for CommandId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl TryFrom<&str> for CommandId {
    type Error = uuid::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(Self(Uuid::parse_str(value)?))
    }
}

impl Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    UpdateAgentConfig,
    PushPackage,
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdateAgentConfig => write!(f, "update-agent-config"),
            Self::PushPackage => write!(f, "push-package"),
        }
    }
}

/// Kind-specific command body. This is what persistence stores; the bus only
/// ever carries the target instance uids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandPayload {
    UpdateAgentConfig {
        config: ConfigMap,
    },
    PushPackage {
        name: String,
        version: String,
        download_url: String,
        content_hash: Vec<u8>,
    },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::UpdateAgentConfig { .. } => CommandKind::UpdateAgentConfig,
            Self::PushPackage { .. } => CommandKind::PushPackage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandState {
    Pending,
    Acknowledged,
    Failed { error_message: String },
    Expired,
}

impl CommandState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub target_instance_uid: InstanceUid,
    pub payload: CommandPayload,
    pub audit: Audit,
    pub state: CommandState,
    pub delivery_attempts: u32,
    pub expires_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        id: CommandId,
        target_instance_uid: InstanceUid,
        payload: CommandPayload,
        created_by: impl Into<String>,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            target_instance_uid,
            payload,
            audit: Audit {
                created_by: created_by.into(),
                created_at,
            },
            state: CommandState::Pending,
            delivery_attempts: 0,
            expires_at: created_at
                + chrono::Duration::from_std(ttl)
                    .unwrap_or_else(|_| chrono::Duration::days(36500)),
        }
    }

    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The hash the target agent echoes back once it has applied this
    /// command: the config hash for config updates, the offered package hash
    /// for package pushes.
    pub fn ack_hash(&self) -> Vec<u8> {
        match &self.payload {
            CommandPayload::UpdateAgentConfig { config } => config.hash(),
            CommandPayload::PushPackage { content_hash, .. } => content_hash.clone(),
        }
    }

    /// The effective-config hash this command wants the agent to converge to,
    /// if it is a config command.
    pub fn desired_config_hash(&self) -> Option<Vec<u8>> {
        match &self.payload {
            CommandPayload::UpdateAgentConfig { config } => Some(config.hash()),
            CommandPayload::PushPackage { .. } => None,
        }
    }

    /// Builds the OpAMP frame that delivers this command.
    pub fn to_server_to_agent(&self) -> ServerToAgent {
        let mut frame = ServerToAgent {
            instance_uid: self.target_instance_uid.into_bytes(),
            capabilities: crate::server::SERVER_CAPABILITIES,
            ..Default::default()
        };
        match &self.payload {
            CommandPayload::UpdateAgentConfig { config } => {
                frame.remote_config = Some(AgentRemoteConfig {
                    config: Some(config.to_proto()),
                    config_hash: config.hash(),
                });
            }
            CommandPayload::PushPackage {
                name,
                version,
                download_url,
                content_hash,
            } => {
                let mut packages = HashMap::new();
                packages.insert(
                    name.clone(),
                    PackageAvailable {
                        r#type: PackageType::TopLevel as i32,
                        version: version.clone(),
                        file: Some(DownloadableFile {
                            download_url: download_url.clone(),
                            content_hash: content_hash.clone(),
                            signature: Vec::new(),
                        }),
                        hash: content_hash.clone(),
                    },
                );
                frame.packages_available = Some(PackagesAvailable {
                    packages,
                    all_packages_hash: content_hash.clone(),
                });
            }
        }
        frame
    }
}
