//! Persistence ports.
//!
//! The concrete driver is a deployment decision; the core programs against
//! these traits and assumes per-key linearizability, nothing more. Four
//! collections exist: agents by instance uid, servers by server id, commands
//! by command id, and a command-by-agent secondary index.

pub mod in_memory;

use crate::agent::Agent;
use crate::command::{Command, CommandId, CommandState};
use crate::opamp::instance_uid::InstanceUid;
use crate::server::record::{ServerId, ServerRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("resource does not exist")]
    ResourceNotExist,

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// One page of a cursor listing. `continue_token` is opaque to callers and
/// absent on the last page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub continue_token: Option<String>,
}

/// Equality query over agent attributes; every entry must match either an
/// identifying or a non-identifying attribute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeQuery(pub BTreeMap<String, String>);

impl AttributeQuery {
    pub fn matches(&self, agent: &Agent) -> bool {
        self.0.iter().all(|(key, value)| {
            agent.identifying_attributes.get(key) == Some(value)
                || agent.non_identifying_attributes.get(key) == Some(value)
        })
    }
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn upsert(&self, agent: Agent) -> Result<(), StorageError>;

    async fn get(&self, instance_uid: &InstanceUid) -> Result<Option<Agent>, StorageError>;

    async fn list(
        &self,
        limit: usize,
        continue_token: Option<String>,
    ) -> Result<Page<Agent>, StorageError>;

    async fn search_by_attributes(
        &self,
        query: &AttributeQuery,
    ) -> Result<Vec<Agent>, StorageError>;
}

#[async_trait]
pub trait ServerRepository: Send + Sync {
    async fn upsert(&self, record: ServerRecord) -> Result<(), StorageError>;

    async fn get(&self, server_id: &ServerId) -> Result<Option<ServerRecord>, StorageError>;

    async fn list(&self) -> Result<Vec<ServerRecord>, StorageError>;

    /// Tombstone write on clean shutdown; missing records are not an error.
    async fn remove(&self, server_id: &ServerId) -> Result<(), StorageError>;
}

#[async_trait]
pub trait CommandRepository: Send + Sync {
    /// Inserts a command; returns false (and writes nothing) when the id is
    /// already present, making operator replays idempotent.
    async fn insert(&self, command: Command) -> Result<bool, StorageError>;

    async fn get(&self, id: &CommandId) -> Result<Option<Command>, StorageError>;

    async fn list_by_agent(
        &self,
        instance_uid: &InstanceUid,
    ) -> Result<Vec<Command>, StorageError>;

    async fn list_pending_by_agent(
        &self,
        instance_uid: &InstanceUid,
    ) -> Result<Vec<Command>, StorageError>;

    async fn list_pending(&self) -> Result<Vec<Command>, StorageError>;

    /// Atomically replaces the state iff the current state equals `expected`.
    /// Returns whether the swap happened. This is the only way state moves,
    /// which keeps the machine monotonic under concurrent replicas.
    async fn compare_and_set_state(
        &self,
        id: &CommandId,
        expected: &CommandState,
        next: CommandState,
    ) -> Result<bool, StorageError>;

    async fn increment_delivery_attempts(&self, id: &CommandId) -> Result<(), StorageError>;
}
