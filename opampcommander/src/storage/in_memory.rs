//! In-memory persistence driver for standalone deployments and tests.
//! Linearizable per key by construction; listings are ordered by key so
//! cursor pagination is stable.

use super::{
    AgentRepository, AttributeQuery, CommandRepository, Page, ServerRepository, StorageError,
};
use crate::agent::Agent;
use crate::command::{Command, CommandId, CommandState};
use crate::opamp::instance_uid::InstanceUid;
use crate::server::record::{ServerId, ServerRecord};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryStore {
    agents: RwLock<BTreeMap<InstanceUid, Agent>>,
    servers: RwLock<HashMap<ServerId, ServerRecord>>,
    commands: RwLock<HashMap<CommandId, Command>>,
    commands_by_agent: RwLock<HashMap<InstanceUid, Vec<CommandId>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRepository for InMemoryStore {
    async fn upsert(&self, agent: Agent) -> Result<(), StorageError> {
        let mut agents = self.agents.write().expect("agents lock poisoned");
        agents.insert(agent.instance_uid, agent);
        Ok(())
    }

    async fn get(&self, instance_uid: &InstanceUid) -> Result<Option<Agent>, StorageError> {
        let agents = self.agents.read().expect("agents lock poisoned");
        Ok(agents.get(instance_uid).cloned())
    }

    async fn list(
        &self,
        limit: usize,
        continue_token: Option<String>,
    ) -> Result<Page<Agent>, StorageError> {
        let agents = self.agents.read().expect("agents lock poisoned");
        let after = match &continue_token {
            Some(token) => Some(
                InstanceUid::try_from(token.as_str())
                    .map_err(|err| StorageError::Conflict(err.to_string()))?,
            ),
            None => None,
        };

        let items: Vec<Agent> = agents
            .values()
            .filter(|agent| after.map_or(true, |last| agent.instance_uid > last))
            .take(limit)
            .cloned()
            .collect();

        let continue_token = if items.len() == limit && limit > 0 {
            items.last().map(|agent| agent.instance_uid.to_string())
        } else {
            None
        };
        Ok(Page {
            items,
            continue_token,
        })
    }

    async fn search_by_attributes(
        &self,
        query: &AttributeQuery,
    ) -> Result<Vec<Agent>, StorageError> {
        let agents = self.agents.read().expect("agents lock poisoned");
        Ok(agents
            .values()
            .filter(|agent| !agent.is_deleted() && query.matches(agent))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ServerRepository for InMemoryStore {
    async fn upsert(&self, record: ServerRecord) -> Result<(), StorageError> {
        let mut servers = self.servers.write().expect("servers lock poisoned");
        servers.insert(record.server_id.clone(), record);
        Ok(())
    }

    async fn get(&self, server_id: &ServerId) -> Result<Option<ServerRecord>, StorageError> {
        let servers = self.servers.read().expect("servers lock poisoned");
        Ok(servers.get(server_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, StorageError> {
        let servers = self.servers.read().expect("servers lock poisoned");
        Ok(servers.values().cloned().collect())
    }

    async fn remove(&self, server_id: &ServerId) -> Result<(), StorageError> {
        let mut servers = self.servers.write().expect("servers lock poisoned");
        servers.remove(server_id);
        Ok(())
    }
}

#[async_trait]
impl CommandRepository for InMemoryStore {
    async fn insert(&self, command: Command) -> Result<bool, StorageError> {
        let mut commands = self.commands.write().expect("commands lock poisoned");
        if commands.contains_key(&command.id) {
            return Ok(false);
        }
        let mut index = self
            .commands_by_agent
            .write()
            .expect("command index lock poisoned");
        index
            .entry(command.target_instance_uid)
            .or_default()
            .push(command.id);
        commands.insert(command.id, command);
        Ok(true)
    }

    async fn get(&self, id: &CommandId) -> Result<Option<Command>, StorageError> {
        let commands = self.commands.read().expect("commands lock poisoned");
        Ok(commands.get(id).cloned())
    }

    async fn list_by_agent(
        &self,
        instance_uid: &InstanceUid,
    ) -> Result<Vec<Command>, StorageError> {
        let commands = self.commands.read().expect("commands lock poisoned");
        let index = self
            .commands_by_agent
            .read()
            .expect("command index lock poisoned");
        Ok(index
            .get(instance_uid)
            .into_iter()
            .flatten()
            .filter_map(|id| commands.get(id))
            .cloned()
            .collect())
    }

    async fn list_pending_by_agent(
        &self,
        instance_uid: &InstanceUid,
    ) -> Result<Vec<Command>, StorageError> {
        Ok(self
            .list_by_agent(instance_uid)
            .await?
            .into_iter()
            .filter(|command| command.state.is_pending())
            .collect())
    }

    async fn list_pending(&self) -> Result<Vec<Command>, StorageError> {
        let commands = self.commands.read().expect("commands lock poisoned");
        Ok(commands
            .values()
            .filter(|command| command.state.is_pending())
            .cloned()
            .collect())
    }

    async fn compare_and_set_state(
        &self,
        id: &CommandId,
        expected: &CommandState,
        next: CommandState,
    ) -> Result<bool, StorageError> {
        let mut commands = self.commands.write().expect("commands lock poisoned");
        let command = commands.get_mut(id).ok_or(StorageError::ResourceNotExist)?;
        if command.state != *expected {
            return Ok(false);
        }
        command.state = next;
        Ok(true)
    }

    async fn increment_delivery_attempts(&self, id: &CommandId) -> Result<(), StorageError> {
        let mut commands = self.commands.write().expect("commands lock poisoned");
        let command = commands.get_mut(id).ok_or(StorageError::ResourceNotExist)?;
        command.delivery_attempts += 1;
        Ok(())
    }
}
