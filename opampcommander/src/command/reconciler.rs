//! The eventual-consistency backstop. Whatever the bus or the queues lost,
//! a periodic sweep over the locally bound agents re-enqueues pending
//! commands their agents have not converged to, and retires commands that
//! outlived their TTL.

use super::{Command, CommandState};
use crate::opamp::registry::ConnectionRegistry;
use crate::opamp::session::EnqueueResult;
use crate::storage::{AgentRepository, CommandRepository, StorageError};
use crate::utils::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RECONCILE_PERIOD: Duration = Duration::from_secs(15);

pub struct Reconciler {
    registry: Arc<ConnectionRegistry>,
    agents: Arc<dyn AgentRepository>,
    commands: Arc<dyn CommandRepository>,
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        agents: Arc<dyn AgentRepository>,
        commands: Arc<dyn CommandRepository>,
        clock: Arc<dyn Clock>,
        period: Duration,
    ) -> Self {
        Self {
            registry,
            agents,
            commands,
            clock,
            period,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        info!(period_secs = self.period.as_secs(), "reconciliation loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.sweep().await {
                        // Storage hiccups are retried on the next period.
                        warn!(error_msg = %err, "reconciliation sweep failed");
                    }
                }
            }
        }
        info!("reconciliation loop stopped");
    }

    /// One pass: expire overdue commands, then re-deliver to locally bound
    /// agents that still diverge from what a pending command wants.
    pub async fn sweep(&self) -> Result<(), StorageError> {
        let now = self.clock.now();

        for command in self.commands.list_pending().await? {
            if command.is_expired(now) {
                let expired = self
                    .commands
                    .compare_and_set_state(&command.id, &CommandState::Pending, CommandState::Expired)
                    .await?;
                if expired {
                    info!(command_id = %command.id, "command expired");
                }
            }
        }

        for instance_uid in self.registry.bound_agents() {
            let Some(session) = self.registry.lookup_by_agent(&instance_uid) else {
                continue;
            };
            let Some(agent) = self.agents.get(&instance_uid).await? else {
                continue;
            };
            for command in self.commands.list_pending_by_agent(&instance_uid).await? {
                if command.is_expired(now) {
                    continue;
                }
                if !self.needs_delivery(&agent, &command) {
                    continue;
                }
                match session.enqueue(command.to_server_to_agent()) {
                    EnqueueResult::Accepted => {
                        self.commands.increment_delivery_attempts(&command.id).await?;
                        debug!(
                            command_id = %command.id,
                            %instance_uid,
                            attempts = command.delivery_attempts + 1,
                            "command re-enqueued by reconciliation"
                        );
                    }
                    EnqueueResult::QueueFull => {
                        // Try again next period; enqueueing more would only
                        // stack duplicates behind the full queue.
                        debug!(%instance_uid, "queue still full, retrying next period");
                        break;
                    }
                    EnqueueResult::Closed => break,
                }
            }
        }
        Ok(())
    }

    /// A config command needs delivery while the agent's reported effective
    /// config differs from the desired one. A package push needs delivery
    /// until it is acknowledged; agents deduplicate offers by hash.
    fn needs_delivery(&self, agent: &crate::agent::Agent, command: &Command) -> bool {
        match command.desired_config_hash() {
            Some(desired) => agent.effective_config_hash() != Some(desired.as_slice()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::config::yaml_config;
    use crate::agent::{Agent, EffectiveConfig};
    use crate::command::{CommandId, CommandPayload};
    use crate::opamp::instance_uid::InstanceUid;
    use crate::opamp::session::SessionHandle;
    use crate::storage::in_memory::InMemoryStore;
    use crate::utils::time::tests::FixedClock;
    use chrono::Utc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn uid() -> InstanceUid {
        InstanceUid::try_from("11111111-1111-1111-1111-111111111111").unwrap()
    }

    fn command(ttl_secs: u64) -> Command {
        Command::new(
            CommandId::create(),
            uid(),
            CommandPayload::UpdateAgentConfig {
                config: yaml_config("collector.yaml", "key: v1"),
            },
            "operator",
            Utc::now(),
            Duration::from_secs(ttl_secs),
        )
    }

    struct Fixture {
        reconciler: Reconciler,
        registry: Arc<ConnectionRegistry>,
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let reconciler = Reconciler::new(
            registry.clone(),
            store.clone(),
            store.clone(),
            clock.clone(),
            DEFAULT_RECONCILE_PERIOD,
        );
        Fixture {
            reconciler,
            registry,
            store,
            clock,
        }
    }

    fn bind_local(
        fixture: &Fixture,
        cap: usize,
    ) -> tokio::sync::mpsc::Receiver<opamp_proto::proto::ServerToAgent> {
        let (handle, mailbox) = SessionHandle::new(Uuid::new_v4(), cap, CancellationToken::new());
        fixture.registry.register(handle.clone());
        handle.set_bound(uid());
        fixture.registry.bind(handle.connection_id(), uid());
        mailbox
    }

    #[tokio::test]
    async fn test_sweep_redelivers_diverged_agent() {
        let fixture = fixture();
        let mut mailbox = bind_local(&fixture, 4);
        fixture.store.upsert(Agent::new(uid(), Utc::now())).await.unwrap();
        let cmd = command(600);
        fixture.store.insert(cmd.clone()).await.unwrap();

        fixture.reconciler.sweep().await.unwrap();

        assert!(mailbox.try_recv().unwrap().remote_config.is_some());
        let stored = CommandRepository::get(fixture.store.as_ref(), &cmd.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.delivery_attempts, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_converged_agent() {
        let fixture = fixture();
        let mut mailbox = bind_local(&fixture, 4);
        let cmd = command(600);

        let desired = yaml_config("collector.yaml", "key: v1");
        let mut agent = Agent::new(uid(), Utc::now());
        agent.effective_config = Some(EffectiveConfig {
            hash: desired.hash(),
            config: desired,
        });
        fixture.store.upsert(agent).await.unwrap();
        fixture.store.insert(cmd).await.unwrap();

        fixture.reconciler.sweep().await.unwrap();
        assert!(mailbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sweep_expires_overdue_commands() {
        let fixture = fixture();
        let cmd = command(60);
        fixture.store.insert(cmd.clone()).await.unwrap();

        fixture.clock.advance(chrono::Duration::seconds(61));
        fixture.reconciler.sweep().await.unwrap();

        let stored = CommandRepository::get(fixture.store.as_ref(), &cmd.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, CommandState::Expired);
    }

    #[tokio::test]
    async fn test_sweep_ignores_unbound_agents() {
        let fixture = fixture();
        fixture.store.upsert(Agent::new(uid(), Utc::now())).await.unwrap();
        let cmd = command(600);
        fixture.store.insert(cmd.clone()).await.unwrap();

        fixture.reconciler.sweep().await.unwrap();

        let stored = CommandRepository::get(fixture.store.as_ref(), &cmd.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.delivery_attempts, 0);
        assert_eq!(stored.state, CommandState::Pending);
    }

    #[tokio::test]
    async fn test_sweep_drains_after_queue_full() {
        // Queue capacity 2, three commands: the third was deferred at
        // dispatch time and must be delivered by a later sweep once the
        // mailbox has room again.
        let fixture = fixture();
        let mut mailbox = bind_local(&fixture, 2);
        fixture.store.upsert(Agent::new(uid(), Utc::now())).await.unwrap();
        for _ in 0..3 {
            fixture.store.insert(command(600)).await.unwrap();
        }

        fixture.reconciler.sweep().await.unwrap();
        // Two fit, the third hit QueueFull.
        assert!(mailbox.try_recv().is_ok());
        assert!(mailbox.try_recv().is_ok());
        assert!(mailbox.try_recv().is_err());

        fixture.reconciler.sweep().await.unwrap();
        assert!(mailbox.try_recv().is_ok());
    }
}
