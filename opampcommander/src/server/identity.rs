use super::record::{ServerId, ServerRecord};
use crate::storage::{ServerRepository, StorageError};
use crate::utils::time::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A replica is expired once this many heartbeat periods pass without a
/// refresh.
const TTL_HEARTBEATS: u32 = 3;

/// Owns this replica's liveness record: writes it on start, refreshes it on a
/// period, tombstones it on clean shutdown, and answers who else is alive.
/// In crash scenarios peers detect the loss purely through TTL expiry.
pub struct ServerIdentityService {
    server_id: ServerId,
    heartbeat_period: Duration,
    repository: Arc<dyn ServerRepository>,
    clock: Arc<dyn Clock>,
    boot_epoch: chrono::DateTime<chrono::Utc>,
}

impl ServerIdentityService {
    pub fn new(
        server_id: ServerId,
        heartbeat_period: Duration,
        repository: Arc<dyn ServerRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let boot_epoch = clock.now();
        Self {
            server_id,
            heartbeat_period,
            repository,
            clock,
            boot_epoch,
        }
    }

    pub fn self_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn boot_epoch(&self) -> chrono::DateTime<chrono::Utc> {
        self.boot_epoch
    }

    fn record_now(&self) -> ServerRecord {
        ServerRecord {
            server_id: self.server_id.clone(),
            boot_epoch: self.boot_epoch,
            last_heartbeat: self.clock.now(),
            capabilities: super::SERVER_CAPABILITIES,
            ttl: self.heartbeat_period * TTL_HEARTBEATS,
        }
    }

    /// Writes the initial record. A failure here means persistence is
    /// unreachable and the process must not come up.
    pub async fn start(&self) -> Result<(), StorageError> {
        self.repository.upsert(self.record_now()).await?;
        info!(server_id = %self.server_id, "registered replica identity");
        Ok(())
    }

    /// Heartbeat loop. Refresh failures are logged and retried on the next
    /// tick; peers tolerate up to `TTL_HEARTBEATS - 1` missed beats.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and start() already wrote.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.repository.upsert(self.record_now()).await {
                        warn!(error_msg = %err, "failed to refresh replica heartbeat");
                    } else {
                        debug!(server_id = %self.server_id, "heartbeat refreshed");
                    }
                }
            }
        }
        self.stop().await;
    }

    /// Best-effort tombstone so peers stop routing here immediately instead
    /// of waiting out the TTL.
    pub async fn stop(&self) {
        if let Err(err) = self.repository.remove(&self.server_id).await {
            warn!(error_msg = %err, "failed to tombstone replica record");
        } else {
            info!(server_id = %self.server_id, "replica record tombstoned");
        }
    }

    /// Live peers, excluding this replica.
    pub async fn peers(&self) -> Result<Vec<ServerRecord>, StorageError> {
        let now = self.clock.now();
        Ok(self
            .repository
            .list()
            .await?
            .into_iter()
            .filter(|record| record.server_id != self.server_id && record.is_live(now))
            .collect())
    }

    /// Whether `server_id` currently holds a live record. The local replica
    /// is always live to itself.
    pub async fn is_live(&self, server_id: &ServerId) -> Result<bool, StorageError> {
        if *server_id == self.server_id {
            return Ok(true);
        }
        let now = self.clock.now();
        Ok(self
            .repository
            .get(server_id)
            .await?
            .map(|record| record.is_live(now))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::in_memory::InMemoryStore;
    use crate::utils::time::tests::FixedClock;
    use chrono::Utc;

    fn service(
        id: &str,
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
    ) -> ServerIdentityService {
        ServerIdentityService::new(
            ServerId::from(id),
            Duration::from_secs(10),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn test_start_registers_record() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let identity = service("s1", store.clone(), clock);
        identity.start().await.unwrap();

        let record = ServerRepository::get(store.as_ref(), &ServerId::from("s1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.ttl, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_peers_excludes_self_and_dead() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));

        let s1 = service("s1", store.clone(), clock.clone());
        let s2 = service("s2", store.clone(), clock.clone());
        let s3 = service("s3", store.clone(), clock.clone());
        s1.start().await.unwrap();
        s2.start().await.unwrap();
        s3.start().await.unwrap();

        let peers = s1.peers().await.unwrap();
        assert_eq!(peers.len(), 2);

        // s3 stops heartbeating; after 3 periods it is dead to s1.
        clock.advance(chrono::Duration::seconds(31));
        s2.repository.upsert(s2.record_now()).await.unwrap();
        let peers = s1.peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].server_id, ServerId::from("s2"));
    }

    #[tokio::test]
    async fn test_is_live() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let s1 = service("s1", store.clone(), clock.clone());
        let s2 = service("s2", store.clone(), clock.clone());
        s1.start().await.unwrap();
        s2.start().await.unwrap();

        assert!(s1.is_live(&ServerId::from("s1")).await.unwrap());
        assert!(s1.is_live(&ServerId::from("s2")).await.unwrap());
        assert!(!s1.is_live(&ServerId::from("missing")).await.unwrap());

        clock.advance(chrono::Duration::seconds(31));
        assert!(!s1.is_live(&ServerId::from("s2")).await.unwrap());
        // A replica is always live to itself, regardless of its record age.
        assert!(s1.is_live(&ServerId::from("s1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_tombstones_record() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let identity = service("s1", store.clone(), clock);
        identity.start().await.unwrap();
        identity.stop().await;

        assert_eq!(
            ServerRepository::get(store.as_ref(), &ServerId::from("s1"))
                .await
                .unwrap(),
            None
        );
    }
}
