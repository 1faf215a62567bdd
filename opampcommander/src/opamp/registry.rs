//! Process-local map of live connections. Sessions are owned by the primary
//! map; the agent index refers to them by connection id only, so removal is
//! atomic over both maps and a stale index entry cannot dangle.

use super::instance_uid::InstanceUid;
use super::session::{CloseReason, SessionHandle};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct Maps {
    by_conn: HashMap<Uuid, Arc<SessionHandle>>,
    by_agent: HashMap<InstanceUid, Uuid>,
}

/// Critical sections here are map operations only; session close of a
/// displaced connection happens after the lock is dropped.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Maps>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly upgraded connection, not yet bound to an agent.
    pub fn register(&self, session: Arc<SessionHandle>) {
        let mut maps = self.inner.write().expect("registry lock poisoned");
        maps.by_conn.insert(session.connection_id(), session);
    }

    /// Binds an agent to a connection. Idempotent; when the agent was bound
    /// to another live connection, the new one wins and the displaced
    /// session is closed. Any other policy would leave a re-connecting agent
    /// unable to recover after a partition.
    pub fn bind(&self, connection_id: Uuid, instance_uid: InstanceUid) {
        let displaced = {
            let mut maps = self.inner.write().expect("registry lock poisoned");
            if !maps.by_conn.contains_key(&connection_id) {
                warn!(%connection_id, "bind for an unregistered connection, ignoring");
                return;
            }
            match maps.by_agent.insert(instance_uid, connection_id) {
                Some(previous) if previous != connection_id => {
                    maps.by_conn.get(&previous).cloned()
                }
                _ => None,
            }
        };
        if let Some(old_session) = displaced {
            debug!(
                instance_uid = %instance_uid,
                old_connection_id = %old_session.connection_id(),
                new_connection_id = %connection_id,
                "displacing superseded connection"
            );
            old_session.close(CloseReason::SupersededConnection);
        }
    }

    /// Removes a connection and, if it still owns its agent binding, the
    /// index entry with it. A displaced connection no longer owns the
    /// binding, so removing it leaves the winner untouched.
    pub fn remove(&self, connection_id: Uuid) -> Option<Arc<SessionHandle>> {
        let mut maps = self.inner.write().expect("registry lock poisoned");
        let session = maps.by_conn.remove(&connection_id)?;
        if let Some(instance_uid) = session.bound_instance_uid() {
            if maps.by_agent.get(&instance_uid) == Some(&connection_id) {
                maps.by_agent.remove(&instance_uid);
            }
        }
        Some(session)
    }

    pub fn lookup_by_conn(&self, connection_id: Uuid) -> Option<Arc<SessionHandle>> {
        let maps = self.inner.read().expect("registry lock poisoned");
        maps.by_conn.get(&connection_id).cloned()
    }

    pub fn lookup_by_agent(&self, instance_uid: &InstanceUid) -> Option<Arc<SessionHandle>> {
        let maps = self.inner.read().expect("registry lock poisoned");
        let connection_id = maps.by_agent.get(instance_uid)?;
        maps.by_conn.get(connection_id).cloned()
    }

    /// Snapshot of the locally bound agents, for the reconciliation sweep.
    pub fn bound_agents(&self) -> Vec<InstanceUid> {
        let maps = self.inner.read().expect("registry lock poisoned");
        maps.by_agent.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        let maps = self.inner.read().expect("registry lock poisoned");
        maps.by_conn.len()
    }
}
