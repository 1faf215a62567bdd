use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

/// Identity of one control-plane replica. Configured, unique per process.
#[derive(Debug, PartialEq, Eq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ServerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Persisted liveness record of one replica. Written by the replica that owns
/// it, read by every replica to decide where commands can be routed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: ServerId,
    /// Wall-clock instant the replica process started.
    pub boot_epoch: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Bitmask of the ServerCapabilities this replica advertises to agents.
    pub capabilities: u64,
    /// Liveness window. A record older than this is dead to its peers.
    pub ttl: Duration,
}

impl ServerRecord {
    /// A replica is live iff its record exists and the last heartbeat is
    /// within the TTL window.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now.signed_duration_since(self.last_heartbeat) <= ttl,
            Err(_) => false,
        }
    }
}
