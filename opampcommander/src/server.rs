//! Replica identity: who this process is, and which peers are alive.

pub mod identity;
pub mod record;

pub use record::{ServerId, ServerRecord};

use opamp_proto::proto::ServerCapabilities;

/// Capability bits every replica advertises in ServerToAgent frames.
pub const SERVER_CAPABILITIES: u64 = ServerCapabilities::AcceptsStatus as u64
    | ServerCapabilities::OffersRemoteConfig as u64
    | ServerCapabilities::AcceptsEffectiveConfig as u64
    | ServerCapabilities::OffersPackages as u64
    | ServerCapabilities::AcceptsPackagesStatus as u64;
