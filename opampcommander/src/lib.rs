//! # OpAMP Commander library
//!
//! Control plane for an OpAMP agent fleet. This library holds the whole
//! core: the OpAMP edge (frame codec, sessions, registry, WebSocket
//! endpoint), the agent and command domain, replica identity, the
//! cross-replica event bus, and the reconciliation loop. The binary in this
//! crate assembles the pieces; API surfaces beyond the OpAMP endpoint are
//! expected to consume this library.

pub mod agent;
pub mod command;
pub mod config;
pub mod eventbus;
pub mod logging;
pub mod opamp;
pub mod run;
pub mod server;
pub mod storage;
pub mod utils;
