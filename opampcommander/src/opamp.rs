//! The OpAMP-facing edge of the server: binary frame codec, per-connection
//! sessions, the process-local connection registry and the WebSocket
//! endpoint.

pub mod endpoint;
pub mod frame;
pub mod instance_uid;
pub mod registry;
pub mod session;
