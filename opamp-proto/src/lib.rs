//! # OpAMP protocol buffer message types
//!
//! Message definitions mirroring the Open Agent Management Protocol schema
//! (`opamp.proto`). Field numbers and enum values are wire constants and must
//! not change; the agent population in the field depends on them.
//!
//! Only the protocol subset spoken by the commander is defined here. Messages
//! this server never reads or writes (connection settings offers, custom
//! capabilities) are omitted; unknown fields are skipped by prost on decode,
//! so frames from newer agents still parse.

pub mod proto;
