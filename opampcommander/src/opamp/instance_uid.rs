use serde::{Deserialize, Serialize, Serializer};
use std::fmt::{Debug, Display};
use thiserror::Error;
use uuid::Uuid;

/// Stable 128-bit identifier an agent uses to identify itself across
/// reconnects. On the wire it travels as the 16 raw bytes of
/// `AgentToServer.instance_uid`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct InstanceUid(Uuid);

#[derive(Error, Debug, PartialEq)]
pub enum InstanceUidError {
    #[error("instance uid must be 16 bytes, got {0}")]
    InvalidLength(usize),
    #[error("instance uid is not a valid uuid: {0}")]
    InvalidFormat(String),
}

impl InstanceUid {
    /// Creates a new random instance uid. Used when the server re-identifies
    /// an agent, never for agents that already carry one.
    pub fn create() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }
}

impl TryFrom<&[u8]> for InstanceUid {
    type Error = InstanceUidError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let uuid =
            Uuid::from_slice(value).map_err(|_| InstanceUidError::InvalidLength(value.len()))?;
        Ok(Self(uuid))
    }
}

impl TryFrom<&str> for InstanceUid {
    type Error = InstanceUidError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let uuid =
            Uuid::parse_str(value).map_err(|err| InstanceUidError::InvalidFormat(err.to_string()))?;
        Ok(Self(uuid))
    }
}

impl From<Uuid> for InstanceUid {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<InstanceUid> for Uuid {
    fn from(value: InstanceUid) -> Self {
        value.0
    }
}

impl Display for InstanceUid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// Use the uuid string representation when serializing
impl Serialize for InstanceUid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for InstanceUid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string_value = String::deserialize(deserializer)?;
        InstanceUid::try_from(string_value.as_str()).map_err(serde::de::Error::custom)
    }
}
