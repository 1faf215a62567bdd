//! The agent aggregate: one record per agent instance uid, mutated only by
//! merging successive `AgentToServer` reports.

pub mod attributes;
pub mod config;
pub mod usecase;

use crate::opamp::instance_uid::InstanceUid;
use crate::server::record::ServerId;
use chrono::{DateTime, Utc};
use self::config::ConfigMap;
use opamp_proto::proto::{AgentToServer, RemoteConfigStatuses};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MergeError {
    #[error("sequence regression: report carries {reported}, agent is at {current}")]
    SequenceRegression { reported: u64, current: u64 },
}

/// Latest known health of an agent, as it reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub healthy: bool,
    pub status: String,
    pub last_error: String,
    pub start_time_unix_nano: u64,
    pub status_time_unix_nano: u64,
}

/// Agent-side status of the last remote config offer it processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteConfigApplyStatus {
    Unset,
    Applying,
    Applied,
    Failed { error_message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfigState {
    /// Hash of the offer the status refers to, echoed from
    /// `AgentRemoteConfig.config_hash`.
    pub last_remote_config_hash: Vec<u8>,
    pub status: RemoteConfigApplyStatus,
}

/// Snapshot of the configuration the agent reports it is actually running.
/// The hash is computed server-side over the canonical encoding of the map,
/// so it is always consistent with the stored content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub hash: Vec<u8>,
    pub config: ConfigMap,
}

/// One agent instance as the control plane knows it. Created on the first
/// report carrying an unknown instance uid, updated by every later report,
/// never destroyed (soft-deleted through `deleted_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub instance_uid: InstanceUid,
    pub identifying_attributes: BTreeMap<String, String>,
    pub non_identifying_attributes: BTreeMap<String, String>,
    /// Bitmask of AgentCapabilities values.
    pub capabilities: u64,
    pub effective_config: Option<EffectiveConfig>,
    pub remote_config: Option<RemoteConfigState>,
    pub health: Option<AgentHealth>,
    pub last_communication_at: DateTime<Utc>,
    /// High-water mark of `AgentToServer.sequence_num`; reports below it are
    /// dropped.
    pub sequence_num: u64,
    /// Replica that held this agent's connection last, recorded in the same
    /// write that stores the report so routing never sees a half-bound agent.
    pub last_owner_server_id: Option<ServerId>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(instance_uid: InstanceUid, now: DateTime<Utc>) -> Self {
        Self {
            instance_uid,
            identifying_attributes: BTreeMap::new(),
            non_identifying_attributes: BTreeMap::new(),
            capabilities: 0,
            effective_config: None,
            remote_config: None,
            health: None,
            last_communication_at: now,
            sequence_num: 0,
            last_owner_server_id: None,
            deleted_at: None,
        }
    }

    /// Merges one report into the aggregate. Fields absent from the report
    /// keep their previous value (agents compress repeat reports by omitting
    /// unchanged fields). Reports older than the stored high-water mark are
    /// rejected; an equal sequence is accepted so redelivered frames stay
    /// idempotent.
    pub fn merge_report(
        &mut self,
        report: &AgentToServer,
        now: DateTime<Utc>,
        owner: &ServerId,
    ) -> Result<(), MergeError> {
        if report.sequence_num < self.sequence_num {
            return Err(MergeError::SequenceRegression {
                reported: report.sequence_num,
                current: self.sequence_num,
            });
        }

        if let Some(description) = &report.agent_description {
            self.identifying_attributes = attributes::flatten(&description.identifying_attributes);
            self.non_identifying_attributes =
                attributes::flatten(&description.non_identifying_attributes);
        }
        if report.capabilities != 0 {
            self.capabilities = report.capabilities;
        }
        if let Some(health) = &report.health {
            self.health = Some(AgentHealth {
                healthy: health.healthy,
                status: health.status.clone(),
                last_error: health.last_error.clone(),
                start_time_unix_nano: health.start_time_unix_nano,
                status_time_unix_nano: health.status_time_unix_nano,
            });
        }
        if let Some(effective) = &report.effective_config {
            let config = effective
                .config_map
                .as_ref()
                .map(ConfigMap::from_proto)
                .unwrap_or_default();
            self.effective_config = Some(EffectiveConfig {
                hash: config.hash(),
                config,
            });
        }
        if let Some(status) = &report.remote_config_status {
            let apply_status =
                match RemoteConfigStatuses::try_from(status.status).unwrap_or(RemoteConfigStatuses::Unset) {
                    RemoteConfigStatuses::Unset => RemoteConfigApplyStatus::Unset,
                    RemoteConfigStatuses::Applying => RemoteConfigApplyStatus::Applying,
                    RemoteConfigStatuses::Applied => RemoteConfigApplyStatus::Applied,
                    RemoteConfigStatuses::Failed => RemoteConfigApplyStatus::Failed {
                        error_message: status.error_message.clone(),
                    },
                };
            self.remote_config = Some(RemoteConfigState {
                last_remote_config_hash: status.last_remote_config_hash.clone(),
                status: apply_status,
            });
        }

        self.sequence_num = report.sequence_num.max(self.sequence_num);
        self.last_communication_at = now;
        self.last_owner_server_id = Some(owner.clone());
        Ok(())
    }

    /// Hash of the configuration the agent reports it is running, if any.
    pub fn effective_config_hash(&self) -> Option<&[u8]> {
        self.effective_config.as_ref().map(|c| c.hash.as_slice())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opamp_proto::proto::{
        AgentConfigFile, AgentConfigMap, AgentDescription, AnyValue, ComponentHealth,
        EffectiveConfig as ProtoEffectiveConfig, KeyValue, RemoteConfigStatus, any_value,
    };
    use std::collections::HashMap;

    fn uid() -> InstanceUid {
        InstanceUid::try_from("11111111-1111-1111-1111-111111111111").unwrap()
    }

    fn report(sequence_num: u64) -> AgentToServer {
        AgentToServer {
            instance_uid: uid().into_bytes(),
            sequence_num,
            agent_description: Some(AgentDescription {
                identifying_attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue(format!("otelcol-{sequence_num}"))),
                    }),
                }],
                non_identifying_attributes: vec![],
            }),
            capabilities: 3,
            health: Some(ComponentHealth {
                healthy: true,
                status: "running".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_overwrites_reported_fields() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);
        agent.merge_report(&report(1), now, &ServerId::from("s1")).unwrap();

        assert_eq!(agent.sequence_num, 1);
        assert_eq!(
            agent.identifying_attributes.get("service.name"),
            Some(&"otelcol-1".to_string())
        );
        assert_eq!(agent.capabilities, 3);
        assert!(agent.health.as_ref().unwrap().healthy);
        assert_eq!(agent.last_owner_server_id, Some(ServerId::from("s1")));
    }

    #[test]
    fn test_merge_keeps_absent_fields() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);
        agent.merge_report(&report(1), now, &ServerId::from("s1")).unwrap();

        // Compressed report: only the sequence number moves.
        let compressed = AgentToServer {
            instance_uid: uid().into_bytes(),
            sequence_num: 2,
            ..Default::default()
        };
        agent
            .merge_report(&compressed, now, &ServerId::from("s1"))
            .unwrap();

        assert_eq!(agent.sequence_num, 2);
        assert_eq!(
            agent.identifying_attributes.get("service.name"),
            Some(&"otelcol-1".to_string())
        );
        assert!(agent.health.is_some());
    }

    #[test]
    fn test_merge_rejects_sequence_regression() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);
        agent.merge_report(&report(5), now, &ServerId::from("s1")).unwrap();
        let before = agent.clone();

        let result = agent.merge_report(&report(3), now, &ServerId::from("s2"));
        assert_eq!(
            result,
            Err(MergeError::SequenceRegression {
                reported: 3,
                current: 5
            })
        );
        // The stored agent equals the state after the newer report alone.
        assert_eq!(agent, before);
    }

    #[test]
    fn test_merge_equal_sequence_is_idempotent() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);
        agent.merge_report(&report(4), now, &ServerId::from("s1")).unwrap();
        let before = agent.clone();
        agent.merge_report(&report(4), now, &ServerId::from("s1")).unwrap();
        assert_eq!(agent, before);
    }

    #[test]
    fn test_effective_config_hash_matches_content() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);

        let mut config_map = HashMap::new();
        config_map.insert(
            "collector.yaml".to_string(),
            AgentConfigFile {
                body: b"key: v1".to_vec(),
                content_type: "text/yaml".to_string(),
            },
        );
        let with_config = AgentToServer {
            instance_uid: uid().into_bytes(),
            sequence_num: 1,
            effective_config: Some(ProtoEffectiveConfig {
                config_map: Some(AgentConfigMap { config_map }),
            }),
            ..Default::default()
        };
        agent
            .merge_report(&with_config, now, &ServerId::from("s1"))
            .unwrap();

        let effective = agent.effective_config.as_ref().unwrap();
        assert_eq!(effective.hash, effective.config.hash());
    }

    #[test]
    fn test_remote_config_status_mapping() {
        let now = Utc::now();
        let mut agent = Agent::new(uid(), now);
        let mut with_status = report(1);
        with_status.remote_config_status = Some(RemoteConfigStatus {
            last_remote_config_hash: vec![0xAA],
            status: RemoteConfigStatuses::Failed as i32,
            error_message: "bad yaml".to_string(),
        });
        agent
            .merge_report(&with_status, now, &ServerId::from("s1"))
            .unwrap();

        assert_eq!(
            agent.remote_config,
            Some(RemoteConfigState {
                last_remote_config_hash: vec![0xAA],
                status: RemoteConfigApplyStatus::Failed {
                    error_message: "bad yaml".to_string()
                },
            })
        );
    }
}
