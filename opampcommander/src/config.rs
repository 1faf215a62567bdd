//! Typed configuration. Loaded from an optional YAML file with
//! `OPAMPCOMMANDER_`-prefixed environment overrides layered on top.

use crate::opamp::session::{DEFAULT_INIT_TIMEOUT, DEFAULT_OUT_QUEUE_CAP, SessionConfig};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "OPAMPCOMMANDER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventProtocol {
    Kafka,
    Nats,
    #[default]
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "opampcommander-events".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    pub endpoint: String,
    pub subject_prefix: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            endpoint: "nats://localhost:4222".to_string(),
            subject_prefix: "opampcommander".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommanderConfig {
    /// This replica's identity. Must be unique per process in the fleet.
    pub server_id: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub event_protocol: EventProtocol,

    #[serde(default)]
    pub kafka: KafkaConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(
        default = "default_heartbeat_period",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub heartbeat_period: Duration,

    #[serde(
        default = "default_reconcile_period",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub reconcile_period: Duration,

    #[serde(
        default = "default_init_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub init_timeout: Duration,

    #[serde(
        default = "default_send_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub send_timeout: Duration,

    #[serde(
        default = "default_store_timeout",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub store_timeout: Duration,

    #[serde(
        default = "default_shutdown_grace",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub shutdown_grace: Duration,

    #[serde(
        default = "default_command_ttl",
        deserialize_with = "duration_str::deserialize_duration"
    )]
    pub command_ttl: Duration,

    #[serde(default = "default_out_queue_cap")]
    pub out_queue_cap: usize,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_listen_address() -> String {
    "0.0.0.0:4320".to_string()
}

fn default_heartbeat_period() -> Duration {
    Duration::from_secs(10)
}

fn default_reconcile_period() -> Duration {
    Duration::from_secs(15)
}

fn default_init_timeout() -> Duration {
    DEFAULT_INIT_TIMEOUT
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_command_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_out_queue_cap() -> usize {
    DEFAULT_OUT_QUEUE_CAP
}

impl CommanderConfig {
    /// Loads configuration from the given file (if any) and the
    /// environment. Environment keys use `__` as section separator, e.g.
    /// `OPAMPCOMMANDER_NATS__ENDPOINT`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));
        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::Invalid("server_id must not be empty".to_string()));
        }
        if self.out_queue_cap == 0 {
            return Err(ConfigError::Invalid(
                "out_queue_cap must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_period.is_zero() || self.reconcile_period.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_period and reconcile_period must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            init_timeout: self.init_timeout,
            out_queue_cap: self.out_queue_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config("server_id: replica-1\n");
        let config = CommanderConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.server_id, "replica-1");
        assert_eq!(config.event_protocol, EventProtocol::InMemory);
        assert_eq!(config.listen_address, "0.0.0.0:4320");
        assert_eq!(config.heartbeat_period, Duration::from_secs(10));
        assert_eq!(config.reconcile_period, Duration::from_secs(15));
        assert_eq!(config.init_timeout, Duration::from_secs(30));
        assert_eq!(config.out_queue_cap, 64);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_full_config_overrides() {
        let file = write_config(
            r#"
server_id: replica-2
listen_address: "127.0.0.1:9000"
event_protocol: nats
nats:
  endpoint: "nats://bus:4222"
  subject_prefix: "fleet"
heartbeat_period: 5s
reconcile_period: 30s
init_timeout: 10s
command_ttl: 1m
out_queue_cap: 2
log:
  level: debug
"#,
        );
        let config = CommanderConfig::load(Some(file.path())).unwrap();

        assert_eq!(config.event_protocol, EventProtocol::Nats);
        assert_eq!(config.nats.endpoint, "nats://bus:4222");
        assert_eq!(config.nats.subject_prefix, "fleet");
        assert_eq!(config.heartbeat_period, Duration::from_secs(5));
        assert_eq!(config.command_ttl, Duration::from_secs(60));
        assert_eq!(config.out_queue_cap, 2);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_kafka_protocol_config() {
        let file = write_config(
            r#"
server_id: replica-3
event_protocol: kafka
kafka:
  brokers: "k1:9092,k2:9092"
  topic: "commander"
"#,
        );
        let config = CommanderConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.event_protocol, EventProtocol::Kafka);
        assert_eq!(config.kafka.brokers, "k1:9092,k2:9092");
        assert_eq!(config.kafka.topic, "commander");
    }

    #[test]
    fn test_missing_server_id_is_an_error() {
        let file = write_config("listen_address: \"127.0.0.1:9000\"\n");
        assert!(CommanderConfig::load(Some(file.path())).is_err());
    }

    #[test]
    fn test_empty_server_id_is_rejected() {
        let file = write_config("server_id: \"  \"\n");
        assert!(matches!(
            CommanderConfig::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_queue_cap_is_rejected() {
        let file = write_config("server_id: r\nout_queue_cap: 0\n");
        assert!(matches!(
            CommanderConfig::load(Some(file.path())),
            Err(ConfigError::Invalid(_))
        ));
    }
}
