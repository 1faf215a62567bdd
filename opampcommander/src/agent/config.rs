use opamp_proto::proto::{AgentConfigFile, AgentConfigMap};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// One named configuration file inside a config map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// An ordered agent configuration map. Both the configuration an operator
/// wants an agent to run and the configuration the agent reports it is
/// running are expressed as this type, so their hashes are comparable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfigMap(BTreeMap<String, ConfigFile>);

impl ConfigMap {
    pub fn insert(&mut self, name: impl Into<String>, file: ConfigFile) {
        self.0.insert(name.into(), file);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigFile)> {
        self.0.iter()
    }

    /// SHA-256 over the canonical encoding of the map: entries in key order,
    /// fields separated by a NUL byte. This is the hash carried in
    /// `AgentRemoteConfig.config_hash` and compared against reported
    /// effective configs, so the encoding is a frozen wire detail.
    pub fn hash(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for (name, file) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(&file.body);
            hasher.update([0u8]);
            hasher.update(file.content_type.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().to_vec()
    }

    pub fn from_proto(proto: &AgentConfigMap) -> Self {
        Self(
            proto
                .config_map
                .iter()
                .map(|(name, file)| {
                    (
                        name.clone(),
                        ConfigFile {
                            body: file.body.clone(),
                            content_type: file.content_type.clone(),
                        },
                    )
                })
                .collect(),
        )
    }

    pub fn to_proto(&self) -> AgentConfigMap {
        AgentConfigMap {
            config_map: self
                .0
                .iter()
                .map(|(name, file)| {
                    (
                        name.clone(),
                        AgentConfigFile {
                            body: file.body.clone(),
                            content_type: file.content_type.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl<K: Into<String>> FromIterator<(K, ConfigFile)> for ConfigMap {
    fn from_iter<T: IntoIterator<Item = (K, ConfigFile)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Shorthand for single-file YAML configs, the common operator input.
pub fn yaml_config(name: &str, body: &str) -> ConfigMap {
    ConfigMap::from_iter([(
        name,
        ConfigFile {
            body: body.as_bytes().to_vec(),
            content_type: "text/yaml".to_string(),
        },
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_independent() {
        let a = ConfigMap::from_iter([
            (
                "a.yaml",
                ConfigFile {
                    body: b"one".to_vec(),
                    content_type: "text/yaml".to_string(),
                },
            ),
            (
                "b.yaml",
                ConfigFile {
                    body: b"two".to_vec(),
                    content_type: "text/yaml".to_string(),
                },
            ),
        ]);
        let b = ConfigMap::from_iter([
            (
                "b.yaml",
                ConfigFile {
                    body: b"two".to_vec(),
                    content_type: "text/yaml".to_string(),
                },
            ),
            (
                "a.yaml",
                ConfigFile {
                    body: b"one".to_vec(),
                    content_type: "text/yaml".to_string(),
                },
            ),
        ]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_hash_depends_on_content() {
        let a = yaml_config("collector.yaml", "key: v1");
        let b = yaml_config("collector.yaml", "key: v2");
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_proto_roundtrip() {
        let map = yaml_config("collector.yaml", "key: v1");
        assert_eq!(map, ConfigMap::from_proto(&map.to_proto()));
    }

    #[test]
    fn test_roundtrip_preserves_hash() {
        let map = yaml_config("collector.yaml", "key: v1");
        assert_eq!(map.hash(), ConfigMap::from_proto(&map.to_proto()).hash());
    }
}
