use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Static cluster topology shared by every node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "default_num_shards")]
    pub num_shards: u32,
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    /// Bootstrap API keys (key -> role). Wired into Auth by the service
    /// container at startup.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// Token-signing secret. Generated at startup when absent.
    #[serde(default)]
    pub auth_secret: Option<String>,
}

fn default_replication_factor() -> usize {
    2
}

fn default_num_shards() -> u32 {
    10
}

fn default_virtual_nodes() -> u32 {
    100
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub node_id: String,
}

impl Config {
    /// Load the cluster config from `CONFIG_PATH` (default `config.json`),
    /// selecting the local node via `NODE_ID`.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
        let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node_1".to_string());
        Self::load(&path, &node_id)
    }

    pub fn load(path: impl AsRef<Path>, node_id: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        let cluster: ClusterConfig =
            serde_json::from_str(&raw).context("failed to parse cluster config")?;
        Self::from_cluster(cluster, node_id)
    }

    pub fn from_cluster(cluster: ClusterConfig, node_id: &str) -> anyhow::Result<Self> {
        let config = Self {
            cluster,
            node_id: node_id.to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.cluster.nodes.is_empty() {
            anyhow::bail!("cluster config contains no nodes");
        }
        let mut seen = std::collections::HashSet::new();
        for node in &self.cluster.nodes {
            if !seen.insert(node.id.as_str()) {
                anyhow::bail!("duplicate node id {} in cluster config", node.id);
            }
        }
        if !seen.contains(self.node_id.as_str()) {
            anyhow::bail!("NODE_ID {} is not present in cluster config", self.node_id);
        }
        if self.cluster.num_shards == 0 {
            anyhow::bail!("num_shards must be positive");
        }
        if self.cluster.virtual_nodes == 0 {
            anyhow::bail!("virtual_nodes must be positive");
        }
        if self.cluster.replication_factor == 0
            || self.cluster.replication_factor > self.cluster.nodes.len()
        {
            anyhow::bail!(
                "replication_factor {} must be between 1 and the node count {}",
                self.cluster.replication_factor,
                self.cluster.nodes.len()
            );
        }
        Ok(())
    }

    pub fn local_node(&self) -> &NodeConfig {
        // Presence is checked in validate().
        self.cluster
            .nodes
            .iter()
            .find(|n| n.id == self.node_id)
            .expect("local node validated at startup")
    }

    /// All node ids in config order.
    pub fn node_ids(&self) -> Vec<String> {
        self.cluster.nodes.iter().map(|n| n.id.clone()).collect()
    }

    /// Every node except the local one, in config order.
    pub fn peers(&self) -> Vec<&NodeConfig> {
        self.cluster
            .nodes
            .iter()
            .filter(|n| n.id != self.node_id)
            .collect()
    }

    pub fn address_of(&self, node_id: &str) -> Option<String> {
        self.cluster
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .map(|n| n.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "nodes": [
                { "id": "node_1", "host": "127.0.0.1", "port": 5001 },
                { "id": "node_2", "host": "127.0.0.1", "port": 5002 },
                { "id": "node_3", "host": "127.0.0.1", "port": 5003 }
            ],
            "replication_factor": 2,
            "num_shards": 10,
            "virtual_nodes": 100
        }"#
    }

    #[test]
    fn parses_cluster_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample_json().as_bytes()).unwrap();

        let config = Config::load(file.path(), "node_2").unwrap();
        assert_eq!(config.node_id, "node_2");
        assert_eq!(config.cluster.nodes.len(), 3);
        assert_eq!(config.cluster.num_shards, 10);
        assert_eq!(config.local_node().port, 5002);
        assert_eq!(config.peers().len(), 2);
        assert_eq!(config.address_of("node_3").unwrap(), "127.0.0.1:5003");
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let cluster: ClusterConfig = serde_json::from_str(
            r#"{ "nodes": [ { "id": "solo", "host": "localhost", "port": 7000 } ],
                 "replication_factor": 1 }"#,
        )
        .unwrap();
        let config = Config::from_cluster(cluster, "solo").unwrap();
        assert_eq!(config.cluster.num_shards, 10);
        assert_eq!(config.cluster.virtual_nodes, 100);
        assert!(config.cluster.api_keys.is_empty());
    }

    #[test]
    fn rejects_unknown_node_id() {
        let cluster: ClusterConfig = serde_json::from_str(sample_json()).unwrap();
        assert!(Config::from_cluster(cluster, "node_9").is_err());
    }

    #[test]
    fn rejects_oversized_replication_factor() {
        let mut cluster: ClusterConfig = serde_json::from_str(sample_json()).unwrap();
        cluster.replication_factor = 5;
        assert!(Config::from_cluster(cluster, "node_1").is_err());
    }
}
