use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cluster::{
    AuthConfig, AuthManager, ConsensusConfig, ConsensusModule, HashRing, KvStore, NodeService,
    PeerClient, PeerRegistry, ReplicationConfig, Replicator, RpcTimeouts, ShardManager,
};
use crate::config::Config;

/// How often the failure detector probes each peer.
const FAILURE_DETECTOR_INTERVAL: Duration = Duration::from_secs(5);

/// Explicit service container: every core component is built here and handed
/// to the RPC layer. No process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub node: Arc<NodeService>,
    pub consensus: Arc<ConsensusModule>,
    pub auth: Arc<AuthManager>,
    pub registry: Arc<PeerRegistry>,
    pub ring: Arc<HashRing>,
    pub replicator: Arc<Replicator>,
    transport: Arc<PeerClient>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let node_id = config.node_id.clone();
        let node_ids = config.node_ids();
        let peer_ids: Vec<String> = node_ids
            .iter()
            .filter(|id| **id != node_id)
            .cloned()
            .collect();

        let registry = Arc::new(PeerRegistry::new(
            config.peers().iter().map(|n| (n.id.clone(), n.address())),
        ));
        let transport = Arc::new(PeerClient::new(
            config
                .cluster
                .nodes
                .iter()
                .map(|n| (n.id.clone(), n.address()))
                .collect(),
            RpcTimeouts::default(),
        ));

        let ring = Arc::new(HashRing::new(config.cluster.virtual_nodes));
        for id in &node_ids {
            ring.add_node(id).await;
        }

        let shards = Arc::new(ShardManager::new(&node_id, config.cluster.num_shards));
        shards.assign_initial(&node_ids).await;

        let store = Arc::new(KvStore::new());

        let auth = Arc::new(AuthManager::new(
            config.cluster.auth_secret.clone(),
            AuthConfig::default(),
        ));
        if config.cluster.api_keys.is_empty() {
            auth.add_api_key("demo-key", "admin").await;
        } else {
            for (key, role) in &config.cluster.api_keys {
                auth.add_api_key(key, role).await;
            }
        }

        let consensus = Arc::new(ConsensusModule::new(
            &node_id,
            peer_ids,
            transport.clone(),
            registry.clone(),
            ConsensusConfig::default(),
        ));

        let replicator = Arc::new(Replicator::new(
            &node_id,
            ring.clone(),
            registry.clone(),
            transport.clone(),
            ReplicationConfig {
                replication_factor: config.cluster.replication_factor,
                ..ReplicationConfig::default()
            },
        ));

        let node = Arc::new(NodeService::new(
            &node_id,
            auth.clone(),
            shards,
            store,
            consensus.clone(),
            replicator.clone(),
            registry.clone(),
        ));

        info!("Node {} initialized with {} peers", node_id, config.peers().len());

        Ok(Self {
            config,
            node,
            consensus,
            auth,
            registry,
            ring,
            replicator,
            transport,
        })
    }

    /// Spawn the long-lived tasks: election timer, token sweeper, failure
    /// detector.
    pub fn start_background_tasks(&self) {
        self.consensus.start();
        self.auth.start_sweeper();
        self.registry.start_failure_detector(
            self.transport.clone(),
            self.ring.clone(),
            FAILURE_DETECTOR_INTERVAL,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;

    fn test_config() -> Config {
        let cluster: ClusterConfig = serde_json::from_str(
            r#"{
                "nodes": [
                    { "id": "node_1", "host": "127.0.0.1", "port": 5001 },
                    { "id": "node_2", "host": "127.0.0.1", "port": 5002 },
                    { "id": "node_3", "host": "127.0.0.1", "port": 5003 }
                ],
                "replication_factor": 2,
                "num_shards": 10,
                "virtual_nodes": 100
            }"#,
        )
        .unwrap();
        Config::from_cluster(cluster, "node_1").unwrap()
    }

    #[tokio::test]
    async fn container_wires_every_component() {
        let state = AppState::new(test_config()).await.unwrap();

        assert_eq!(state.node.node_id(), "node_1");
        assert_eq!(state.ring.node_count().await, 3);
        assert_eq!(state.registry.all().await.len(), 2);
        // Round-robin: node_1 owns shards 0, 3, 6, 9 of 10.
        assert_eq!(state.node.metadata().await.owned_shards, vec![0, 3, 6, 9]);
    }

    #[tokio::test]
    async fn default_api_key_is_seeded_when_config_has_none() {
        let state = AppState::new(test_config()).await.unwrap();
        let token = state.auth.authenticate("demo-key").await.unwrap();
        assert!(state.auth.validate_token(&token).await.is_ok());
    }

    #[tokio::test]
    async fn configured_api_keys_replace_the_default() {
        let mut config = test_config();
        config
            .cluster
            .api_keys
            .insert("ops-key".to_string(), "admin".to_string());
        let state = AppState::new(config).await.unwrap();

        assert!(state.auth.authenticate("ops-key").await.is_ok());
        assert!(state.auth.authenticate("demo-key").await.is_err());
    }
}
