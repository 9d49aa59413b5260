// Leader-side replication fanout

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument, warn};

use crate::cluster::current_time_millis;
use crate::cluster::membership::PeerRegistry;
use crate::cluster::ring::HashRing;
use crate::cluster::rpc::{ReplicateOp, ReplicateRequest};
use crate::cluster::rpc_client::PeerTransport;

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Primary plus backups, as configured for the cluster.
    pub replication_factor: usize,
    /// Bounded journal of recent fanout outcomes.
    pub max_journal_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            max_journal_size: 1000,
        }
    }
}

/// Outcome of one fanout attempt to one target.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationRecord {
    pub entry_id: String,
    pub operation: ReplicateOp,
    pub key: String,
    pub target: String,
    pub delivered: bool,
    pub ts_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Fans accepted writes out to the peers that host replicas of the affected
/// key. Best effort: a failed delivery is logged and journaled but never
/// rolls back the local write.
pub struct Replicator {
    node_id: String,
    config: ReplicationConfig,
    ring: Arc<HashRing>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn PeerTransport>,
    journal: RwLock<VecDeque<ReplicationRecord>>,
    stats: RwLock<ReplicationStats>,
}

impl Replicator {
    pub fn new(
        node_id: &str,
        ring: Arc<HashRing>,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn PeerTransport>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            config,
            ring,
            registry,
            transport,
            journal: RwLock::new(VecDeque::new()),
            stats: RwLock::new(ReplicationStats::default()),
        }
    }

    /// Propagate an accepted write to every replica holder of the key.
    #[instrument(skip(self, value))]
    pub async fn replicate(&self, operation: ReplicateOp, key: &str, value: &str) {
        let targets = match self
            .ring
            .get_nodes(key, self.config.replication_factor)
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Skipping replication for key {}: {}", key, e);
                return;
            }
        };
        let targets: Vec<String> = targets
            .into_iter()
            .filter(|node| node != &self.node_id)
            .collect();
        if targets.is_empty() {
            return;
        }

        let request = ReplicateRequest {
            operation,
            key: key.to_string(),
            value: value.to_string(),
        };

        let outcomes = join_all(targets.into_iter().map(|target| {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            async move {
                let result = transport.replicate(&target, &request).await;
                (target, result)
            }
        }))
        .await;

        for (target, result) in outcomes {
            match result {
                Ok(response) => {
                    self.registry.mark_healthy(&target).await;
                    debug!(
                        "Replicated {:?} of key {} to {} (success={})",
                        operation, key, target, response.success
                    );
                    self.record(operation, key, &target, true, None).await;
                }
                Err(e) => {
                    error!("Failed to replicate to peer {}: {}", target, e);
                    self.registry.mark_failed(&target).await;
                    self.record(operation, key, &target, false, Some(e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn record(
        &self,
        operation: ReplicateOp,
        key: &str,
        target: &str,
        delivered: bool,
        error: Option<String>,
    ) {
        {
            let mut stats = self.stats.write().await;
            stats.attempted += 1;
            if delivered {
                stats.delivered += 1;
            } else {
                stats.failed += 1;
            }
        }

        let mut journal = self.journal.write().await;
        journal.push_back(ReplicationRecord {
            entry_id: uuid::Uuid::new_v4().to_string(),
            operation,
            key: key.to_string(),
            target: target.to_string(),
            delivered,
            ts_ms: current_time_millis(),
            error,
        });
        while journal.len() > self.config.max_journal_size {
            journal.pop_front();
        }
    }

    pub async fn stats(&self) -> ReplicationStats {
        self.stats.read().await.clone()
    }

    /// Most recent fanout outcomes, newest last.
    pub async fn recent(&self, limit: usize) -> Vec<ReplicationRecord> {
        let journal = self.journal.read().await;
        journal
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}
