// Peer registry and failure detection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cluster::current_time_millis;
use crate::cluster::ring::HashRing;
use crate::cluster::rpc_client::PeerTransport;

/// Strikes before a peer is considered unhealthy.
const HEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct PeerNode {
    pub node_id: String,
    pub address: String,
    pub last_heartbeat_ms: i64,
    pub consecutive_failures: u32,
}

impl PeerNode {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < HEALTHY_THRESHOLD
    }
}

/// Health view over the cluster's peer nodes. Failures accumulate from
/// outgoing RPC outcomes; one success resets the counter.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerNode>>,
}

impl PeerRegistry {
    pub fn new(peers: impl IntoIterator<Item = (String, String)>) -> Self {
        let now = current_time_millis();
        let peers = peers
            .into_iter()
            .map(|(node_id, address)| {
                (
                    node_id.clone(),
                    PeerNode {
                        node_id,
                        address,
                        last_heartbeat_ms: now,
                        consecutive_failures: 0,
                    },
                )
            })
            .collect();
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Record a failed exchange with a peer; returns true when this strike
    /// tipped the peer from healthy to unhealthy.
    pub async fn mark_failed(&self, node_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(node_id) else {
            return false;
        };
        let was_healthy = peer.is_healthy();
        peer.consecutive_failures += 1;
        warn!(
            "Node {} failed attempt {}",
            node_id, peer.consecutive_failures
        );
        was_healthy && !peer.is_healthy()
    }

    /// Record a successful exchange; returns true when the peer recovered
    /// from the unhealthy state.
    pub async fn mark_healthy(&self, node_id: &str) -> bool {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(node_id) else {
            return false;
        };
        let recovered = !peer.is_healthy();
        if peer.consecutive_failures > 0 {
            info!("Node {} recovered", node_id);
        }
        peer.consecutive_failures = 0;
        peer.last_heartbeat_ms = current_time_millis();
        recovered
    }

    pub async fn is_healthy(&self, node_id: &str) -> bool {
        self.peers
            .read()
            .await
            .get(node_id)
            .map(|p| p.is_healthy())
            .unwrap_or(false)
    }

    pub async fn get(&self, node_id: &str) -> Option<PeerNode> {
        self.peers.read().await.get(node_id).cloned()
    }

    pub async fn all(&self) -> Vec<PeerNode> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn healthy_peers(&self) -> Vec<PeerNode> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.is_healthy())
            .cloned()
            .collect()
    }

    /// Periodic health probing. Peers that cross the strike threshold leave
    /// the hash ring; recovered peers rejoin it.
    pub fn start_failure_detector(
        self: &Arc<Self>,
        transport: Arc<dyn PeerTransport>,
        ring: Arc<HashRing>,
        interval: Duration,
    ) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let peers = registry.all().await;
                for peer in peers {
                    match transport.health_check(&peer.node_id).await {
                        Ok(_) => {
                            registry.mark_healthy(&peer.node_id).await;
                            if !ring.contains(&peer.node_id).await {
                                info!("Node {} rejoined; adding back to ring", peer.node_id);
                                ring.add_node(&peer.node_id).await;
                            }
                        }
                        Err(e) => {
                            let went_unhealthy = registry.mark_failed(&peer.node_id).await;
                            if went_unhealthy && ring.contains(&peer.node_id).await {
                                warn!(
                                    "Node {} is unhealthy ({}); removing from ring",
                                    peer.node_id, e
                                );
                                ring.remove_node(&peer.node_id).await;
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PeerRegistry {
        PeerRegistry::new([
            ("node_2".to_string(), "127.0.0.1:5002".to_string()),
            ("node_3".to_string(), "127.0.0.1:5003".to_string()),
        ])
    }

    #[tokio::test]
    async fn peers_start_healthy() {
        let registry = registry();
        assert!(registry.is_healthy("node_2").await);
        assert_eq!(registry.healthy_peers().await.len(), 2);
    }

    #[tokio::test]
    async fn three_strikes_make_a_peer_unhealthy() {
        let registry = registry();
        assert!(!registry.mark_failed("node_2").await);
        assert!(!registry.mark_failed("node_2").await);
        // The third strike is the transition.
        assert!(registry.mark_failed("node_2").await);
        assert!(!registry.is_healthy("node_2").await);
        assert_eq!(registry.healthy_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn one_success_resets_the_strike_count() {
        let registry = registry();
        for _ in 0..3 {
            registry.mark_failed("node_3").await;
        }
        assert!(registry.mark_healthy("node_3").await);
        assert!(registry.is_healthy("node_3").await);
        assert_eq!(registry.get("node_3").await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn unknown_peers_are_not_healthy() {
        let registry = registry();
        assert!(!registry.is_healthy("ghost").await);
        assert!(!registry.mark_failed("ghost").await);
    }
}
