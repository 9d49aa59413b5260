use std::collections::{BTreeMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::cluster::md5_u128;
use crate::error::{AppError, AppResult};

/// Ring positions are 32-bit: the 128-bit MD5 digest taken mod 2^32.
fn ring_position(key: &str) -> u32 {
    (md5_u128(key) % (1u128 << 32)) as u32
}

#[derive(Debug, Default)]
struct RingState {
    /// hash position -> real node id
    positions: BTreeMap<u32, String>,
    /// real nodes currently on the ring
    nodes: HashSet<String>,
}

/// Consistent hash ring mapping keys to owning nodes via virtual nodes.
#[derive(Debug)]
pub struct HashRing {
    virtual_nodes: u32,
    state: RwLock<RingState>,
    /// Memoized key -> node lookups; invalidated on membership change.
    lookup_cache: Mutex<LruCache<String, String>>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes,
            state: RwLock::new(RingState::default()),
            lookup_cache: Mutex::new(LruCache::new(NonZeroUsize::new(10000).unwrap())),
        }
    }

    /// Add a real node at `virtual_nodes` positions derived from `"{id}:{i}"`.
    /// A position already occupied by an earlier node is left in place, so
    /// collisions resolve deterministically by insertion order.
    pub async fn add_node(&self, node_id: &str) {
        {
            let mut state = self.state.write().await;
            for i in 0..self.virtual_nodes {
                let position = ring_position(&format!("{}:{}", node_id, i));
                state
                    .positions
                    .entry(position)
                    .or_insert_with(|| node_id.to_string());
            }
            state.nodes.insert(node_id.to_string());
        }
        self.lookup_cache.lock().await.clear();
        info!(
            "Added node {} to hash ring with {} virtual nodes",
            node_id, self.virtual_nodes
        );
    }

    /// Remove every ring entry belonging to `node_id`.
    pub async fn remove_node(&self, node_id: &str) {
        {
            let mut state = self.state.write().await;
            state.positions.retain(|_, id| id.as_str() != node_id);
            state.nodes.remove(node_id);
        }
        self.lookup_cache.lock().await.clear();
        warn!("Removed node {} from hash ring", node_id);
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.state.read().await.nodes.contains(node_id)
    }

    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// The node at the least position >= hash(key), wrapping to the first
    /// position on the ring.
    pub async fn get_node(&self, key: &str) -> AppResult<String> {
        {
            let mut cache = self.lookup_cache.lock().await;
            if let Some(node) = cache.get(key) {
                return Ok(node.clone());
            }
        }

        let node = {
            let state = self.state.read().await;
            if state.positions.is_empty() {
                return Err(AppError::EmptyRing);
            }
            let position = ring_position(key);
            state
                .positions
                .range(position..)
                .next()
                .or_else(|| state.positions.iter().next())
                .map(|(_, id)| id.clone())
                .ok_or(AppError::EmptyRing)?
        };

        self.lookup_cache
            .lock()
            .await
            .put(key.to_string(), node.clone());
        Ok(node)
    }

    /// Walk clockwise from hash(key) collecting `count` distinct real nodes.
    pub async fn get_nodes(&self, key: &str, count: usize) -> AppResult<Vec<String>> {
        let state = self.state.read().await;
        if state.nodes.len() < count {
            return Err(AppError::InsufficientNodes {
                available: state.nodes.len(),
                requested: count,
            });
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let entries: Vec<(&u32, &String)> = state.positions.iter().collect();
        let position = ring_position(key);
        let start = entries.partition_point(|(p, _)| **p < position);

        let mut nodes = Vec::with_capacity(count);
        let mut seen = HashSet::new();
        for i in 0..entries.len() {
            let (_, node) = entries[(start + i) % entries.len()];
            if seen.insert(node.as_str()) {
                nodes.push(node.clone());
                if nodes.len() == count {
                    break;
                }
            }
        }
        Ok(nodes)
    }

    /// Full (position, node) listing, ordered by position.
    pub async fn entries(&self) -> Vec<(u32, String)> {
        self.state
            .read()
            .await
            .positions
            .iter()
            .map(|(p, id)| (*p, id.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn three_node_ring() -> HashRing {
        let ring = HashRing::new(100);
        for id in ["node_1", "node_2", "node_3"] {
            ring.add_node(id).await;
        }
        ring
    }

    #[tokio::test]
    async fn empty_ring_lookup_fails() {
        let ring = HashRing::new(100);
        assert!(matches!(
            ring.get_node("key1").await,
            Err(AppError::EmptyRing)
        ));
    }

    #[tokio::test]
    async fn placement_is_deterministic_across_instances() {
        let a = three_node_ring().await;
        let b = three_node_ring().await;
        for i in 0..200 {
            let key = format!("user_{}", i);
            assert_eq!(a.get_node(&key).await.unwrap(), b.get_node(&key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn lookup_is_stable_and_cached() {
        let ring = three_node_ring().await;
        let first = ring.get_node("key1").await.unwrap();
        let second = ring.get_node("key1").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn keys_distribute_across_nodes() {
        let ring = three_node_ring().await;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let node = ring.get_node(&format!("user_{}", i)).await.unwrap();
            *counts.entry(node).or_insert(0) += 1;
        }
        // No node should take more than 60% of the keys.
        for (node, count) in counts {
            assert!(count < 600, "node {} has too many keys: {}", node, count);
        }
    }

    #[tokio::test]
    async fn get_nodes_returns_distinct_nodes() {
        let ring = three_node_ring().await;
        let nodes = ring.get_nodes("key1", 2).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_ne!(nodes[0], nodes[1]);
        // Primary matches single-node lookup.
        assert_eq!(nodes[0], ring.get_node("key1").await.unwrap());
    }

    #[tokio::test]
    async fn get_nodes_rejects_oversized_replication() {
        let ring = three_node_ring().await;
        assert!(matches!(
            ring.get_nodes("key1", 4).await,
            Err(AppError::InsufficientNodes {
                available: 3,
                requested: 4
            })
        ));
    }

    #[tokio::test]
    async fn add_then_remove_restores_ring_entries() {
        let ring = three_node_ring().await;
        let before = ring.entries().await;

        ring.add_node("node_4").await;
        ring.remove_node("node_4").await;

        assert_eq!(ring.entries().await, before);
        assert!(!ring.contains("node_4").await);
    }

    #[tokio::test]
    async fn remove_node_drops_all_its_entries() {
        let ring = three_node_ring().await;
        ring.remove_node("node_2").await;
        assert!(ring
            .entries()
            .await
            .iter()
            .all(|(_, id)| id != "node_2"));
        assert_eq!(ring.node_count().await, 2);
    }

    #[tokio::test]
    async fn membership_change_invalidates_cached_lookups() {
        let ring = three_node_ring().await;
        // Find a key owned by node_3, then remove node_3.
        let mut key = None;
        for i in 0..500 {
            let candidate = format!("probe_{}", i);
            if ring.get_node(&candidate).await.unwrap() == "node_3" {
                key = Some(candidate);
                break;
            }
        }
        let key = key.expect("some key maps to node_3");
        ring.remove_node("node_3").await;
        assert_ne!(ring.get_node(&key).await.unwrap(), "node_3");
    }
}
