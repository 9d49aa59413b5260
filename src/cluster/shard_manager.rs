use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::cluster::md5_u128;

#[derive(Debug, Default)]
struct ShardState {
    /// shard id -> owning node id (total over all shards once assigned)
    allocation: HashMap<u32, String>,
    /// shards assigned to this node
    owned: BTreeSet<u32>,
}

/// Fixed-count shard table with per-node ownership.
///
/// Ownership invariant: `shard ∈ owned ⇔ allocation[shard] == node_id`.
#[derive(Debug)]
pub struct ShardManager {
    node_id: String,
    num_shards: u32,
    state: RwLock<ShardState>,
}

#[derive(Debug, Serialize)]
pub struct ShardStats {
    pub num_shards: u32,
    pub owned_shards: Vec<u32>,
    pub allocated_shards: usize,
}

impl ShardManager {
    pub fn new(node_id: &str, num_shards: u32) -> Self {
        Self {
            node_id: node_id.to_string(),
            num_shards,
            state: RwLock::new(ShardState::default()),
        }
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    /// The shard a key hashes into: MD5(key) mod num_shards.
    pub fn shard_of(&self, key: &str) -> u32 {
        (md5_u128(key) % self.num_shards as u128) as u32
    }

    /// Round-robin initial assignment over an ordered node list. Deterministic
    /// given the same list on every node.
    pub async fn assign_initial(&self, nodes: &[String]) {
        if nodes.is_empty() {
            return;
        }
        let mut state = self.state.write().await;
        state.allocation.clear();
        state.owned.clear();
        for shard_id in 0..self.num_shards {
            let assigned = &nodes[shard_id as usize % nodes.len()];
            state.allocation.insert(shard_id, assigned.clone());
            if *assigned == self.node_id {
                state.owned.insert(shard_id);
            }
        }
        info!("Node {} owns shards {:?}", self.node_id, state.owned);
    }

    pub async fn owns_key(&self, key: &str) -> bool {
        let shard_id = self.shard_of(key);
        self.state.read().await.owned.contains(&shard_id)
    }

    /// The node allocated the key's shard, if the shard is allocated.
    pub async fn owner_of(&self, key: &str) -> Option<String> {
        let shard_id = self.shard_of(key);
        self.state.read().await.allocation.get(&shard_id).cloned()
    }

    pub async fn add_shard(&self, shard_id: u32) {
        let mut state = self.state.write().await;
        state.owned.insert(shard_id);
        state.allocation.insert(shard_id, self.node_id.clone());
        info!("Node {} now owns shard {}", self.node_id, shard_id);
    }

    pub async fn remove_shard(&self, shard_id: u32) {
        let mut state = self.state.write().await;
        state.owned.remove(&shard_id);
        if state.allocation.get(&shard_id) == Some(&self.node_id) {
            state.allocation.remove(&shard_id);
        }
        info!("Node {} no longer owns shard {}", self.node_id, shard_id);
    }

    /// Rebalance the allocation over `nodes` (config order).
    ///
    /// With `base = num_shards / n` and `rem = num_shards % n`, node `i` ends
    /// with `base + 1` shards when `i < rem`, else `base`. Surplus shards are
    /// collected lowest-id first from sources in config order (shards whose
    /// owner left the node list are collected first) and handed to deficits
    /// in config order. The whole move set commits under one write lock.
    pub async fn rebalance(&self, nodes: &[String]) {
        if nodes.is_empty() {
            return;
        }
        let mut state = self.state.write().await;

        let n = nodes.len();
        let base = self.num_shards as usize / n;
        let rem = self.num_shards as usize % n;
        let quota: Vec<usize> = (0..n).map(|i| base + usize::from(i < rem)).collect();

        let index_of: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut held: Vec<Vec<u32>> = vec![Vec::new(); n];
        let mut pool: Vec<(u32, Option<String>)> = Vec::new();
        for shard_id in 0..self.num_shards {
            match state
                .allocation
                .get(&shard_id)
                .and_then(|owner| index_of.get(owner.as_str()).copied())
            {
                Some(i) => held[i].push(shard_id),
                None => pool.push((shard_id, state.allocation.get(&shard_id).cloned())),
            }
        }

        for (i, shards) in held.iter_mut().enumerate() {
            while shards.len() > quota[i] {
                let shard_id = shards.remove(0);
                pool.push((shard_id, Some(nodes[i].clone())));
            }
        }

        for (i, node) in nodes.iter().enumerate() {
            while held[i].len() < quota[i] {
                let Some((shard_id, source)) = pool.first().cloned() else {
                    break;
                };
                pool.remove(0);
                held[i].push(shard_id);
                state.allocation.insert(shard_id, node.clone());
                match &source {
                    Some(src) => {
                        info!("Moving shard {} from {} to {}", shard_id, src, node)
                    }
                    None => info!("Assigning unallocated shard {} to {}", shard_id, node),
                }
                if source.as_deref() == Some(self.node_id.as_str()) {
                    state.owned.remove(&shard_id);
                }
                if *node == self.node_id {
                    state.owned.insert(shard_id);
                }
            }
        }
    }

    /// Shards owned by this node, ascending.
    pub async fn owned_shards(&self) -> Vec<u32> {
        self.state.read().await.owned.iter().copied().collect()
    }

    pub async fn stats(&self) -> ShardStats {
        let state = self.state.read().await;
        ShardStats {
            num_shards: self.num_shards,
            owned_shards: state.owned.iter().copied().collect(),
            allocated_shards: state.allocation.len(),
        }
    }
}
