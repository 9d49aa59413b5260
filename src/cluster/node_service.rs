// RPC façade: every data operation is gated by auth, shard ownership, and
// (for writes) leadership before it touches the store.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::auth::AuthManager;
use crate::cluster::consensus::ConsensusModule;
use crate::cluster::membership::PeerRegistry;
use crate::cluster::replication::Replicator;
use crate::cluster::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AuthRequest, AuthResponse, DeleteRequest,
    DeleteResponse, GetRequest, GetResponse, HealthResponse, KeysRequest, KeysResponse,
    MetadataResponse, PutRequest, PutResponse, ReplicateOp, ReplicateRequest, ReplicateResponse,
    SyncDataResponse, SyncEntry, VoteRequest, VoteResponse,
};
use crate::cluster::shard_manager::ShardManager;
use crate::cluster::store::KvStore;
use crate::error::{AppError, AppResult};

pub struct NodeService {
    node_id: String,
    auth: Arc<AuthManager>,
    shards: Arc<ShardManager>,
    store: Arc<KvStore>,
    consensus: Arc<ConsensusModule>,
    replicator: Arc<Replicator>,
    registry: Arc<PeerRegistry>,
}

impl NodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: &str,
        auth: Arc<AuthManager>,
        shards: Arc<ShardManager>,
        store: Arc<KvStore>,
        consensus: Arc<ConsensusModule>,
        replicator: Arc<Replicator>,
        registry: Arc<PeerRegistry>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            auth,
            shards,
            store,
            consensus,
            replicator,
            registry,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn authenticate(&self, request: AuthRequest) -> AuthResponse {
        match self.auth.authenticate(&request.api_key).await {
            Ok(token) => AuthResponse {
                success: true,
                token: Some(token),
                error: None,
            },
            Err(e) => AuthResponse {
                success: false,
                token: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn get(&self, request: GetRequest) -> GetResponse {
        if let Err(e) = self.check_access(&request.auth_token, &request.key).await {
            return GetResponse {
                value: None,
                found: false,
                version: 0,
                error: Some(e.to_string()),
            };
        }

        match self.store.get(&request.key).await {
            Some(value) => GetResponse {
                value: Some(String::from_utf8_lossy(&value.data).into_owned()),
                found: true,
                version: value.version,
                error: None,
            },
            None => GetResponse {
                value: None,
                found: false,
                version: 0,
                error: None,
            },
        }
    }

    pub async fn put(&self, request: PutRequest) -> PutResponse {
        if let Err(e) = self.check_access(&request.auth_token, &request.key).await {
            return PutResponse {
                success: false,
                new_version: 0,
                error: Some(e.to_string()),
            };
        }
        if let Err(e) = self.check_leader().await {
            return PutResponse {
                success: false,
                new_version: 0,
                error: Some(e.to_string()),
            };
        }

        // Optimistic concurrency: a non-zero expected version must match the
        // stored one; absent or zero means unconditional write.
        let current_version = self.store.get_version(&request.key).await;
        if current_version != 0 {
            if let Some(expected) = request.version {
                if expected != 0 && expected != current_version {
                    return PutResponse {
                        success: false,
                        new_version: current_version,
                        error: Some(AppError::VersionConflict(current_version).to_string()),
                    };
                }
            }
        }

        let new_version = self
            .store
            .put(&request.key, request.value.clone().into_bytes())
            .await;
        debug!("Put key {} at version {}", request.key, new_version);

        self.spawn_fanout(ReplicateOp::Put, request.key, request.value);

        PutResponse {
            success: true,
            new_version,
            error: None,
        }
    }

    pub async fn delete(&self, request: DeleteRequest) -> DeleteResponse {
        if let Err(e) = self.check_access(&request.auth_token, &request.key).await {
            return DeleteResponse {
                success: false,
                error: Some(e.to_string()),
            };
        }
        if let Err(e) = self.check_leader().await {
            return DeleteResponse {
                success: false,
                error: Some(e.to_string()),
            };
        }

        let deleted = self.store.delete(&request.key).await;
        debug!("Delete key {} (existed={})", request.key, deleted);

        self.spawn_fanout(ReplicateOp::Delete, request.key, String::new());

        DeleteResponse {
            success: deleted,
            error: None,
        }
    }

    pub async fn keys(&self, request: KeysRequest) -> KeysResponse {
        if let Err(e) = self.auth.validate_token(&request.auth_token).await {
            return KeysResponse {
                keys: Vec::new(),
                error: Some(e.to_string()),
            };
        }
        KeysResponse {
            keys: self.store.keys(request.pattern.as_deref()).await,
            error: None,
        }
    }

    /// Apply a leader-authorized operation locally. Skips ownership and
    /// leadership checks: the leader already made those calls.
    pub async fn replicate(&self, request: ReplicateRequest) -> ReplicateResponse {
        let success = match request.operation {
            ReplicateOp::Put => {
                self.store
                    .put(&request.key, request.value.into_bytes())
                    .await;
                true
            }
            ReplicateOp::Delete => self.store.delete(&request.key).await,
        };
        ReplicateResponse { success }
    }

    pub async fn request_vote(&self, request: VoteRequest) -> VoteResponse {
        let (vote_granted, term) = self
            .consensus
            .handle_request_vote(&request.candidate_id, request.term)
            .await;
        VoteResponse { vote_granted, term }
    }

    pub async fn append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (success, term) = self
            .consensus
            .handle_append_entries(&request.leader_id, request.term)
            .await;
        if success {
            // A live leader is a live peer.
            self.registry.mark_healthy(&request.leader_id).await;
        }
        AppendEntriesResponse { success, term }
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            healthy: true,
            status: "OK".to_string(),
        }
    }

    pub async fn metadata(&self) -> MetadataResponse {
        let snapshot = self.consensus.snapshot().await;
        MetadataResponse {
            role: snapshot.role,
            term: snapshot.current_term,
            leader_id: snapshot.leader_id,
            owned_shards: self.shards.owned_shards().await,
        }
    }

    /// Full local snapshot for replica backfill. Internal like `replicate`;
    /// the caller is another node, not a client.
    pub async fn sync_data(&self) -> SyncDataResponse {
        let entries = self
            .store
            .snapshot()
            .await
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    SyncEntry {
                        value: String::from_utf8_lossy(&value.data).into_owned(),
                        version: value.version,
                    },
                )
            })
            .collect();
        SyncDataResponse { entries }
    }

    async fn check_access(&self, auth_token: &str, key: &str) -> AppResult<()> {
        self.auth.validate_token(auth_token).await?;
        if !self.shards.owns_key(key).await {
            let owner = self
                .shards
                .owner_of(key)
                .await
                .unwrap_or_else(|| "unknown".to_string());
            info!(
                "Rejecting request for key {} owned by {} (shard {})",
                key,
                owner,
                self.shards.shard_of(key)
            );
            return Err(AppError::NotOwner(owner));
        }
        Ok(())
    }

    async fn check_leader(&self) -> AppResult<()> {
        if self.consensus.is_leader().await {
            Ok(())
        } else {
            Err(AppError::NotLeader(self.consensus.leader_id().await))
        }
    }

    fn spawn_fanout(&self, operation: ReplicateOp, key: String, value: String) {
        let replicator = Arc::clone(&self.replicator);
        tokio::spawn(async move {
            replicator.replicate(operation, &key, &value).await;
        });
    }
}
