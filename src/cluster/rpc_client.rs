use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cluster::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, HealthResponse, ReplicateRequest,
    ReplicateResponse, SyncDataResponse, VoteRequest, VoteResponse,
};
use crate::error::{AppError, AppResult};

/// Outbound RPC surface toward peer nodes. Consensus and replication talk to
/// peers through this trait so tests can swap in an in-process transport.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request_vote(&self, node_id: &str, request: &VoteRequest) -> AppResult<VoteResponse>;
    async fn append_entries(
        &self,
        node_id: &str,
        request: &AppendEntriesRequest,
    ) -> AppResult<AppendEntriesResponse>;
    async fn replicate(
        &self,
        node_id: &str,
        request: &ReplicateRequest,
    ) -> AppResult<ReplicateResponse>;
    async fn health_check(&self, node_id: &str) -> AppResult<HealthResponse>;
    async fn sync_data(&self, node_id: &str) -> AppResult<SyncDataResponse>;
}

/// Per-class RPC deadlines. Vote and heartbeat RPCs must resolve well inside
/// an election timeout; data fanout gets the long deadline.
#[derive(Debug, Clone)]
pub struct RpcTimeouts {
    pub vote: Duration,
    pub data: Duration,
    pub probe: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            // election_timeout_min / 2
            vote: Duration::from_millis(75),
            data: Duration::from_secs(5),
            probe: Duration::from_secs(2),
        }
    }
}

/// JSON-over-HTTP peer client backed by the static cluster address table.
#[derive(Debug)]
pub struct PeerClient {
    http: reqwest::Client,
    /// node id -> host:port
    addresses: HashMap<String, String>,
    timeouts: RpcTimeouts,
}

impl PeerClient {
    pub fn new(addresses: HashMap<String, String>, timeouts: RpcTimeouts) -> Self {
        Self {
            http: reqwest::Client::new(),
            addresses,
            timeouts,
        }
    }

    fn url(&self, node_id: &str, path: &str) -> AppResult<String> {
        self.addresses
            .get(node_id)
            .map(|address| format!("http://{}{}", address, path))
            .ok_or_else(|| AppError::PeerUnreachable(format!("unknown peer {}", node_id)))
    }

    async fn post<Req, Resp>(
        &self,
        node_id: &str,
        path: &str,
        request: &Req,
        timeout: Duration,
    ) -> AppResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.url(node_id, path)?;
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::PeerUnreachable(format!("{}: {}", node_id, e)))?;
        response
            .json::<Resp>()
            .await
            .map_err(|e| AppError::PeerUnreachable(format!("{}: {}", node_id, e)))
    }

    async fn get_json<Resp>(&self, node_id: &str, path: &str, timeout: Duration) -> AppResult<Resp>
    where
        Resp: DeserializeOwned,
    {
        let url = self.url(node_id, path)?;
        let response = self
            .http
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| AppError::PeerUnreachable(format!("{}: {}", node_id, e)))?;
        response
            .json::<Resp>()
            .await
            .map_err(|e| AppError::PeerUnreachable(format!("{}: {}", node_id, e)))
    }
}

#[async_trait]
impl PeerTransport for PeerClient {
    async fn request_vote(&self, node_id: &str, request: &VoteRequest) -> AppResult<VoteResponse> {
        self.post(node_id, "/rpc/raft/vote", request, self.timeouts.vote)
            .await
    }

    async fn append_entries(
        &self,
        node_id: &str,
        request: &AppendEntriesRequest,
    ) -> AppResult<AppendEntriesResponse> {
        self.post(node_id, "/rpc/raft/append", request, self.timeouts.vote)
            .await
    }

    async fn replicate(
        &self,
        node_id: &str,
        request: &ReplicateRequest,
    ) -> AppResult<ReplicateResponse> {
        self.post(node_id, "/rpc/replicate", request, self.timeouts.data)
            .await
    }

    async fn health_check(&self, node_id: &str) -> AppResult<HealthResponse> {
        self.get_json(node_id, "/rpc/health", self.timeouts.probe)
            .await
    }

    async fn sync_data(&self, node_id: &str) -> AppResult<SyncDataResponse> {
        self.get_json(node_id, "/rpc/sync", self.timeouts.data)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_maps_to_peer_unreachable() {
        let client = PeerClient::new(HashMap::new(), RpcTimeouts::default());
        let err = client.health_check("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::PeerUnreachable(_)));
        assert!(err.to_string().contains("ghost"));
    }
}
