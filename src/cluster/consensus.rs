// Leader election and heartbeat consensus (election subset of Raft)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cluster::membership::PeerRegistry;
use crate::cluster::rpc::{AppendEntriesRequest, VoteRequest};
use crate::cluster::rpc_client::PeerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// How often the election timer wakes up to check its deadline.
    pub timer_resolution: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            timer_resolution: Duration::from_millis(10),
        }
    }
}

impl ConsensusConfig {
    /// A fresh randomized election deadline.
    fn random_deadline(&self) -> Instant {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout = rand::rng().random_range(min..=max);
        Instant::now() + Duration::from_millis(timeout)
    }
}

#[derive(Debug)]
struct ConsensusState {
    current_term: u64,
    voted_for: Option<String>,
    role: Role,
    leader_id: Option<String>,
    last_heartbeat: Instant,
    election_deadline: Instant,
    commit_index: u64,
    last_applied: u64,
    // Leader bookkeeping; no log is carried, so these never advance.
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

/// Read-only view of the consensus state.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusSnapshot {
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub leader_id: Option<String>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
}

/// Per-node consensus module: term and vote bookkeeping, the election timer,
/// and the leader heartbeat loop. Peer RPCs always run outside the state
/// lock.
pub struct ConsensusModule {
    node_id: String,
    peers: Vec<String>,
    config: ConsensusConfig,
    transport: Arc<dyn PeerTransport>,
    registry: Arc<PeerRegistry>,
    state: RwLock<ConsensusState>,
    running: AtomicBool,
}

impl ConsensusModule {
    pub fn new(
        node_id: &str,
        peers: Vec<String>,
        transport: Arc<dyn PeerTransport>,
        registry: Arc<PeerRegistry>,
        config: ConsensusConfig,
    ) -> Self {
        let state = ConsensusState {
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            leader_id: None,
            last_heartbeat: Instant::now(),
            election_deadline: config.random_deadline(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        Self {
            node_id: node_id.to_string(),
            peers,
            config,
            transport,
            registry,
            state: RwLock::new(state),
            running: AtomicBool::new(false),
        }
    }

    /// Start the election timer task.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let module = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(module.config.timer_resolution);
            loop {
                ticker.tick().await;
                if !module.running.load(Ordering::SeqCst) {
                    break;
                }
                let election_due = {
                    let state = module.state.read().await;
                    state.role != Role::Leader && Instant::now() >= state.election_deadline
                };
                if election_due {
                    module.start_election().await;
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Enter a new term as candidate and solicit votes from every peer in
    /// parallel. On a strict majority of `{self} ∪ peers` the node takes
    /// leadership; a response with a higher term forces an immediate
    /// step-down instead.
    pub(crate) async fn start_election(self: &Arc<Self>) {
        let (term, request) = {
            let mut state = self.state.write().await;
            state.current_term += 1;
            state.voted_for = Some(self.node_id.clone());
            state.role = Role::Candidate;
            state.leader_id = None;
            state.election_deadline = self.config.random_deadline();
            info!(
                "Starting election for term {} ({}ms since last heartbeat)",
                state.current_term,
                state.last_heartbeat.elapsed().as_millis()
            );
            (
                state.current_term,
                VoteRequest {
                    candidate_id: self.node_id.clone(),
                    term: state.current_term,
                },
            )
        };

        let responses = join_all(self.peers.iter().cloned().map(|peer| {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            async move {
                let result = transport.request_vote(&peer, &request).await;
                (peer, result)
            }
        }))
        .await;

        let mut votes = 1usize; // own vote
        let mut highest_term = term;
        for (peer, result) in responses {
            match result {
                Ok(response) => {
                    self.registry.mark_healthy(&peer).await;
                    if response.term > highest_term {
                        highest_term = response.term;
                    }
                    if response.vote_granted {
                        votes += 1;
                    }
                }
                Err(e) => {
                    error!("Failed to request vote from {}: {}", peer, e);
                    self.registry.mark_failed(&peer).await;
                }
            }
        }

        if highest_term > term {
            self.step_down(highest_term).await;
            return;
        }

        let votes_needed = (self.peers.len() + 1) / 2 + 1;
        if votes >= votes_needed {
            self.become_leader(term).await;
        } else {
            let mut state = self.state.write().await;
            if state.role == Role::Candidate && state.current_term == term {
                debug!(
                    "Election for term {} fell short with {}/{} votes",
                    term, votes, votes_needed
                );
                state.role = Role::Follower;
            }
        }
    }

    /// Take leadership for `term`. Only a candidate still inside the term the
    /// election began may transition.
    pub(crate) async fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut state = self.state.write().await;
            if state.role != Role::Candidate || state.current_term != term {
                return;
            }
            state.role = Role::Leader;
            state.leader_id = Some(self.node_id.clone());
            let next = state.commit_index + 1;
            for peer in &self.peers {
                state.next_index.insert(peer.clone(), next);
                state.match_index.insert(peer.clone(), 0);
            }
            info!("Node {} became leader for term {}", self.node_id, term);
        }
        // Immediate heartbeat suppresses the peers' election timers.
        self.broadcast_heartbeat(term).await;
        self.spawn_heartbeat_loop(term);
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>, term: u64) {
        let module = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(module.config.heartbeat_interval);
            // The first tick completes immediately; the initial broadcast
            // already went out from become_leader.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !module.running.load(Ordering::SeqCst) {
                    break;
                }
                let still_leading = {
                    let state = module.state.read().await;
                    state.role == Role::Leader && state.current_term == term
                };
                if !still_leading {
                    break;
                }
                module.broadcast_heartbeat(term).await;
            }
        });
    }

    async fn broadcast_heartbeat(&self, term: u64) {
        let request = AppendEntriesRequest {
            leader_id: self.node_id.clone(),
            term,
        };
        let responses = join_all(self.peers.iter().cloned().map(|peer| {
            let transport = Arc::clone(&self.transport);
            let request = request.clone();
            async move {
                let result = transport.append_entries(&peer, &request).await;
                (peer, result)
            }
        }))
        .await;

        let mut highest_term = term;
        for (peer, result) in responses {
            match result {
                Ok(response) => {
                    self.registry.mark_healthy(&peer).await;
                    if response.term > highest_term {
                        highest_term = response.term;
                    }
                }
                Err(e) => {
                    debug!("Heartbeat to {} failed: {}", peer, e);
                    self.registry.mark_failed(&peer).await;
                }
            }
        }

        if highest_term > term {
            self.step_down(highest_term).await;
        }
    }

    async fn step_down(&self, observed_term: u64) {
        let mut state = self.state.write().await;
        if observed_term > state.current_term {
            warn!(
                "Observed term {} above own {}; stepping down",
                observed_term, state.current_term
            );
            state.current_term = observed_term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
        state.leader_id = None;
    }

    /// RequestVote handler. Grants at most one vote per term; granting a vote
    /// resets the election timer.
    pub async fn handle_request_vote(&self, candidate_id: &str, term: u64) -> (bool, u64) {
        let mut state = self.state.write().await;
        if term < state.current_term {
            return (false, state.current_term);
        }
        if term > state.current_term {
            state.current_term = term;
            state.role = Role::Follower;
            state.voted_for = None;
            state.leader_id = None;
        }
        let grant = match &state.voted_for {
            None => true,
            Some(existing) => existing == candidate_id,
        };
        if grant {
            state.voted_for = Some(candidate_id.to_string());
            state.election_deadline = self.config.random_deadline();
            debug!(
                "Granted vote to {} for term {}",
                candidate_id, state.current_term
            );
        }
        (grant, state.current_term)
    }

    /// AppendEntries (heartbeat) handler. A valid heartbeat demotes the node
    /// to follower, adopts the sender as leader, and resets the election
    /// timer.
    pub async fn handle_append_entries(&self, leader_id: &str, term: u64) -> (bool, u64) {
        let mut state = self.state.write().await;
        if term < state.current_term {
            return (false, state.current_term);
        }
        if term == state.current_term && state.role == Role::Leader && leader_id != self.node_id {
            // Quorum voting makes this unreachable; if it fires, the cluster
            // state is corrupt and continuing would fork the key space.
            error!(
                "Fatal: two leaders in term {} ({} and {})",
                term, self.node_id, leader_id
            );
            std::process::exit(1);
        }
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
        state.leader_id = Some(leader_id.to_string());
        state.last_heartbeat = Instant::now();
        state.election_deadline = self.config.random_deadline();
        (true, state.current_term)
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == Role::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.read().await.leader_id.clone()
    }

    pub async fn current_term(&self) -> u64 {
        self.state.read().await.current_term
    }

    pub async fn role(&self) -> Role {
        self.state.read().await.role
    }

    pub async fn snapshot(&self) -> ConsensusSnapshot {
        let state = self.state.read().await;
        ConsensusSnapshot {
            role: state.role,
            current_term: state.current_term,
            voted_for: state.voted_for.clone(),
            leader_id: state.leader_id.clone(),
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            next_index: state.next_index.clone(),
            match_index: state.match_index.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::rpc::{
        AppendEntriesResponse, HealthResponse, ReplicateRequest, ReplicateResponse,
        SyncDataResponse, VoteResponse,
    };
    use crate::error::{AppError, AppResult};
    use async_trait::async_trait;

    /// In-process transport whose vote behavior is fixed per peer.
    struct ScriptedTransport {
        grants: HashMap<String, bool>,
        response_term: Option<u64>,
    }

    impl ScriptedTransport {
        fn granting_all(peers: &[&str]) -> Self {
            Self {
                grants: peers.iter().map(|p| (p.to_string(), true)).collect(),
                response_term: None,
            }
        }

        fn denying_all(peers: &[&str]) -> Self {
            Self {
                grants: peers.iter().map(|p| (p.to_string(), false)).collect(),
                response_term: None,
            }
        }
    }

    #[async_trait]
    impl PeerTransport for ScriptedTransport {
        async fn request_vote(
            &self,
            node_id: &str,
            request: &VoteRequest,
        ) -> AppResult<VoteResponse> {
            let granted = *self.grants.get(node_id).unwrap_or(&false);
            Ok(VoteResponse {
                vote_granted: granted && self.response_term.is_none(),
                term: self.response_term.unwrap_or(request.term),
            })
        }

        async fn append_entries(
            &self,
            _node_id: &str,
            request: &AppendEntriesRequest,
        ) -> AppResult<AppendEntriesResponse> {
            Ok(AppendEntriesResponse {
                success: true,
                term: self.response_term.unwrap_or(request.term),
            })
        }

        async fn replicate(
            &self,
            _node_id: &str,
            _request: &ReplicateRequest,
        ) -> AppResult<ReplicateResponse> {
            Ok(ReplicateResponse { success: true })
        }

        async fn health_check(&self, _node_id: &str) -> AppResult<HealthResponse> {
            Ok(HealthResponse {
                healthy: true,
                status: "OK".to_string(),
            })
        }

        async fn sync_data(&self, _node_id: &str) -> AppResult<SyncDataResponse> {
            Err(AppError::PeerUnreachable("not used".to_string()))
        }
    }

    fn module_with(
        peers: &[&str],
        transport: ScriptedTransport,
    ) -> Arc<ConsensusModule> {
        let peer_ids: Vec<String> = peers.iter().map(|p| p.to_string()).collect();
        let registry = Arc::new(PeerRegistry::new(
            peer_ids
                .iter()
                .map(|p| (p.clone(), "127.0.0.1:0".to_string())),
        ));
        Arc::new(ConsensusModule::new(
            "node_1",
            peer_ids,
            Arc::new(transport),
            registry,
            ConsensusConfig::default(),
        ))
    }

    #[tokio::test]
    async fn starts_as_follower_in_term_zero() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Follower);
        assert_eq!(snapshot.current_term, 0);
        assert!(snapshot.voted_for.is_none());
        assert!(snapshot.leader_id.is_none());
    }

    #[tokio::test]
    async fn single_node_cluster_elects_itself() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        module.start_election().await;

        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Leader);
        assert_eq!(snapshot.current_term, 1);
        assert_eq!(snapshot.leader_id.as_deref(), Some("node_1"));
    }

    #[tokio::test]
    async fn majority_of_granted_votes_wins_leadership() {
        let module = module_with(
            &["node_2", "node_3"],
            ScriptedTransport::granting_all(&["node_2", "node_3"]),
        );
        module.start_election().await;

        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Leader);
        // BecomeLeader initializes next_index to commit_index + 1 and
        // match_index to 0 for every peer.
        assert_eq!(snapshot.next_index.get("node_2"), Some(&1));
        assert_eq!(snapshot.next_index.get("node_3"), Some(&1));
        assert_eq!(snapshot.match_index.get("node_2"), Some(&0));
    }

    #[tokio::test]
    async fn election_without_majority_reverts_to_follower() {
        let module = module_with(
            &["node_2", "node_3"],
            ScriptedTransport::denying_all(&["node_2", "node_3"]),
        );
        module.start_election().await;

        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Follower);
        // The term was still consumed.
        assert_eq!(snapshot.current_term, 1);
    }

    #[tokio::test]
    async fn higher_term_vote_response_forces_step_down() {
        let transport = ScriptedTransport {
            grants: HashMap::new(),
            response_term: Some(9),
        };
        let module = module_with(&["node_2", "node_3"], transport);
        module.start_election().await;

        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Follower);
        assert_eq!(snapshot.current_term, 9);
        assert!(snapshot.voted_for.is_none());
    }

    #[tokio::test]
    async fn grants_at_most_one_vote_per_term() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));

        let (granted, term) = module.handle_request_vote("node_2", 5).await;
        assert!(granted);
        assert_eq!(term, 5);

        // A competing candidate in the same term is refused.
        let (granted, term) = module.handle_request_vote("node_3", 5).await;
        assert!(!granted);
        assert_eq!(term, 5);

        // The same candidate asking again keeps its vote.
        let (granted, _) = module.handle_request_vote("node_2", 5).await;
        assert!(granted);
    }

    #[tokio::test]
    async fn stale_term_vote_request_is_rejected() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        module.handle_request_vote("node_2", 5).await;

        let (granted, term) = module.handle_request_vote("node_3", 4).await;
        assert!(!granted);
        assert_eq!(term, 5);
    }

    #[tokio::test]
    async fn higher_term_vote_request_clears_old_vote() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        module.handle_request_vote("node_2", 5).await;

        let (granted, term) = module.handle_request_vote("node_3", 6).await;
        assert!(granted);
        assert_eq!(term, 6);
        assert_eq!(module.snapshot().await.voted_for.as_deref(), Some("node_3"));
    }

    #[tokio::test]
    async fn heartbeat_adopts_leader_and_term() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));

        let (success, term) = module.handle_append_entries("node_2", 3).await;
        assert!(success);
        assert_eq!(term, 3);

        let snapshot = module.snapshot().await;
        assert_eq!(snapshot.role, Role::Follower);
        assert_eq!(snapshot.leader_id.as_deref(), Some("node_2"));
    }

    #[tokio::test]
    async fn stale_heartbeat_is_rejected() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        module.handle_append_entries("node_2", 3).await;

        let (success, term) = module.handle_append_entries("node_3", 2).await;
        assert!(!success);
        assert_eq!(term, 3);
        assert_eq!(module.leader_id().await.as_deref(), Some("node_2"));
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_heartbeat() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        module.start_election().await;
        assert!(module.is_leader().await);
        let term = module.current_term().await;

        let (success, new_term) = module.handle_append_entries("node_2", term + 1).await;
        assert!(success);
        assert_eq!(new_term, term + 1);
        assert_eq!(module.role().await, Role::Follower);
        assert_eq!(module.leader_id().await.as_deref(), Some("node_2"));
    }

    #[tokio::test]
    async fn become_leader_requires_candidacy_in_the_same_term() {
        let module = module_with(&[], ScriptedTransport::granting_all(&[]));
        // Follower, never a candidate: no transition.
        module.become_leader(1).await;
        assert_eq!(module.role().await, Role::Follower);
    }
}
