// shardstore node server

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use shardstore::app_state::AppState;
use shardstore::cluster::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AuthRequest, AuthResponse, DeleteRequest,
    DeleteResponse, GetRequest, GetResponse, HealthResponse, KeysRequest, KeysResponse,
    MetadataResponse, PutRequest, PutResponse, ReplicateRequest, ReplicateResponse,
    SyncDataResponse, VoteRequest, VoteResponse,
};
use shardstore::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration; an invalid config is fatal
    let config = Config::from_env()?;
    let address = config.local_node().address();

    // Initialize application state and background tasks
    let app_state = AppState::new(config).await?;
    app_state.start_background_tasks();

    let app = Router::new()
        .route("/rpc/authenticate", post(authenticate))
        .route("/rpc/get", post(get_value))
        .route("/rpc/put", post(put_value))
        .route("/rpc/delete", post(delete_value))
        .route("/rpc/keys", post(list_keys))
        .route("/rpc/replicate", post(replicate))
        .route("/rpc/raft/vote", post(request_vote))
        .route("/rpc/raft/append", post(append_entries))
        .route("/rpc/health", get(health))
        .route("/rpc/metadata", get(metadata))
        .route("/rpc/sync", get(sync_data))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    info!("shardstore node listening on {}", address);
    let listener = TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn authenticate(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Json<AuthResponse> {
    Json(state.node.authenticate(request).await)
}

async fn get_value(
    State(state): State<AppState>,
    Json(request): Json<GetRequest>,
) -> Json<GetResponse> {
    Json(state.node.get(request).await)
}

async fn put_value(
    State(state): State<AppState>,
    Json(request): Json<PutRequest>,
) -> Json<PutResponse> {
    Json(state.node.put(request).await)
}

async fn delete_value(
    State(state): State<AppState>,
    Json(request): Json<DeleteRequest>,
) -> Json<DeleteResponse> {
    Json(state.node.delete(request).await)
}

async fn list_keys(
    State(state): State<AppState>,
    Json(request): Json<KeysRequest>,
) -> Json<KeysResponse> {
    Json(state.node.keys(request).await)
}

async fn replicate(
    State(state): State<AppState>,
    Json(request): Json<ReplicateRequest>,
) -> Json<ReplicateResponse> {
    Json(state.node.replicate(request).await)
}

async fn request_vote(
    State(state): State<AppState>,
    Json(request): Json<VoteRequest>,
) -> Json<VoteResponse> {
    Json(state.node.request_vote(request).await)
}

async fn append_entries(
    State(state): State<AppState>,
    Json(request): Json<AppendEntriesRequest>,
) -> Json<AppendEntriesResponse> {
    Json(state.node.append_entries(request).await)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.node.health().await)
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(state.node.metadata().await)
}

async fn sync_data(State(state): State<AppState>) -> Json<SyncDataResponse> {
    Json(state.node.sync_data().await)
}
