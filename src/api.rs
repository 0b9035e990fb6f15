//! REST API server for tallychain
//!
//! Exposes the node's ledger, pool, peer and consensus operations over HTTP.
//! Peers talk to each other through the same routes (see `network.rs`).

use axum::{
    extract::{Path, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::blockchain::Block;
use crate::consensus::Resolution;
use crate::error::ChainError;
use crate::network::{ChainResponse, PeerRequest};
use crate::node::{Node, NodeState, NodeStats};
use crate::transaction::Transaction;

/// Shared handler state: the node plus request statistics.
pub struct ApiState {
    pub node: Arc<Node>,
    api_stats: RwLock<ApiStats>,
}

impl ApiState {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            api_stats: RwLock::new(ApiStats::new()),
        }
    }
}

/// API statistics and monitoring
#[derive(Debug, Default)]
struct ApiStats {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    start_time: Option<Instant>,
}

impl ApiStats {
    fn new() -> Self {
        ApiStats {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    fn record_request(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
    }
}

// ============================================================================
// API Error Handling
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Chain(ChainError),
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Chain(err) => match err {
                ChainError::MalformedInput(_) | ChainError::InvalidBlock(_) => StatusCode::BAD_REQUEST,
                ChainError::InsufficientFunds(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ChainError::ChainCorrupted(_)
                | ChainError::StaleOrForked(_)
                | ChainError::MiningCancelled => StatusCode::CONFLICT,
                ChainError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
                ChainError::DatabaseError(_)
                | ChainError::IoError(_)
                | ChainError::SerializationError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Chain(e) => e.to_string(),
            ApiError::NotFound(msg) => msg,
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError::Chain(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize, Deserialize)]
pub struct BalanceResponse {
    pub account: String,
    pub balance: i64,
}

#[derive(Serialize, Deserialize)]
pub struct MessageRequest {
    pub author: String,
    pub text: String,
}

#[derive(Serialize, Deserialize)]
pub struct SubmitResponse {
    pub message: String,
    pub pending: usize,
}

#[derive(Serialize, Deserialize)]
pub struct ResolveResponse {
    pub message: String,
    pub replaced: bool,
    pub resolution: Resolution,
}

#[derive(Serialize)]
pub struct ApiStatsResponse {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub uptime_seconds: u64,
    pub node: NodeStats,
}

#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

// ============================================================================
// Middleware
// ============================================================================

async fn stats_middleware(State(api): State<Arc<ApiState>>, req: Request, next: Next) -> Response {
    let response = next.run(req).await;

    let success = response.status().is_success();
    api.api_stats.write().await.record_request(success);

    response
}

/// Logs method, path, status, duration and current [`NodeState`].
async fn logging_middleware(State(api): State<Arc<ApiState>>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let duration = start.elapsed();
    let status = response.status();
    let node_state = api.node.node_state().await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        node_state = ?node_state,
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints nested under `/api`.
pub fn build_api_router(node: Arc<Node>) -> Router {
    let api = Arc::new(ApiState::new(node));

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE]);

    let api_routes = Router::new()
        // Ledger
        .route("/chain", get(get_chain))
        .route("/chain/valid", get(get_chain_validity))
        .route("/chain/:index", get(get_block))
        .route("/blocks", post(accept_block))
        .route("/balance/:account", get(get_balance))
        .route("/balances", get(get_balances))
        // Pool & mining
        .route("/transactions", post(submit_transaction))
        .route("/mempool", get(get_mempool))
        .route("/mine", post(mine_block))
        .route("/mine/cancel", post(cancel_mining))
        // Chat
        .route("/messages", get(get_messages).post(post_message))
        // Peers & consensus
        .route("/peers", get(get_peers).post(register_peer))
        .route("/peers/join", post(join_network))
        .route("/peers/:address", delete(remove_peer))
        .route("/consensus/resolve", get(resolve_consensus).post(resolve_consensus))
        // System
        .route("/health", get(health_check))
        .route("/stats", get(get_api_stats))
        // logging before stats so we always record timing and node-state
        .layer(middleware::from_fn_with_state(api.clone(), logging_middleware))
        .layer(middleware::from_fn_with_state(api.clone(), stats_middleware))
        .with_state(api);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the API on `addr` until Ctrl-C.
pub async fn run_api_server(node: Arc<Node>, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_api_router(node);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

async fn health_check(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    let state = api.node.node_state().await;
    let status = match state {
        NodeState::Ready | NodeState::Booting => StatusCode::OK,
        NodeState::Syncing | NodeState::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    let label = if status == StatusCode::OK { "healthy" } else { "unhealthy" };
    (
        status,
        Json(serde_json::json!({
            "status": label,
            "node_state": format!("{:?}", state),
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn get_chain(State(api): State<Arc<ApiState>>) -> Json<ChainResponse> {
    let chain = api.node.get_chain().await;
    Json(ChainResponse {
        length: chain.len(),
        chain,
    })
}

async fn get_chain_validity(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "valid": api.node.is_chain_valid().await }))
}

async fn get_block(
    State(api): State<Arc<ApiState>>,
    Path(index): Path<u64>,
) -> Result<Json<Block>, ApiError> {
    api.node
        .get_block(index)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Block {} not found", index)))
}

async fn accept_block(
    State(api): State<Arc<ApiState>>,
    Json(block): Json<Block>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let index = block.index;
    api.node.accept_external_block(block).await?;
    Ok(Json(SuccessResponse {
        message: format!("Block {} added", index),
    }))
}

async fn get_balance(State(api): State<Arc<ApiState>>, Path(account): Path<String>) -> Json<BalanceResponse> {
    let balance = api.node.get_balance(&account).await;
    Json(BalanceResponse { account, balance })
}

async fn get_balances(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(api.node.get_balances().await)
}

async fn submit_transaction(
    State(api): State<Arc<ApiState>>,
    Json(tx): Json<Transaction>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let pending = api.node.submit_transaction(tx).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            message: "Transaction added to pending".to_string(),
            pending,
        }),
    ))
}

async fn get_mempool(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    let transactions = api.node.pending_transactions().await;
    Json(serde_json::json!({
        "count": transactions.len(),
        "transactions": transactions
    }))
}

async fn mine_block(State(api): State<Arc<ApiState>>) -> Result<Json<Block>, ApiError> {
    Ok(Json(api.node.mine_next_block().await?))
}

async fn cancel_mining(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "cancelled": api.node.cancel_mining() }))
}

async fn get_messages(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(api.node.chat_history().await)
}

async fn post_message(
    State(api): State<Arc<ApiState>>,
    Json(req): Json<MessageRequest>,
) -> Result<(StatusCode, Json<Block>), ApiError> {
    let block = api.node.post_message(&req.author, &req.text).await?;
    Ok((StatusCode::CREATED, Json(block)))
}

async fn get_peers(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    let peers = api.node.list_peers().await;
    Json(serde_json::json!({
        "count": peers.len(),
        "peers": peers
    }))
}

async fn register_peer(
    State(api): State<Arc<ApiState>>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    let added = api.node.register_peer(&req.address).await?;
    let message = if added { "Peer registered" } else { "Peer already known" };
    Ok(Json(SuccessResponse {
        message: message.to_string(),
    }))
}

async fn join_network(
    State(api): State<Arc<ApiState>>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<SuccessResponse>, ApiError> {
    api.node.join_network(&req.address).await?;
    Ok(Json(SuccessResponse {
        message: "Node registered with network".to_string(),
    }))
}

async fn remove_peer(
    State(api): State<Arc<ApiState>>,
    Path(address): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    if !api.node.remove_peer(&address).await? {
        return Err(ApiError::NotFound(format!("Peer {} not found", address)));
    }
    Ok(Json(SuccessResponse {
        message: "Peer removed".to_string(),
    }))
}

async fn resolve_consensus(State(api): State<Arc<ApiState>>) -> Result<Json<ResolveResponse>, ApiError> {
    let resolution = api.node.resolve_consensus().await?;
    let message = if resolution.replaced() {
        "Chain replaced"
    } else {
        "Chain is authoritative"
    };
    Ok(Json(ResolveResponse {
        message: message.to_string(),
        replaced: resolution.replaced(),
        resolution,
    }))
}

async fn get_api_stats(State(api): State<Arc<ApiState>>) -> impl IntoResponse {
    let (total_requests, successful_requests, failed_requests, uptime_seconds) = {
        let stats = api.api_stats.read().await;
        (
            stats.total_requests,
            stats.successful_requests,
            stats.failed_requests,
            stats.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
        )
    };
    Json(ApiStatsResponse {
        total_requests,
        successful_requests,
        failed_requests,
        uptime_seconds,
        node: api.node.stats().await,
    })
}
