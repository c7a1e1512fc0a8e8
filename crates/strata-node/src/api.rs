use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, Method},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use strata_net::PeerSummary;
use strata_shared::{Cid, ContentType, GuildId};
use strata_store::{GuildMode, PolicyState};

use crate::error::ApiError;
use crate::gc::GcReport;
use crate::node::{NodeStatus, StorageNode};

/// Extra room above the blob size limit so oversized uploads reach the
/// store and get a proper error instead of a dropped connection.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<StorageNode>,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(node: Arc<StorageNode>, admin_token: Option<String>) -> Self {
        Self {
            node,
            admin_token: admin_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    let body_limit = state.node.store().limits().max_blob_size + BODY_LIMIT_SLACK;

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(node_status))
        .route("/peers", get(list_peers))
        .route("/blob", post(blob_store))
        .route("/blob/:cid", get(blob_fetch).delete(blob_delete))
        .route("/blob/:cid/pin", post(blob_pin))
        .route("/blob/:cid/unpin", post(blob_unpin))
        .route("/policy", get(policy_get))
        .route("/policy/cids/block", post(policy_block_cid))
        .route("/policy/cids/unblock", post(policy_unblock_cid))
        .route("/policy/peers/block", post(policy_block_peer))
        .route("/policy/peers/unblock", post(policy_unblock_peer))
        .route("/policy/guilds", put(policy_set_guilds))
        .route("/peers/:peer_id/reset-reputation", post(peer_reset_reputation))
        .route("/gc/run", post(gc_run))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP status bridge");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct StoreQuery {
    content_type: Option<String>,
    guild: Option<String>,
    #[serde(default)]
    pin: bool,
}

#[derive(Serialize)]
struct StoredResponse {
    cid: Cid,
    size: usize,
}

#[derive(Deserialize)]
struct CidRequest {
    cid: String,
}

#[derive(Deserialize)]
struct PeerRequest {
    peer_id: String,
}

#[derive(Deserialize)]
struct GuildPolicyRequest {
    mode: GuildMode,
    #[serde(default)]
    allowed: BTreeSet<GuildId>,
    #[serde(default)]
    blocked: BTreeSet<GuildId>,
}

#[derive(Serialize)]
struct PolicyChange {
    changed: bool,
    version: u64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn node_status(State(state): State<AppState>) -> Result<Json<NodeStatus>, ApiError> {
    Ok(Json(state.node.status().await?))
}

async fn list_peers(State(state): State<AppState>) -> Json<Vec<PeerSummary>> {
    Json(state.node.peers().summaries().await)
}

async fn blob_store(
    State(state): State<AppState>,
    Query(query): Query<StoreQuery>,
    body: Bytes,
) -> Result<Json<StoredResponse>, ApiError> {
    let content_type = match query.content_type.as_deref() {
        Some(raw) => raw
            .parse::<ContentType>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => ContentType::Media,
    };
    let guild = query.guild.filter(|g| !g.is_empty()).map(GuildId::new);

    let cid = state
        .node
        .store_blob(&body, content_type, guild, query.pin)
        .await?;

    info!(cid = %cid, size = body.len(), "Blob stored via HTTP");
    Ok(Json(StoredResponse {
        cid,
        size: body.len(),
    }))
}

async fn blob_fetch(
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cid = parse_cid(&cid)?;
    let data = state.node.retrieve(&cid).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], data))
}

async fn blob_delete(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let cid = parse_cid(&cid)?;
    let size = state.node.delete_blob(&cid).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "size": size })))
}

async fn blob_pin(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let cid = parse_cid(&cid)?;
    state.node.pin(&cid).await?;
    Ok(Json(serde_json::json!({ "pinned": true })))
}

async fn blob_unpin(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(cid): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let cid = parse_cid(&cid)?;
    state.node.unpin(&cid).await?;
    Ok(Json(serde_json::json!({ "pinned": false })))
}

async fn policy_get(State(state): State<AppState>) -> Json<PolicyState> {
    Json(state.node.policy().snapshot())
}

async fn policy_block_cid(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CidRequest>,
) -> Result<Json<PolicyChange>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let cid = parse_cid(&req.cid)?;
    let changed = state.node.policy().block_cid(cid)?;
    Ok(policy_change(&state, changed))
}

async fn policy_unblock_cid(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CidRequest>,
) -> Result<Json<PolicyChange>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let cid = parse_cid(&req.cid)?;
    let changed = state.node.policy().unblock_cid(&cid)?;
    Ok(policy_change(&state, changed))
}

async fn policy_block_peer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<PolicyChange>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let peer = parse_peer(&req.peer_id)?;
    let changed = state.node.policy().block_peer(&peer)?;
    if changed {
        info!(peer = %peer, "Admin blocked peer");
    }
    Ok(policy_change(&state, changed))
}

async fn policy_unblock_peer(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<PeerRequest>,
) -> Result<Json<PolicyChange>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let peer = parse_peer(&req.peer_id)?;
    let changed = state.node.policy().unblock_peer(&peer)?;
    Ok(policy_change(&state, changed))
}

async fn policy_set_guilds(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<GuildPolicyRequest>,
) -> Result<Json<PolicyChange>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let changed = state
        .node
        .policy()
        .set_guild_policy(req.mode, req.allowed, req.blocked)?;
    Ok(policy_change(&state, changed))
}

async fn peer_reset_reputation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_admin_token(&headers, &state)?;
    let peer = parse_peer(&peer_id)?;
    if !state.node.peers().reset_reputation(&peer).await {
        return Err(ApiError::NotFound(format!("Unknown peer {peer}")));
    }
    info!(peer = %peer, "Admin reset peer reputation");
    Ok(Json(serde_json::json!({ "reset": true })))
}

async fn gc_run(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<GcReport>, ApiError> {
    verify_admin_token(&headers, &state)?;
    Ok(Json(state.node.run_gc().await?))
}

fn policy_change(state: &AppState, changed: bool) -> Json<PolicyChange> {
    Json(PolicyChange {
        changed,
        version: state.node.policy().snapshot().version,
    })
}

fn verify_admin_token(headers: &HeaderMap, state: &AppState) -> Result<(), ApiError> {
    let Some(ref expected) = state.admin_token else {
        return Err(ApiError::Forbidden(
            "Admin API is disabled (no admin token configured)".into(),
        ));
    };

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ApiError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

fn parse_cid(raw: &str) -> Result<Cid, ApiError> {
    raw.trim()
        .parse::<Cid>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_peer(raw: &str) -> Result<PeerId, ApiError> {
    raw.trim()
        .parse::<PeerId>()
        .map_err(|e| ApiError::BadRequest(format!("Invalid peer id: {e}")))
}
