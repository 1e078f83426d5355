use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;

use crate::model::NodeMeta;
use crate::raft::transport::{
    AppendEntriesRequest, InstallSnapshotRequest, SECRET_HEADER, VoteRequest,
};
use crate::server::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/cluster/join", post(join))
        .route("/api/cluster/remove", post(remove))
        .route("/api/cluster/status", get(status))
        .route("/api/cluster/metrics", get(metrics))
        .route("/api/cluster/raft/vote", post(raft_vote))
        .route("/api/cluster/raft/append", post(raft_append))
        .route("/api/cluster/raft/snapshot", post(raft_snapshot))
}

fn check_secret(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = &state.engine.cfg.raft_secret;
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if expected.is_empty() || presented != expected {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    Ok(())
}

/// New node announcing itself. The leader pins its key (trust-on-first-use),
/// replicates the membership change, and replies with the full node map so
/// the joiner can find everyone.
async fn join(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(meta): Json<NodeMeta>,
) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    let Some(handle) = &state.engine.raft else {
        return (
            StatusCode::BAD_REQUEST,
            "this node is not running clustered",
        )
            .into_response();
    };
    match handle
        .propose(crate::raft::Command::NodeMeta { node: meta })
        .await
    {
        Ok(_) => Json(state.engine.core.nodes.all()).into_response(),
        Err(crate::error::EngineError::NotLeader { leader }) => {
            // Redirect the joiner at the leader's cluster surface.
            let addr = leader
                .and_then(|id| state.engine.core.nodes.get(&id))
                .map(|meta| meta.cluster_addr)
                .unwrap_or_default();
            (StatusCode::MISDIRECTED_REQUEST, addr).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveRequest {
    node_id: String,
}

async fn remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RemoveRequest>,
) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    let Some(handle) = &state.engine.raft else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(meta) = state.engine.core.nodes.get(&req.node_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match handle
        .propose(crate::raft::Command::NodeLeft { node: meta })
        .await
    {
        Ok(_) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    match &state.engine.raft {
        Some(handle) => match handle.status().await {
            Ok(status) => Json(status).into_response(),
            Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        },
        None => Json(serde_json::json!({
            "nodeId": state.engine.node.node_id,
            "role": "standalone",
        }))
        .into_response(),
    }
}

async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    Json(state.engine.core.metrics.cluster_view()).into_response()
}

async fn raft_vote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<VoteRequest>,
) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    let Some(handle) = &state.engine.raft else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match handle.handle_vote(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn raft_append(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AppendEntriesRequest>,
) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    let Some(handle) = &state.engine.raft else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match handle.handle_append(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn raft_snapshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InstallSnapshotRequest>,
) -> Response {
    if let Err(resp) = check_secret(&state, &headers) {
        return resp;
    }
    let Some(handle) = &state.engine.raft else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match handle.handle_install_snapshot(req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
