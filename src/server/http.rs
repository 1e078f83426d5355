use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::Engine;
use crate::access::Principal;
use crate::hub::ResourceKind;
use crate::model::{AccessLevel, Game, Team, UserAccessPolicy};
use crate::raft::transport::SECRET_HEADER;
use crate::registry::{GameSummary, TeamSummary};
use crate::server::message::{Message, msg_type};
use crate::server::{AppState, cluster, identify, ws};

pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState {
        engine,
        forward: reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .expect("reqwest client construction is infallible with these options"),
    });
    Router::new()
        .route("/api/action", post(post_action))
        .route("/api/save", post(post_save))
        .route("/api/load/{id}", get(get_game))
        .route("/api/load-team/{id}", get(get_team))
        .route("/api/save-team", post(post_save_team))
        .route("/api/delete/{id}", post(post_delete_game))
        .route("/api/delete-team/{id}", post(post_delete_team))
        .route("/api/list-games", get(list_games))
        .route("/api/list-teams", get(list_teams))
        .route("/api/admin/policy", get(get_policy).post(post_policy))
        .route("/api/ws", get(ws::ws_handler))
        .merge(cluster::routes())
        .with_state(state)
}

fn leader_unavailable(game_id: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(Message::error(game_id, "leader unavailable")),
    )
        .into_response()
}

/// Followers forward writes to the leader over an authenticated channel,
/// retrying across a leader change. Returns None when this node should
/// serve the write itself.
pub async fn forward_write(
    state: &AppState,
    path: &str,
    user: Option<&str>,
    body: &serde_json::Value,
) -> Option<Response> {
    state.engine.raft.as_ref()?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if state.engine.is_leader().await {
            return None;
        }
        let Some(leader) = state.engine.leader_http_addr().await else {
            if Instant::now() >= deadline {
                return Some(leader_unavailable(""));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            continue;
        };
        let url = format!("http://{leader}{path}");
        let mut req = state
            .forward
            .post(&url)
            .header(SECRET_HEADER, &state.engine.cfg.raft_secret)
            .json(body);
        if let Some(user) = user {
            req = req.header("x-user-email", user);
        }
        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let bytes = resp.bytes().await.unwrap_or_default();
                return Some(
                    (
                        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK),
                        [(axum::http::header::CONTENT_TYPE, "application/json")],
                        bytes,
                    )
                        .into_response(),
                );
            }
            Err(_) => {
                // Leader may have just changed; retry until the deadline.
                if Instant::now() >= deadline {
                    return Some(leader_unavailable(""));
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

async fn post_action(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(msg): Json<Message>,
) -> Response {
    state.engine.core.metrics.count_request();
    let started = Instant::now();
    if msg.kind != msg_type::ACTION || msg.game_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(Message::error(&msg.game_id, "expected an ACTION with a gameId")),
        )
            .into_response();
    }
    let user = identify(&state, &headers);
    if let Some(forwarded) = forward_write(
        &state,
        "/api/action",
        user.as_deref(),
        &serde_json::to_value(&msg).unwrap_or_default(),
    )
    .await
    {
        return forwarded;
    }
    let hub = state.engine.hubs.get_hub(ResourceKind::Game, &msg.game_id);
    let reply = hub.process_action(&msg, user.as_deref(), None).await;
    state
        .engine
        .core
        .metrics
        .observe_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
    Json(reply).into_response()
}

async fn post_save(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(game): Json<Game>,
) -> Response {
    state.engine.core.metrics.count_request();
    if game.id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(Message::error("", "game id is required")),
        )
            .into_response();
    }
    let user = identify(&state, &headers);
    if let Some(forwarded) = forward_write(
        &state,
        "/api/save",
        user.as_deref(),
        &serde_json::to_value(&game).unwrap_or_default(),
    )
    .await
    {
        return forwarded;
    }
    let hub = state.engine.hubs.get_hub(ResourceKind::Game, &game.id);
    Json(hub.save_game(game, user.as_deref(), false).await).into_response()
}

fn principal<'a>(state: &'a AppState, user: &'a Option<String>) -> Principal<'a> {
    Principal {
        user: user.as_deref(),
        bootstrap_admin: state.engine.cfg.admin.as_deref(),
    }
}

async fn get_game(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    state.engine.core.metrics.count_request();
    let Ok(game) = state.engine.core.games.load(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let user = identify(&state, &headers);
    let policy = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    let (away, home) = state.engine.core.team_pair(&game);
    let level = crate::access::game_access(
        principal(&state, &user),
        &policy,
        &game,
        away.as_ref(),
        home.as_ref(),
    );
    if level < AccessLevel::Read {
        // Authorization failures stay in-band at 200 so clients can tell
        // them apart from infrastructure errors.
        return Json(Message::error(&id, "Forbidden")).into_response();
    }
    Json(game).into_response()
}

async fn get_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    state.engine.core.metrics.count_request();
    let Ok(team) = state.engine.core.teams.load(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let user = identify(&state, &headers);
    let policy = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    let level = crate::access::team_access(principal(&state, &user), &policy, &team);
    if level < AccessLevel::Read {
        return Json(Message::error(&id, "Forbidden")).into_response();
    }
    Json(team).into_response()
}

async fn post_save_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(team): Json<Team>,
) -> Response {
    state.engine.core.metrics.count_request();
    if team.id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(Message::error("", "team id is required")),
        )
            .into_response();
    }
    let user = identify(&state, &headers);
    if let Some(forwarded) = forward_write(
        &state,
        "/api/save-team",
        user.as_deref(),
        &serde_json::to_value(&team).unwrap_or_default(),
    )
    .await
    {
        return forwarded;
    }
    let hub = state.engine.hubs.get_hub(ResourceKind::Team, &team.id);
    Json(hub.save_team(team, user.as_deref()).await).into_response()
}

async fn post_delete_game(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = identify(&state, &headers);
    if let Some(forwarded) = forward_write(
        &state,
        &format!("/api/delete/{id}"),
        user.as_deref(),
        &serde_json::Value::Null,
    )
    .await
    {
        return forwarded;
    }
    let hub = state.engine.hubs.get_hub(ResourceKind::Game, &id);
    Json(hub.delete_game(user.as_deref()).await).into_response()
}

async fn post_delete_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let user = identify(&state, &headers);
    if let Some(forwarded) = forward_write(
        &state,
        &format!("/api/delete-team/{id}"),
        user.as_deref(),
        &serde_json::Value::Null,
    )
    .await
    {
        return forwarded;
    }
    let hub = state.engine.hubs.get_hub(ResourceKind::Team, &id);
    Json(hub.delete_team(user.as_deref()).await).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub order: Option<String>,
}

#[derive(serde::Serialize)]
struct ListMeta {
    total: usize,
}

#[derive(serde::Serialize)]
struct ListResponse<T> {
    data: Vec<T>,
    meta: ListMeta,
}

fn paginate<T>(mut items: Vec<T>, params: &ListParams) -> ListResponse<T> {
    let total = items.len();
    let offset = params.offset.unwrap_or(0).min(total);
    let limit = params.limit.unwrap_or(50).min(500);
    items = items.into_iter().skip(offset).take(limit).collect();
    ListResponse {
        data: items,
        meta: ListMeta { total },
    }
}

async fn list_games(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    state.engine.core.metrics.count_request();
    let user = identify(&state, &headers);
    let policy = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    let is_admin = principal(&state, &user).is_admin(&policy);
    let mut games = state
        .engine
        .core
        .registry
        .visible_games(user.as_deref(), is_admin);

    if let Some(q) = params.q.as_deref().filter(|q| !q.is_empty()) {
        let needle = q.to_lowercase();
        games.retain(|g: &GameSummary| {
            [&g.event, &g.location, &g.away, &g.home, &g.date]
                .into_iter()
                .any(|field| field.to_lowercase().contains(&needle))
        });
    }

    let descending = params.order.as_deref() == Some("desc");
    match params.sort_by.as_deref() {
        Some("event") => games.sort_by(|a, b| a.event.cmp(&b.event)),
        _ => games.sort_by(|a, b| a.date.cmp(&b.date)),
    }
    if descending {
        games.reverse();
    }
    Json(paginate(games, &params)).into_response()
}

async fn list_teams(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Response {
    state.engine.core.metrics.count_request();
    let user = identify(&state, &headers);
    let policy = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    let is_admin = principal(&state, &user).is_admin(&policy);
    let mut teams = state
        .engine
        .core
        .registry
        .visible_teams(user.as_deref(), is_admin);

    if let Some(q) = params.q.as_deref().filter(|q| !q.is_empty()) {
        let needle = q.to_lowercase();
        teams.retain(|t: &TeamSummary| t.name.to_lowercase().contains(&needle));
    }
    teams.sort_by(|a, b| a.name.cmp(&b.name));
    if params.order.as_deref() == Some("desc") {
        teams.reverse();
    }
    Json(paginate(teams, &params)).into_response()
}

async fn get_policy(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user = identify(&state, &headers);
    let policy = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    if !principal(&state, &user).is_admin(&policy) {
        return Json(Message::error("", "Forbidden")).into_response();
    }
    Json(policy).into_response()
}

async fn post_policy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new_policy): Json<UserAccessPolicy>,
) -> Response {
    let user = identify(&state, &headers);
    let current = state.engine.core.policy.read().expect("policy lock poisoned").clone();
    if !principal(&state, &user).is_admin(&current) {
        return Json(Message::error("", "Forbidden")).into_response();
    }
    if let Some(forwarded) = forward_write(
        &state,
        "/api/admin/policy",
        user.as_deref(),
        &serde_json::to_value(&new_policy).unwrap_or_default(),
    )
    .await
    {
        return forwarded;
    }
    match state
        .engine
        .commit
        .submit(crate::raft::Command::UpdateAccessPolicy {
            policy: Box::new(new_policy),
        })
        .await
    {
        Ok(_) => Json(Message::ack("", "")).into_response(),
        Err(e) => Json(Message::from(&e)).into_response(),
    }
}
