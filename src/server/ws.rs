use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::hub::{Hub, ResourceKind};
use crate::raft::transport::SECRET_HEADER;
use crate::server::message::{Message, msg_type};
use crate::server::{AppState, identify};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE: Duration = Duration::from_secs(75);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "gameId", default)]
    pub game_id: Option<String>,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let user = identify(&state, &headers);
    let game_id = query.game_id.unwrap_or_default();
    ws.on_upgrade(move |socket| connection(state, socket, game_id, user))
}

async fn send_json(out: &mpsc::Sender<WsMessage>, msg: &Message) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => out.send(WsMessage::Text(json.into())).await.is_ok(),
        Err(_) => false,
    }
}

/// One WebSocket connection serves one game. The connection starts in
/// Connected, moves to Joined on a successful JOIN, then accepts ACTIONs and
/// receives the hub's broadcasts. Malformed JSON closes the connection;
/// missed pongs past the deadline do too.
async fn connection(
    state: Arc<AppState>,
    socket: WebSocket,
    query_game: String,
    user: Option<String>,
) {
    use std::sync::atomic::Ordering;
    state.engine.connections.fetch_add(1, Ordering::Relaxed);

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(64);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let closing = matches!(frame, WsMessage::Close(_));
            if sink.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    let last_pong = Arc::new(Mutex::new(Instant::now()));
    let heartbeat = {
        let out = out_tx.clone();
        let last_pong = Arc::clone(&last_pong);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                if last_pong.lock().expect("pong lock poisoned").elapsed() > PONG_DEADLINE {
                    log::debug!("closing connection after missed pongs");
                    let _ = out.send(WsMessage::Close(None)).await;
                    break;
                }
                if out.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        })
    };

    let mut joined: Option<(Arc<Hub>, u64)> = None;
    let mut relay: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => {
                let Ok(mut msg) = serde_json::from_str::<Message>(text.as_str()) else {
                    // Unparseable frames terminate the connection.
                    break;
                };
                let game_id = if msg.game_id.is_empty() {
                    query_game.clone()
                } else {
                    msg.game_id.clone()
                };
                if game_id.is_empty() {
                    send_json(&out_tx, &Message::error("", "gameId is required")).await;
                    continue;
                }
                let kind = msg.kind.clone();
                match kind.as_str() {
                    msg_type::JOIN => {
                        let hub = state.engine.hubs.get_hub(ResourceKind::Game, &game_id);
                        let reply = hub
                            .join(user.as_deref(), msg.last_revision.as_deref())
                            .await;
                        let rejected = reply.kind == msg_type::ERROR;
                        if !rejected && joined.is_none() {
                            let (sub_id, rx) = hub.subscribe(user.clone());
                            let out = out_tx.clone();
                            relay = Some(tokio::spawn(async move {
                                while let Ok(update) = rx.recv().await {
                                    if !send_json(&out, &update).await {
                                        break;
                                    }
                                }
                            }));
                            joined = Some((Arc::clone(&hub), sub_id));
                        }
                        if !send_json(&out_tx, &reply).await {
                            break;
                        }
                    }
                    msg_type::ACTION => {
                        let Some((hub, sub_id)) = &joined else {
                            send_json(&out_tx, &Message::error(&game_id, "JOIN before ACTION"))
                                .await;
                            continue;
                        };
                        msg.game_id = game_id;
                        let reply = if state.engine.raft.is_some()
                            && !state.engine.is_leader().await
                        {
                            forward_action(&state, &msg, user.as_deref()).await
                        } else {
                            hub.process_action(&msg, user.as_deref(), Some(*sub_id)).await
                        };
                        if !send_json(&out_tx, &reply).await {
                            break;
                        }
                    }
                    other => {
                        send_json(
                            &out_tx,
                            &Message::error(&game_id, format!("unsupported message type {other}")),
                        )
                        .await;
                    }
                }
            }
            WsMessage::Ping(data) => {
                if out_tx.send(WsMessage::Pong(data)).await.is_err() {
                    break;
                }
            }
            WsMessage::Pong(_) => {
                *last_pong.lock().expect("pong lock poisoned") = Instant::now();
            }
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {}
        }
    }

    if let Some((hub, sub_id)) = joined {
        hub.unsubscribe(sub_id);
    }
    if let Some(relay) = relay {
        relay.abort();
    }
    heartbeat.abort();
    drop(out_tx);
    let _ = writer.await;
    state.engine.connections.fetch_sub(1, Ordering::Relaxed);
}

/// A follower cannot commit; hand the write to the leader over HTTP and
/// relay its reply. The WS connection itself stays local for broadcasts.
async fn forward_action(state: &AppState, msg: &Message, user: Option<&str>) -> Message {
    let Some(leader) = state.engine.leader_http_addr().await else {
        return Message::error(&msg.game_id, "leader unavailable");
    };
    let url = format!("http://{leader}/api/action");
    let mut req = state
        .forward
        .post(&url)
        .header(SECRET_HEADER, &state.engine.cfg.raft_secret)
        .json(msg);
    if let Some(user) = user {
        req = req.header("x-user-email", user);
    }
    match req.send().await {
        Ok(resp) => resp
            .json::<Message>()
            .await
            .unwrap_or_else(|_| Message::error(&msg.game_id, "leader unavailable")),
        Err(_) => Message::error(&msg.game_id, "leader unavailable"),
    }
}
