// Scenario coverage for the optimistic-concurrency sync protocol at the hub
// level, on a standalone engine.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use scorebook::Engine;
use scorebook::config::Config;
use scorebook::hub::ResourceKind;
use scorebook::model::ActionRecord;
use scorebook::server::message::{Message, msg_type};

const OWNER: &str = "u@e";
const START_ID: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";

fn engine(dir: &tempfile::TempDir) -> Arc<Engine> {
    let mut cfg = Config::for_data_dir(dir.path());
    cfg.use_mock_auth = true;
    Engine::standalone(cfg).unwrap()
}

fn start_action(game_id: &str) -> ActionRecord {
    let mut rec = ActionRecord::new(START_ID, "GAME_START").with_payload(json!({
        "gameId": game_id,
        "owner": OWNER,
        "home": "A",
        "away": "B",
    }));
    rec.schema_version = Some(3);
    rec
}

fn pitch() -> ActionRecord {
    ActionRecord::new(Uuid::new_v4().to_string(), "PITCH").with_payload(json!({
        "activeCtx": {"b": 0, "i": 1, "col": "col-1-0"},
        "outcome": "ball",
    }))
}

fn action_msg(game_id: &str, action: ActionRecord, base: &str) -> Message {
    Message {
        kind: msg_type::ACTION.into(),
        game_id: game_id.to_string(),
        action: Some(action),
        base_revision: Some(base.to_string()),
        ..Default::default()
    }
}

async fn bootstrap(engine: &Arc<Engine>) -> (String, Arc<scorebook::hub::Hub>) {
    let game_id = Uuid::new_v4().to_string();
    let hub = engine.hubs.get_hub(ResourceKind::Game, &game_id);
    let reply = hub
        .process_action(&action_msg(&game_id, start_action(&game_id), ""), Some(OWNER), None)
        .await;
    assert_eq!(reply.kind, msg_type::ACK, "bootstrap failed: {:?}", reply.error);
    assert_eq!(reply.base_revision.as_deref(), Some(START_ID));
    (game_id, hub)
}

#[tokio::test]
async fn happy_path_appends_action() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let reply = hub
        .process_action(&action_msg(&game_id, pitch(), START_ID), Some(OWNER), None)
        .await;
    assert_eq!(reply.kind, msg_type::ACK);

    let game = engine.core.games.load(&game_id).unwrap();
    assert_eq!(game.action_log.len(), 2);
    assert_eq!(game.last_action_id, reply.base_revision.unwrap());
}

#[tokio::test]
async fn idempotent_retry_leaves_log_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let msg = action_msg(&game_id, pitch(), START_ID);
    let first = hub.process_action(&msg, Some(OWNER), None).await;
    assert_eq!(first.kind, msg_type::ACK);
    // Identical resend, as a client would after losing the response.
    let second = hub.process_action(&msg, Some(OWNER), None).await;
    assert_eq!(second.kind, msg_type::ACK);
    assert_eq!(second.base_revision, first.base_revision);
    assert_eq!(engine.core.games.load(&game_id).unwrap().action_log.len(), 2);
}

#[tokio::test]
async fn conflict_then_rebase() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    // Client A wins the race.
    let x = pitch();
    let reply = hub
        .process_action(&action_msg(&game_id, x.clone(), START_ID), Some(OWNER), None)
        .await;
    assert_eq!(reply.kind, msg_type::ACK);

    // Client B claims the same base and must rebase.
    let y = pitch();
    let conflict = hub
        .process_action(&action_msg(&game_id, y.clone(), START_ID), Some(OWNER), None)
        .await;
    assert_eq!(conflict.kind, msg_type::CONFLICT);
    assert_eq!(conflict.base_revision.as_deref(), Some(x.id.as_str()));

    let rebased = hub
        .process_action(&action_msg(&game_id, y.clone(), &x.id), Some(OWNER), None)
        .await;
    assert_eq!(rebased.kind, msg_type::ACK);

    let game = engine.core.games.load(&game_id).unwrap();
    let ids: Vec<&str> = game.action_log.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec![START_ID, x.id.as_str(), y.id.as_str()]);
}

#[tokio::test]
async fn partial_overlap_accepts_tail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let b = pitch();
    let reply = hub
        .process_action(&action_msg(&game_id, b.clone(), START_ID), Some(OWNER), None)
        .await;
    assert_eq!(reply.kind, msg_type::ACK);

    // Retried batch [B, C] with base=start: B already landed, C is new.
    let c = pitch();
    let msg = Message {
        kind: msg_type::ACTION.into(),
        game_id: game_id.clone(),
        actions: Some(vec![b.clone(), c.clone()]),
        base_revision: Some(START_ID.to_string()),
        ..Default::default()
    };
    let reply = hub.process_action(&msg, Some(OWNER), None).await;
    assert_eq!(reply.kind, msg_type::ACK);

    let game = engine.core.games.load(&game_id).unwrap();
    assert_eq!(game.action_log.len(), 3);
    assert_eq!(game.last_action_id, c.id);
}

#[tokio::test]
async fn divergent_batch_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let b = pitch();
    hub.process_action(&action_msg(&game_id, b.clone(), START_ID), Some(OWNER), None)
        .await;

    // [X, C] with base=start does not line up with the server's [B].
    let msg = Message {
        kind: msg_type::ACTION.into(),
        game_id: game_id.clone(),
        actions: Some(vec![pitch(), pitch()]),
        base_revision: Some(START_ID.to_string()),
        ..Default::default()
    };
    let reply = hub.process_action(&msg, Some(OWNER), None).await;
    assert_eq!(reply.kind, msg_type::CONFLICT);
    assert_eq!(reply.error.as_deref(), Some("History divergence"));
    assert_eq!(reply.base_revision.as_deref(), Some(b.id.as_str()));
    assert_eq!(engine.core.games.load(&game_id).unwrap().action_log.len(), 2);
}

#[tokio::test]
async fn unknown_base_conflicts_with_head() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let msg = action_msg(&game_id, pitch(), &Uuid::new_v4().to_string());
    let reply = hub.process_action(&msg, Some(OWNER), None).await;
    assert_eq!(reply.kind, msg_type::CONFLICT);
    assert_eq!(reply.base_revision.as_deref(), Some(START_ID));
}

#[tokio::test]
async fn join_catches_up_or_flags_divergence() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;
    let x = pitch();
    hub.process_action(&action_msg(&game_id, x.clone(), START_ID), Some(OWNER), None)
        .await;

    // Plain attach.
    let reply = hub.join(Some(OWNER), None).await;
    assert_eq!(reply.kind, msg_type::ACK);
    assert_eq!(reply.base_revision.as_deref(), Some(x.id.as_str()));

    // Catch-up from the start action.
    let reply = hub.join(Some(OWNER), Some(START_ID)).await;
    assert_eq!(reply.kind, msg_type::SYNC_UPDATE);
    let actions = reply.actions.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].id, x.id);

    // A revision the server never saw.
    let reply = hub
        .join(Some(OWNER), Some(&Uuid::new_v4().to_string()))
        .await;
    assert_eq!(reply.kind, msg_type::CONFLICT);
    assert_eq!(reply.error.as_deref(), Some("divergent"));
}

#[tokio::test]
async fn broadcast_reaches_subscribers_but_not_originator() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let (originator_id, originator_rx) = hub.subscribe(Some(OWNER.to_string()));
    let (_, observer_rx) = hub.subscribe(Some("watcher@e".to_string()));

    let x = pitch();
    let reply = hub
        .process_action(
            &action_msg(&game_id, x.clone(), START_ID),
            Some(OWNER),
            Some(originator_id),
        )
        .await;
    assert_eq!(reply.kind, msg_type::ACK);

    let update = observer_rx.recv().await.unwrap();
    assert_eq!(update.kind, msg_type::SYNC_UPDATE);
    assert_eq!(update.actions.unwrap()[0].id, x.id);
    assert!(originator_rx.try_recv().is_err());
}

#[tokio::test]
async fn writes_without_permission_are_rejected_in_band() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    let (game_id, hub) = bootstrap(&engine).await;

    let reply = hub
        .process_action(
            &action_msg(&game_id, pitch(), START_ID),
            Some("stranger@e"),
            None,
        )
        .await;
    assert_eq!(reply.kind, msg_type::ERROR);
    assert!(reply.error.unwrap().contains("Forbidden"));

    // Anonymous writes are never accepted either.
    let reply = hub
        .process_action(&action_msg(&game_id, pitch(), START_ID), None, None)
        .await;
    assert_eq!(reply.kind, msg_type::ERROR);
}

#[tokio::test]
async fn empty_base_on_empty_log_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);
    // bootstrap() already covers BaseRevision="" on an empty log; assert the
    // head it reported stuck.
    let (game_id, _) = bootstrap(&engine).await;
    assert_eq!(
        engine.core.games.load(&game_id).unwrap().last_action_id,
        START_ID
    );
}
