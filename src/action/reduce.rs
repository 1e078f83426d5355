use crate::action::validate::{GameStartPayload, MetadataPayload};
use crate::error::{EngineError, Result};
use crate::model::{ActionRecord, EntityStatus, Game, action::kind};

/// How far back the duplicate-id scan reaches. A replay separated from its
/// original by more than this many actions will append twice; the window is
/// sized well past any realistic retry horizon.
pub const DUP_SCAN_WINDOW: usize = 100;

fn is_duplicate(game: &Game, id: &str) -> bool {
    game.action_log
        .iter()
        .rev()
        .take(DUP_SCAN_WINDOW)
        .any(|rec| rec.id == id)
}

fn fill_from_start(game: &mut Game, rec: &ActionRecord) {
    let Some(raw) = rec.payload.as_ref() else {
        return;
    };
    let Ok(p) = serde_json::from_str::<GameStartPayload>(raw.get()) else {
        return;
    };
    if let Some(owner) = p.owner {
        game.owner = owner;
    }
    if let Some(date) = p.date {
        game.date = date;
    }
    if let Some(location) = p.location {
        game.location = location;
    }
    if let Some(event) = p.event {
        game.event = event;
    }
    if let Some(away) = p.away {
        game.away = away;
    }
    if let Some(home) = p.home {
        game.home = home;
    }
    if let Some(away_team_id) = p.away_team_id {
        game.away_team_id = away_team_id;
    }
    if let Some(home_team_id) = p.home_team_id {
        game.home_team_id = home_team_id;
    }
    if let Some(permissions) = p.permissions {
        game.permissions = permissions;
    }
    game.schema_version = p
        .schema_version
        .or(rec.schema_version)
        .unwrap_or(crate::model::SCHEMA_VERSION);
}

fn patch_metadata(game: &mut Game, rec: &ActionRecord) {
    let Some(raw) = rec.payload.as_ref() else {
        return;
    };
    let Ok(p) = serde_json::from_str::<MetadataPayload>(raw.get()) else {
        return;
    };
    if let Some(date) = p.date {
        game.date = date;
    }
    if let Some(location) = p.location {
        game.location = location;
    }
    if let Some(event) = p.event {
        game.event = event;
    }
    if let Some(away) = p.away {
        game.away = away;
    }
    if let Some(home) = p.home {
        game.home = home;
    }
    if let Some(permissions) = p.permissions {
        game.permissions = permissions;
    }
}

/// Append one action to the log, maintaining derived metadata. Returns false
/// without touching the game when the id was seen within the scan window, so
/// client retries are free.
pub fn apply_action(game: &mut Game, rec: &ActionRecord) -> Result<bool> {
    if is_duplicate(game, &rec.id) {
        return Ok(false);
    }
    if game.status == EntityStatus::Final && !kind::is_metadata(&rec.kind) {
        return Err(EngineError::Malformed(
            "game is finalized; only metadata updates are allowed".into(),
        ));
    }

    match rec.kind.as_str() {
        kind::GAME_START => fill_from_start(game, rec),
        kind::GAME_METADATA_UPDATE => patch_metadata(game, rec),
        kind::GAME_FINALIZE => game.status = EntityStatus::Final,
        _ => {}
    }

    game.action_log.push(rec.clone());
    game.last_action_id = rec.id.clone();
    Ok(true)
}

/// Batch variant; "any changed" is the disjunction over the items.
pub fn apply_actions(game: &mut Game, recs: &[ActionRecord]) -> Result<bool> {
    let mut changed = false;
    for rec in recs {
        changed |= apply_action(game, rec)?;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn action(id: &str, kind: &str) -> ActionRecord {
        ActionRecord::new(id, kind)
    }

    fn uid() -> String {
        Uuid::new_v4().to_string()
    }

    #[test]
    fn append_updates_tail_pointer() {
        let mut game = Game::new(uid());
        let a = action(&uid(), kind::PITCH);
        assert!(apply_action(&mut game, &a).unwrap());
        assert_eq!(game.last_action_id, a.id);
        assert_eq!(game.action_log.len(), 1);
    }

    #[test]
    fn duplicate_within_window_is_elided() {
        let mut game = Game::new(uid());
        let a = action(&uid(), kind::PITCH);
        assert!(apply_action(&mut game, &a).unwrap());
        assert!(!apply_action(&mut game, &a).unwrap());
        assert_eq!(game.action_log.len(), 1);
    }

    #[test]
    fn duplicate_past_window_reappends() {
        // Documented limitation of the bounded scan.
        let mut game = Game::new(uid());
        let first = action(&uid(), kind::PITCH);
        apply_action(&mut game, &first).unwrap();
        for _ in 0..DUP_SCAN_WINDOW {
            apply_action(&mut game, &action(&uid(), kind::PITCH)).unwrap();
        }
        assert!(apply_action(&mut game, &first).unwrap());
        assert_eq!(game.action_log.len(), DUP_SCAN_WINDOW + 2);
    }

    #[test]
    fn game_start_fills_metadata() {
        let mut game = Game::new(uid());
        let start = action(&uid(), kind::GAME_START).with_payload(json!({
            "owner": "u@e",
            "away": "B",
            "home": "A",
            "event": "Friendly",
        }));
        apply_action(&mut game, &start).unwrap();
        assert_eq!(game.owner, "u@e");
        assert_eq!(game.home, "A");
        assert_eq!(game.away, "B");
        assert_eq!(game.schema_version, crate::model::SCHEMA_VERSION);
    }

    #[test]
    fn metadata_update_patches_selectively() {
        let mut game = Game::new(uid());
        game.event = "Opening Day".into();
        game.location = "Field 9".into();
        let patch = action(&uid(), kind::GAME_METADATA_UPDATE)
            .with_payload(json!({"location": "Field 2"}));
        apply_action(&mut game, &patch).unwrap();
        assert_eq!(game.location, "Field 2");
        assert_eq!(game.event, "Opening Day");
    }

    #[test]
    fn finalize_blocks_scoring_but_not_metadata() {
        let mut game = Game::new(uid());
        apply_action(&mut game, &action(&uid(), kind::GAME_FINALIZE)).unwrap();
        assert_eq!(game.status, EntityStatus::Final);

        let pitch = action(&uid(), kind::PITCH);
        assert!(apply_action(&mut game, &pitch).is_err());

        let patch = action(&uid(), kind::GAME_METADATA_UPDATE)
            .with_payload(json!({"event": "archived"}));
        assert!(apply_action(&mut game, &patch).unwrap());
    }

    #[test]
    fn batch_any_changed_is_disjunction() {
        let mut game = Game::new(uid());
        let a = action(&uid(), kind::PITCH);
        apply_action(&mut game, &a).unwrap();
        let b = action(&uid(), kind::PITCH);
        let changed = apply_actions(&mut game, &[a, b.clone()]).unwrap();
        assert!(changed);
        assert_eq!(game.last_action_id, b.id);
    }
}
