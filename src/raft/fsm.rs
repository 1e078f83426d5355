use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::core::Core;
use crate::error::{EngineError, Result};
use crate::hub::{HubManager, ResourceKind};
use crate::model::{ActionRecord, Entity, Game, Team, now_ns};
use crate::raft::command::Command;
use crate::raft::log_store::LogEntry;

/// Durable state-machine bookkeeping, persisted as `fsm_state.json` at
/// snapshot time and on clean shutdown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsmState {
    pub last_applied_index: u64,
    pub timestamp: i64,
}

/// Result of applying one committed command.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub index: u64,
    pub changed: bool,
    pub game: Option<Box<Game>>,
    pub team: Option<Box<Team>>,
    pub appended: Vec<ActionRecord>,
}

enum SideEffect {
    GameUpdated {
        game: Box<Game>,
        prev: Option<Box<Game>>,
        appended: Vec<ActionRecord>,
        origin: Option<String>,
    },
    GameDeleted {
        game: Box<Game>,
    },
    TeamUpdated {
        team: Box<Team>,
        prev: Option<Box<Team>>,
    },
    TeamDeleted {
        team: Box<Team>,
    },
    SysChanged {
        nodes_changed: bool,
        saw_other_node: bool,
        policy_changed: bool,
    },
}

type WorkerResult = (Vec<(u64, Result<ApplyOutcome>)>, Option<SideEffect>);

/// The replicated state machine: deterministic application of committed
/// commands onto the entity stores. Under clustered mode writes go through
/// the in-memory cache and dirty set only; disk catches up at snapshot time,
/// on the periodic flush tick, and at shutdown.
pub struct StateMachine {
    core: Arc<Core>,
    hubs: OnceLock<Arc<HubManager>>,
    node_id: String,
    delayed: bool,
    state: Mutex<FsmState>,
    initialized: Mutex<bool>,
    local_apply: Mutex<()>,
}

impl StateMachine {
    pub fn new(core: Arc<Core>, node_id: String, delayed: bool, bootstrap: bool) -> Self {
        let state = crate::store::read_blob::<FsmState>(&core.keys, &Self::state_path(&core))
            .ok()
            .flatten()
            .unwrap_or_default();
        let initialized = bootstrap || Self::initialized_path(&core).exists();
        Self {
            core,
            hubs: OnceLock::new(),
            node_id,
            delayed,
            state: Mutex::new(state),
            initialized: Mutex::new(initialized),
            local_apply: Mutex::new(()),
        }
    }

    fn state_path(core: &Core) -> PathBuf {
        core.data_dir.join("fsm_state.json")
    }

    fn initialized_path(core: &Core) -> PathBuf {
        core.data_dir.join("initialized")
    }

    /// Wire up the hub manager once both sides exist; the state machine
    /// pushes apply side-effects into hubs, hubs push commands back through
    /// the commit pipeline.
    pub fn set_hubs(&self, hubs: Arc<HubManager>) {
        let _ = self.hubs.set(hubs);
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().expect("fsm state lock poisoned").last_applied_index
    }

    pub fn set_last_applied(&self, index: u64) {
        let mut state = self.state.lock().expect("fsm state lock poisoned");
        state.last_applied_index = state.last_applied_index.max(index);
        state.timestamp = now_ns();
    }

    /// A node is initialized once it has seen any other node's metadata, or
    /// when it bootstrapped the cluster. Survives restarts via a marker
    /// file.
    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock().expect("init lock poisoned")
    }

    pub fn mark_initialized(&self) {
        let mut flag = self.initialized.lock().expect("init lock poisoned");
        if !*flag {
            *flag = true;
            if let Err(e) = std::fs::write(Self::initialized_path(&self.core), b"1") {
                log::warn!("failed to persist initialized marker: {e}");
            }
        }
    }

    pub fn persist_state(&self) -> Result<()> {
        let state = *self.state.lock().expect("fsm state lock poisoned");
        crate::store::write_blob(&self.core.keys, &Self::state_path(&self.core), &state)
    }

    /// Standalone write path: synthesize the next index and apply
    /// immediately with write-through persistence.
    pub fn apply_local(&self, cmd: Command) -> Result<ApplyOutcome> {
        // Serialized so concurrent hubs get distinct synthetic indices.
        let _serial = self.local_apply.lock().expect("local apply lock poisoned");
        let index = self.last_applied() + 1;
        let entry = LogEntry {
            index,
            term: 0,
            command: cmd,
        };
        match self.apply_batch(std::slice::from_ref(&entry)).pop() {
            Some((_, outcome)) => outcome,
            None => Err(EngineError::Internal("empty apply batch".into())),
        }
    }

    /// Apply a batch of committed entries. Entries are grouped by resource
    /// key; each group runs on its own worker in log order, persisting its
    /// resource once at the end. Side-effects (registry, index files, hub
    /// fanout) run sequentially after every worker finished.
    pub fn apply_batch(&self, entries: &[LogEntry]) -> Vec<(u64, Result<ApplyOutcome>)> {
        let last_applied = self.last_applied();
        let mut results: Vec<(u64, Result<ApplyOutcome>)> = Vec::new();
        let mut fresh: Vec<&LogEntry> = Vec::new();
        for entry in entries {
            if entry.index <= last_applied {
                // Replay of something this store already absorbed.
                results.push((
                    entry.index,
                    Ok(ApplyOutcome {
                        index: entry.index,
                        ..Default::default()
                    }),
                ));
            } else {
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return results;
        }

        let mut groups: HashMap<String, Vec<&LogEntry>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for entry in &fresh {
            let key = entry.command.resource_key();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(*entry);
        }

        let mut worker_out: Vec<WorkerResult> = Vec::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for key in &order {
                let items = groups.remove(key).expect("group exists");
                let key = key.clone();
                handles.push(scope.spawn(move || self.apply_group(&key, &items)));
            }
            for handle in handles {
                match handle.join() {
                    Ok(out) => worker_out.push(out),
                    Err(_) => log::error!("apply worker panicked; batch results incomplete"),
                }
            }
        });

        let mut effects = Vec::new();
        for (mut outcomes, effect) in worker_out {
            results.append(&mut outcomes);
            if let Some(effect) = effect {
                effects.push(effect);
            }
        }
        results.sort_by_key(|(index, _)| *index);

        for effect in effects {
            self.apply_side_effect(effect);
        }

        if let Some(max) = fresh.iter().map(|e| e.index).max() {
            self.set_last_applied(max);
        }
        results
    }

    fn flush(&self) -> bool {
        !self.delayed
    }

    fn apply_group(&self, key: &str, items: &[&LogEntry]) -> WorkerResult {
        if let Some(id) = key.strip_prefix("game:") {
            self.apply_game_group(id, items)
        } else if let Some(id) = key.strip_prefix("team:") {
            self.apply_team_group(id, items)
        } else {
            self.apply_sys_group(items)
        }
    }

    fn apply_game_group(&self, id: &str, items: &[&LogEntry]) -> WorkerResult {
        let mut outcomes = Vec::with_capacity(items.len());
        let prev = self.core.games.load(id).ok().map(Box::new);
        let mut game: Option<Game> = prev.as_deref().cloned();
        let mut appended_all: Vec<ActionRecord> = Vec::new();
        let mut origin: Option<String> = None;
        let mut deleted = false;

        for entry in items {
            if let Some(g) = &game
                && entry.index <= g.last_raft_index
            {
                outcomes.push((
                    entry.index,
                    Ok(ApplyOutcome {
                        index: entry.index,
                        game: game.clone().map(Box::new),
                        ..Default::default()
                    }),
                ));
                continue;
            }
            let outcome = match &entry.command {
                Command::SaveGame {
                    game: incoming,
                    force,
                    origin: cmd_origin,
                    ..
                } => {
                    if origin.is_none() {
                        origin = cmd_origin.clone();
                    }
                    match save_game_checked(game.as_ref(), incoming, *force) {
                        Ok(appended) => {
                            let mut next = (**incoming).clone();
                            next.set_last_raft_index(entry.index);
                            appended_all.extend(appended.iter().cloned());
                            game = Some(next);
                            deleted = false;
                            Ok(ApplyOutcome {
                                index: entry.index,
                                changed: true,
                                game: game.clone().map(Box::new),
                                appended,
                                ..Default::default()
                            })
                        }
                        Err(e) => Err(e),
                    }
                }
                Command::ApplyAction {
                    actions,
                    origin: cmd_origin,
                    ..
                } => {
                    if origin.is_none() {
                        origin = cmd_origin.clone();
                    }
                    let g = game.get_or_insert_with(|| Game::new(id));
                    let mut appended = Vec::new();
                    let mut err = None;
                    for action in actions {
                        match crate::action::apply_action(g, action) {
                            Ok(true) => appended.push(action.clone()),
                            Ok(false) => {}
                            Err(e) => {
                                err = Some(e);
                                break;
                            }
                        }
                    }
                    match err {
                        Some(e) => Err(e),
                        None => {
                            g.set_last_raft_index(entry.index);
                            appended_all.extend(appended.iter().cloned());
                            Ok(ApplyOutcome {
                                index: entry.index,
                                changed: !appended.is_empty(),
                                game: Some(Box::new(g.clone())),
                                appended,
                                ..Default::default()
                            })
                        }
                    }
                }
                Command::DeleteGame { .. } => match &mut game {
                    Some(g) => {
                        g.mark_deleted(now_ns());
                        g.set_last_raft_index(entry.index);
                        deleted = true;
                        Ok(ApplyOutcome {
                            index: entry.index,
                            changed: true,
                            game: Some(Box::new(g.clone())),
                            ..Default::default()
                        })
                    }
                    None => Err(EngineError::NotExist(id.to_string())),
                },
                other => Err(EngineError::Internal(format!(
                    "command {:?} misrouted to game worker",
                    other.resource_key()
                ))),
            };
            outcomes.push((entry.index, outcome));
        }

        let effect = match &game {
            Some(g) => {
                if let Err(e) = self.core.games.save_in_memory(g, self.flush()) {
                    log::error!("persisting game {id} failed: {e}");
                }
                if deleted {
                    Some(SideEffect::GameDeleted {
                        game: Box::new(g.clone()),
                    })
                } else {
                    Some(SideEffect::GameUpdated {
                        game: Box::new(g.clone()),
                        prev,
                        appended: appended_all,
                        origin,
                    })
                }
            }
            None => None,
        };
        (outcomes, effect)
    }

    fn apply_team_group(&self, id: &str, items: &[&LogEntry]) -> WorkerResult {
        let mut outcomes = Vec::with_capacity(items.len());
        let prev = self.core.teams.load(id).ok().map(Box::new);
        let mut team: Option<Team> = prev.as_deref().cloned();
        let mut deleted = false;

        for entry in items {
            if let Some(t) = &team
                && entry.index <= t.last_raft_index
            {
                outcomes.push((
                    entry.index,
                    Ok(ApplyOutcome {
                        index: entry.index,
                        team: team.clone().map(Box::new),
                        ..Default::default()
                    }),
                ));
                continue;
            }
            let outcome = match &entry.command {
                Command::SaveTeam { team: incoming, .. } => {
                    let mut next = (**incoming).clone();
                    next.set_last_raft_index(entry.index);
                    team = Some(next);
                    deleted = false;
                    Ok(ApplyOutcome {
                        index: entry.index,
                        changed: true,
                        team: team.clone().map(Box::new),
                        ..Default::default()
                    })
                }
                Command::DeleteTeam { .. } => match &mut team {
                    Some(t) => {
                        t.mark_deleted(now_ns());
                        t.set_last_raft_index(entry.index);
                        deleted = true;
                        Ok(ApplyOutcome {
                            index: entry.index,
                            changed: true,
                            team: Some(Box::new(t.clone())),
                            ..Default::default()
                        })
                    }
                    None => Err(EngineError::NotExist(id.to_string())),
                },
                other => Err(EngineError::Internal(format!(
                    "command {:?} misrouted to team worker",
                    other.resource_key()
                ))),
            };
            outcomes.push((entry.index, outcome));
        }

        let effect = match &team {
            Some(t) => {
                if let Err(e) = self.core.teams.save_in_memory(t, self.flush()) {
                    log::error!("persisting team {id} failed: {e}");
                }
                if deleted {
                    Some(SideEffect::TeamDeleted {
                        team: Box::new(t.clone()),
                    })
                } else {
                    Some(SideEffect::TeamUpdated {
                        team: Box::new(t.clone()),
                        prev,
                    })
                }
            }
            None => None,
        };
        (outcomes, effect)
    }

    fn apply_sys_group(&self, items: &[&LogEntry]) -> WorkerResult {
        let mut outcomes = Vec::with_capacity(items.len());
        let mut nodes_changed = false;
        let mut saw_other_node = false;
        let mut policy_changed = false;

        for entry in items {
            let outcome = match &entry.command {
                Command::NodeMeta { node } => match self.core.nodes.upsert(node.clone()) {
                    Ok(()) => {
                        nodes_changed = true;
                        if node.node_id != self.node_id {
                            saw_other_node = true;
                        }
                        Ok(ApplyOutcome {
                            index: entry.index,
                            changed: true,
                            ..Default::default()
                        })
                    }
                    Err(e) => Err(e),
                },
                Command::NodeLeft { node } => {
                    self.core.nodes.remove(&node.node_id);
                    nodes_changed = true;
                    Ok(ApplyOutcome {
                        index: entry.index,
                        changed: true,
                        ..Default::default()
                    })
                }
                Command::UpdateAccessPolicy { policy } => {
                    *self.core.policy.write().expect("policy lock poisoned") =
                        (**policy).clone();
                    policy_changed = true;
                    Ok(ApplyOutcome {
                        index: entry.index,
                        changed: true,
                        ..Default::default()
                    })
                }
                Command::MetricsUpdate { batch } => {
                    self.core.metrics.merge_batch(batch.clone());
                    Ok(ApplyOutcome {
                        index: entry.index,
                        changed: true,
                        ..Default::default()
                    })
                }
                other => Err(EngineError::Internal(format!(
                    "command {:?} misrouted to sys worker",
                    other.resource_key()
                ))),
            };
            outcomes.push((entry.index, outcome));
        }

        let effect = if policy_changed || nodes_changed {
            Some(SideEffect::SysChanged {
                nodes_changed,
                saw_other_node,
                policy_changed,
            })
        } else {
            None
        };
        (outcomes, effect)
    }

    fn apply_side_effect(&self, effect: SideEffect) {
        match effect {
            SideEffect::GameUpdated {
                game,
                prev,
                appended,
                origin,
            } => {
                self.core.registry.update_game(&game);
                if let Err(e) = self.core.index_game(&game, prev.as_deref(), self.flush()) {
                    log::warn!("index maintenance for game {} failed: {e}", game.id);
                }
                // The originating node's hub already broadcast to its own
                // subscribers with the submitter skipped.
                if origin.as_deref() != Some(self.node_id.as_str())
                    && let Some(hubs) = self.hubs.get()
                    && let Some(hub) = hubs.existing_hub(ResourceKind::Game, &game.id)
                {
                    hub.note_remote_apply(&game, &appended);
                }
            }
            SideEffect::GameDeleted { game } => {
                self.core.registry.delete_game(&game.id, game.deleted_at());
                if let Err(e) = self.core.unindex_game(&game, self.flush()) {
                    log::warn!("index cleanup for game {} failed: {e}", game.id);
                }
            }
            SideEffect::TeamUpdated { team, prev } => {
                self.core.registry.update_team(&team);
                if let Err(e) = self.core.index_team(&team, prev.as_deref(), self.flush()) {
                    log::warn!("index maintenance for team {} failed: {e}", team.id);
                }
            }
            SideEffect::TeamDeleted { team } => {
                self.core.registry.delete_team(&team.id, team.deleted_at());
                if let Err(e) = self.core.unindex_team(&team, self.flush()) {
                    log::warn!("index cleanup for team {} failed: {e}", team.id);
                }
            }
            SideEffect::SysChanged {
                nodes_changed,
                saw_other_node,
                policy_changed,
            } => {
                if saw_other_node {
                    self.mark_initialized();
                }
                if nodes_changed
                    && let Err(e) = self.core.save_nodes()
                {
                    log::warn!("persisting nodes.json failed: {e}");
                }
                if policy_changed
                    && let Err(e) = self.core.save_policy()
                {
                    log::warn!("persisting access policy failed: {e}");
                }
            }
        }
    }
}

/// Conflict detection for full-game overwrites: without `force`, the
/// incoming log must be a strict forward extension of the existing one.
/// Returns the newly appended suffix on acceptance.
fn save_game_checked(
    existing: Option<&Game>,
    incoming: &Game,
    force: bool,
) -> Result<Vec<ActionRecord>> {
    let Some(existing) = existing else {
        return Ok(incoming.action_log.clone());
    };
    if force {
        return Ok(Vec::new());
    }
    let e = &existing.action_log;
    let i = &incoming.action_log;
    if i.len() < e.len() {
        return Err(EngineError::Divergent {
            head: existing.head().to_string(),
        });
    }
    for (pos, old) in e.iter().enumerate() {
        if old.id != i[pos].id {
            return Err(EngineError::Divergent {
                head: existing.head().to_string(),
            });
        }
    }
    Ok(i[e.len()..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::action::kind;
    use crate::store::KeyRing;
    use serde_json::json;
    use uuid::Uuid;

    fn machine(delayed: bool) -> (tempfile::TempDir, Arc<StateMachine>) {
        let dir = tempfile::tempdir().unwrap();
        let core = Arc::new(Core::open(dir.path(), Arc::new(KeyRing::ephemeral())).unwrap());
        let sm = Arc::new(StateMachine::new(core, "n1".into(), delayed, true));
        (dir, sm)
    }

    fn uid() -> String {
        Uuid::new_v4().to_string()
    }

    fn entry(index: u64, cmd: Command) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            command: cmd,
        }
    }

    fn start_action(game_id: &str) -> ActionRecord {
        ActionRecord::new(uid(), kind::GAME_START)
            .with_payload(json!({"owner": "u@e", "away": "B", "home": "A", "gameId": game_id}))
    }

    #[test]
    fn apply_creates_game_and_indexes() {
        let (_dir, sm) = machine(false);
        let gid = uid();
        let outcome = sm
            .apply_local(Command::ApplyAction {
                game_id: gid.clone(),
                actions: vec![start_action(&gid)],
                origin: None,
            })
            .unwrap();
        assert!(outcome.changed);
        let game = sm.core().games.load(&gid).unwrap();
        assert_eq!(game.owner, "u@e");
        assert_eq!(game.last_raft_index, outcome.index);
        assert!(sm.core().registry.games_owned_by("u@e").contains(&gid));
        assert!(sm.core().users.load("u@e").unwrap().games.contains(&gid));
    }

    #[test]
    fn replayed_index_is_skipped() {
        let (_dir, sm) = machine(false);
        let gid = uid();
        let cmd = Command::ApplyAction {
            game_id: gid.clone(),
            actions: vec![start_action(&gid)],
            origin: None,
        };
        let entry1 = entry(1, cmd.clone());
        let first = sm.apply_batch(std::slice::from_ref(&entry1));
        assert!(first[0].1.as_ref().unwrap().changed);
        // Same committed entry delivered again.
        let second = sm.apply_batch(std::slice::from_ref(&entry1));
        assert!(!second[0].1.as_ref().unwrap().changed);
        assert_eq!(sm.core().games.load(&gid).unwrap().action_log.len(), 1);
    }

    #[test]
    fn last_raft_index_is_monotone() {
        let (_dir, sm) = machine(false);
        let gid = uid();
        let mut last = 0;
        for _ in 0..3 {
            let outcome = sm
                .apply_local(Command::ApplyAction {
                    game_id: gid.clone(),
                    actions: vec![ActionRecord::new(uid(), kind::PITCH)],
                    origin: None,
                })
                .unwrap();
            let game = outcome.game.unwrap();
            assert!(game.last_raft_index > last);
            last = game.last_raft_index;
        }
    }

    #[test]
    fn save_game_rejects_forked_history() {
        let (_dir, sm) = machine(false);
        let gid = uid();
        let a = ActionRecord::new(uid(), kind::PITCH);
        let b = ActionRecord::new(uid(), kind::PITCH);
        sm.apply_local(Command::ApplyAction {
            game_id: gid.clone(),
            actions: vec![a.clone(), b.clone()],
            origin: None,
        })
        .unwrap();

        // Shorter incoming log: a rewind.
        let mut rewound = Game::new(gid.clone());
        rewound.action_log = vec![a.clone()];
        rewound.last_action_id = a.id.clone();
        let err = sm
            .apply_local(Command::SaveGame {
                id: gid.clone(),
                game: Box::new(rewound),
                force: false,
                origin: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Divergent { .. }));

        // Same length, diverging id.
        let mut forked = Game::new(gid.clone());
        forked.action_log = vec![a.clone(), ActionRecord::new(uid(), kind::PITCH)];
        let err = sm
            .apply_local(Command::SaveGame {
                id: gid.clone(),
                game: Box::new(forked),
                force: false,
                origin: None,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Divergent { .. }));

        // Strict extension is accepted.
        let mut extended = Game::new(gid.clone());
        let c = ActionRecord::new(uid(), kind::PITCH);
        extended.action_log = vec![a, b, c.clone()];
        extended.last_action_id = c.id.clone();
        let outcome = sm
            .apply_local(Command::SaveGame {
                id: gid.clone(),
                game: Box::new(extended),
                force: false,
                origin: None,
            })
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.appended.len(), 1);
    }

    #[test]
    fn delayed_mode_defers_disk_until_flush() {
        let (_dir, sm) = machine(true);
        let gid = uid();
        sm.apply_local(Command::ApplyAction {
            game_id: gid.clone(),
            actions: vec![start_action(&gid)],
            origin: None,
        })
        .unwrap();
        assert!(!sm.core().games.file_path(&gid).exists());
        assert!(sm.core().games.dirty_count() > 0);
        sm.core().flush_all().unwrap();
        assert!(sm.core().games.file_path(&gid).exists());
    }

    #[test]
    fn batch_groups_preserve_per_resource_order() {
        let (_dir, sm) = machine(false);
        let g1 = uid();
        let g2 = uid();
        let entries = vec![
            entry(
                1,
                Command::ApplyAction {
                    game_id: g1.clone(),
                    actions: vec![start_action(&g1)],
                    origin: None,
                },
            ),
            entry(
                2,
                Command::ApplyAction {
                    game_id: g2.clone(),
                    actions: vec![start_action(&g2)],
                    origin: None,
                },
            ),
            entry(
                3,
                Command::ApplyAction {
                    game_id: g1.clone(),
                    actions: vec![ActionRecord::new(uid(), kind::PITCH)],
                    origin: None,
                },
            ),
        ];
        let results = sm.apply_batch(&entries);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(sm.core().games.load(&g1).unwrap().action_log.len(), 2);
        assert_eq!(sm.core().games.load(&g2).unwrap().action_log.len(), 1);
        assert_eq!(sm.last_applied(), 3);
    }

    #[test]
    fn node_meta_from_peer_marks_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let core = Arc::new(Core::open(dir.path(), Arc::new(KeyRing::ephemeral())).unwrap());
        let sm = StateMachine::new(core, "n1".into(), false, false);
        assert!(!sm.is_initialized());
        sm.apply_local(Command::NodeMeta {
            node: crate::model::NodeMeta::new("n2"),
        })
        .unwrap();
        assert!(sm.is_initialized());
        // Marker survives a rebuild of the state machine.
        let sm2 = StateMachine::new(Arc::clone(sm.core()), "n1".into(), false, false);
        assert!(sm2.is_initialized());
    }

    #[test]
    fn identical_sequences_yield_identical_stores() {
        let (_dir1, sm1) = machine(false);
        let (_dir2, sm2) = machine(false);
        let gid = uid();
        let actions: Vec<ActionRecord> = (0..5)
            .map(|_| ActionRecord::new(uid(), kind::PITCH))
            .collect();
        let mut cmds = vec![Command::ApplyAction {
            game_id: gid.clone(),
            actions: vec![start_action(&gid)],
            origin: None,
        }];
        cmds.extend(actions.iter().map(|a| Command::ApplyAction {
            game_id: gid.clone(),
            actions: vec![a.clone()],
            origin: None,
        }));
        for cmd in &cmds {
            sm1.apply_local(cmd.clone()).unwrap();
            sm2.apply_local(cmd.clone()).unwrap();
        }
        sm1.core().flush_all().unwrap();
        sm2.core().flush_all().unwrap();
        let a = sm1.core().games.load(&gid).unwrap();
        let b = sm2.core().games.load(&gid).unwrap();
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }
}
