use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, Result};
use crate::metrics::MetricsStore;
use crate::model::{
    Game, GameUsersIndex, NodeMeta, Team, TeamGamesIndex, TeamUsersIndex, UserAccessPolicy,
    UserIndex,
};
use crate::registry::Registry;
use crate::store::{EntityStore, KeyRing};

/// Replicated node map plus trust-on-first-use key pinning. A node id seen
/// with a new public key is rejected until an operator removes the pin.
#[derive(Default)]
pub struct NodeTable {
    inner: RwLock<HashMap<String, NodeMeta>>,
    pinned: RwLock<HashMap<String, String>>,
}

impl NodeTable {
    pub fn upsert(&self, meta: NodeMeta) -> Result<()> {
        if !meta.public_key.is_empty() {
            let mut pinned = self.pinned.write().expect("node table lock poisoned");
            match pinned.get(&meta.node_id) {
                Some(known) if *known != meta.public_key => {
                    return Err(EngineError::Forbidden(format!(
                        "node {} presented a key that does not match its pin",
                        meta.node_id
                    )));
                }
                Some(_) => {}
                None => {
                    pinned.insert(meta.node_id.clone(), meta.public_key.clone());
                }
            }
        }
        self.inner
            .write()
            .expect("node table lock poisoned")
            .insert(meta.node_id.clone(), meta);
        Ok(())
    }

    pub fn remove(&self, node_id: &str) {
        self.inner
            .write()
            .expect("node table lock poisoned")
            .remove(node_id);
    }

    pub fn get(&self, node_id: &str) -> Option<NodeMeta> {
        self.inner
            .read()
            .expect("node table lock poisoned")
            .get(node_id)
            .cloned()
    }

    pub fn all(&self) -> HashMap<String, NodeMeta> {
        self.inner.read().expect("node table lock poisoned").clone()
    }

    pub fn replace_all(&self, nodes: HashMap<String, NodeMeta>) {
        let mut pinned = self.pinned.write().expect("node table lock poisoned");
        for meta in nodes.values() {
            if !meta.public_key.is_empty() {
                pinned
                    .entry(meta.node_id.clone())
                    .or_insert_with(|| meta.public_key.clone());
            }
        }
        drop(pinned);
        *self.inner.write().expect("node table lock poisoned") = nodes;
    }

    pub fn peer_ids(&self, not: &str) -> Vec<String> {
        self.inner
            .read()
            .expect("node table lock poisoned")
            .keys()
            .filter(|id| id.as_str() != not)
            .cloned()
            .collect()
    }
}

/// Everything a node knows locally: the entity stores, the registry built
/// over them, the replicated singletons, and local metrics. Owned behind an
/// `Arc` and shared by the hubs, the state machine and the HTTP surface.
pub struct Core {
    pub data_dir: PathBuf,
    pub keys: Arc<KeyRing>,
    pub games: EntityStore<Game>,
    pub teams: EntityStore<Team>,
    pub users: EntityStore<UserIndex>,
    pub team_games: EntityStore<TeamGamesIndex>,
    pub game_users: EntityStore<GameUsersIndex>,
    pub team_users: EntityStore<TeamUsersIndex>,
    pub registry: Registry,
    pub policy: RwLock<UserAccessPolicy>,
    pub nodes: NodeTable,
    pub metrics: MetricsStore,
}

impl Core {
    pub fn open(data_dir: &Path, keys: Arc<KeyRing>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let core = Self {
            games: EntityStore::open(data_dir, Arc::clone(&keys))?,
            teams: EntityStore::open(data_dir, Arc::clone(&keys))?,
            users: EntityStore::open(data_dir, Arc::clone(&keys))?,
            team_games: EntityStore::open(data_dir, Arc::clone(&keys))?,
            game_users: EntityStore::open(data_dir, Arc::clone(&keys))?,
            team_users: EntityStore::open(data_dir, Arc::clone(&keys))?,
            registry: Registry::new(),
            policy: RwLock::new(UserAccessPolicy::default()),
            nodes: NodeTable::default(),
            metrics: MetricsStore::new(256),
            keys,
            data_dir: data_dir.to_path_buf(),
        };
        core.load_singletons()?;
        core.registry.rebuild(&core.games, &core.teams)?;
        Ok(core)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.data_dir.join("sys_access_policy")
    }

    pub fn nodes_path(&self) -> PathBuf {
        self.data_dir.join("nodes.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.json")
    }

    fn load_singletons(&self) -> Result<()> {
        if let Some(policy) =
            crate::store::read_blob::<UserAccessPolicy>(&self.keys, &self.policy_path())?
        {
            *self.policy.write().expect("policy lock poisoned") = policy;
        }
        if let Some(nodes) =
            crate::store::read_blob::<HashMap<String, NodeMeta>>(&self.keys, &self.nodes_path())?
        {
            self.nodes.replace_all(nodes);
        }
        self.metrics.restore(&self.keys, &self.metrics_path())?;
        Ok(())
    }

    pub fn save_policy(&self) -> Result<()> {
        let policy = self.policy.read().expect("policy lock poisoned").clone();
        crate::store::write_blob(&self.keys, &self.policy_path(), &policy)
    }

    pub fn save_nodes(&self) -> Result<()> {
        crate::store::write_blob(&self.keys, &self.nodes_path(), &self.nodes.all())
    }

    /// Flush every dirty entity across all stores; returns how many files
    /// were written.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        flushed += self.games.flush_all()?;
        flushed += self.teams.flush_all()?;
        flushed += self.users.flush_all()?;
        flushed += self.team_games.flush_all()?;
        flushed += self.game_users.flush_all()?;
        flushed += self.team_users.flush_all()?;
        Ok(flushed)
    }

    pub fn dirty_total(&self) -> usize {
        self.games.dirty_count()
            + self.teams.dirty_count()
            + self.users.dirty_count()
            + self.team_games.dirty_count()
            + self.game_users.dirty_count()
            + self.team_users.dirty_count()
    }

    /// Away/home teams of a game, when they exist.
    pub fn team_pair(&self, game: &Game) -> (Option<Team>, Option<Team>) {
        let load = |id: &str| {
            if id.is_empty() {
                None
            } else {
                self.teams.load(id).ok()
            }
        };
        (load(&game.away_team_id), load(&game.home_team_id))
    }

    /// Maintain the secondary index files after a game write. `prev` is the
    /// state before the write so stale references get dropped.
    pub fn index_game(&self, game: &Game, prev: Option<&Game>, flush: bool) -> Result<()> {
        if let Some(prev) = prev {
            if prev.owner != game.owner && !prev.owner.is_empty() {
                let mut idx = self
                    .users
                    .load(&prev.owner)
                    .unwrap_or_else(|_| UserIndex::new(&prev.owner));
                idx.games.remove(&game.id);
                self.users.save_in_memory(&idx, flush)?;
            }
            for team_id in [prev.away_team_id.as_str(), prev.home_team_id.as_str()] {
                if !team_id.is_empty()
                    && team_id != game.away_team_id
                    && team_id != game.home_team_id
                {
                    let mut idx = self
                        .team_games
                        .load(team_id)
                        .unwrap_or_else(|_| TeamGamesIndex::new(team_id));
                    idx.games.remove(&game.id);
                    self.team_games.save_in_memory(&idx, flush)?;
                }
            }
        }

        if !game.owner.is_empty() {
            let mut idx = self
                .users
                .load(&game.owner)
                .unwrap_or_else(|_| UserIndex::new(&game.owner));
            if idx.games.insert(game.id.clone()) {
                self.users.save_in_memory(&idx, flush)?;
            }
        }
        for team_id in [&game.away_team_id, &game.home_team_id] {
            if !team_id.is_empty() {
                let mut idx = self
                    .team_games
                    .load(team_id)
                    .unwrap_or_else(|_| TeamGamesIndex::new(team_id.as_str()));
                if idx.games.insert(game.id.clone()) {
                    self.team_games.save_in_memory(&idx, flush)?;
                }
            }
        }

        let mut grants = GameUsersIndex::new(&game.id);
        grants.users = game.permissions.users.keys().cloned().collect();
        self.game_users.save_in_memory(&grants, flush)?;
        Ok(())
    }

    pub fn unindex_game(&self, game: &Game, flush: bool) -> Result<()> {
        if !game.owner.is_empty()
            && let Ok(mut idx) = self.users.load(&game.owner)
        {
            idx.games.remove(&game.id);
            self.users.save_in_memory(&idx, flush)?;
        }
        for team_id in [&game.away_team_id, &game.home_team_id] {
            if !team_id.is_empty()
                && let Ok(mut idx) = self.team_games.load(team_id)
            {
                idx.games.remove(&game.id);
                self.team_games.save_in_memory(&idx, flush)?;
            }
        }
        self.game_users.purge(&game.id)?;
        Ok(())
    }

    pub fn index_team(&self, team: &Team, prev: Option<&Team>, flush: bool) -> Result<()> {
        if let Some(prev) = prev
            && prev.owner != team.owner
            && !prev.owner.is_empty()
            && let Ok(mut idx) = self.users.load(&prev.owner)
        {
            idx.teams.remove(&team.id);
            self.users.save_in_memory(&idx, flush)?;
        }
        if !team.owner.is_empty() {
            let mut idx = self
                .users
                .load(&team.owner)
                .unwrap_or_else(|_| UserIndex::new(&team.owner));
            if idx.teams.insert(team.id.clone()) {
                self.users.save_in_memory(&idx, flush)?;
            }
        }
        let mut members = TeamUsersIndex::new(&team.id);
        members.users = team.roles.members().cloned().collect();
        self.team_users.save_in_memory(&members, flush)?;
        Ok(())
    }

    pub fn unindex_team(&self, team: &Team, flush: bool) -> Result<()> {
        if !team.owner.is_empty()
            && let Ok(mut idx) = self.users.load(&team.owner)
        {
            idx.teams.remove(&team.id);
            self.users.save_in_memory(&idx, flush)?;
        }
        self.team_users.purge(&team.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PublicLevel;

    fn open_core() -> (tempfile::TempDir, Core) {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open(dir.path(), Arc::new(KeyRing::ephemeral())).unwrap();
        (dir, core)
    }

    #[test]
    fn game_indexing_tracks_owner_and_teams() {
        let (_dir, core) = open_core();
        let mut game = Game::new("g1");
        game.owner = "a@e".into();
        game.away_team_id = "t1".into();
        core.games.save(&game).unwrap();
        core.index_game(&game, None, true).unwrap();

        assert!(core.users.load("a@e").unwrap().games.contains("g1"));
        assert!(core.team_games.load("t1").unwrap().games.contains("g1"));

        let prev = game.clone();
        game.owner = "b@e".into();
        game.away_team_id = "t2".into();
        core.index_game(&game, Some(&prev), true).unwrap();
        assert!(!core.users.load("a@e").unwrap().games.contains("g1"));
        assert!(core.users.load("b@e").unwrap().games.contains("g1"));
        assert!(!core.team_games.load("t1").unwrap().games.contains("g1"));
        assert!(core.team_games.load("t2").unwrap().games.contains("g1"));
    }

    #[test]
    fn tofu_pin_rejects_key_change() {
        let table = NodeTable::default();
        let mut meta = NodeMeta::new("n1");
        meta.public_key = "aabb".into();
        table.upsert(meta.clone()).unwrap();
        meta.public_key = "ccdd".into();
        assert!(table.upsert(meta).is_err());
    }

    #[test]
    fn singletons_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyRing::open(&dir.path().join("keyring.json")).unwrap());
        {
            let core = Core::open(dir.path(), Arc::clone(&keys)).unwrap();
            core.policy
                .write()
                .unwrap()
                .admins
                .insert("root@e".into());
            core.save_policy().unwrap();
            let mut game = Game::new("g1");
            game.permissions.public = PublicLevel::Read;
            core.games.save(&game).unwrap();
        }
        let core = Core::open(dir.path(), keys).unwrap();
        assert!(core.policy.read().unwrap().is_admin("root@e"));
        // Registry was rebuilt from disk on open.
        assert!(core.registry.public_games().contains("g1"));
    }
}
