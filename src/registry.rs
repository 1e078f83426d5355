use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{EntityStatus, Game, PublicLevel, Team};
use crate::store::EntityStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub id: String,
    pub owner: String,
    pub date: String,
    pub event: String,
    pub location: String,
    pub away: String,
    pub home: String,
    pub away_team_id: String,
    pub home_team_id: String,
    pub status: EntityStatus,
    pub public: PublicLevel,
    pub actions: usize,
}

impl From<&Game> for GameSummary {
    fn from(g: &Game) -> Self {
        Self {
            id: g.id.clone(),
            owner: g.owner.clone(),
            date: g.date.clone(),
            event: g.event.clone(),
            location: g.location.clone(),
            away: g.away.clone(),
            home: g.home.clone(),
            away_team_id: g.away_team_id.clone(),
            home_team_id: g.home_team_id.clone(),
            status: g.status,
            public: g.permissions.public,
            actions: g.action_log.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamSummary {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub status: EntityStatus,
    pub members: usize,
}

impl From<&Team> for TeamSummary {
    fn from(t: &Team) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            owner: t.owner.clone(),
            status: t.status,
            members: t.roles.members().count(),
        }
    }
}

#[derive(Default)]
struct Indices {
    by_owner: HashMap<String, BTreeSet<String>>,
    by_team: HashMap<String, BTreeSet<String>>,
    public_games: BTreeSet<String>,
    games: HashMap<String, GameSummary>,
    teams_by_owner: HashMap<String, BTreeSet<String>>,
    teams: HashMap<String, TeamSummary>,
    deleted_games: HashMap<String, i64>,
    deleted_teams: HashMap<String, i64>,
}

/// In-memory lookup structures over the entity stores. The registry never
/// owns entities; it observes updates and can always be reconstructed from
/// disk truth via `rebuild`.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Indices>,
}

fn remove_ref(map: &mut HashMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_game(&self, game: &Game) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if game.status == EntityStatus::Deleted {
            drop(inner);
            self.delete_game(&game.id, game.deleted_at);
            return;
        }

        // Drop references the previous version held before re-indexing.
        if let Some(prev) = inner.games.remove(&game.id) {
            remove_ref(&mut inner.by_owner, &prev.owner, &game.id);
            remove_ref(&mut inner.by_team, &prev.away_team_id, &game.id);
            remove_ref(&mut inner.by_team, &prev.home_team_id, &game.id);
            inner.public_games.remove(&game.id);
        }
        inner.deleted_games.remove(&game.id);

        let summary = GameSummary::from(game);
        if !summary.owner.is_empty() {
            inner
                .by_owner
                .entry(summary.owner.clone())
                .or_default()
                .insert(game.id.clone());
        }
        for team in [&summary.away_team_id, &summary.home_team_id] {
            if !team.is_empty() {
                inner
                    .by_team
                    .entry(team.clone())
                    .or_default()
                    .insert(game.id.clone());
            }
        }
        if summary.public != PublicLevel::None {
            inner.public_games.insert(game.id.clone());
        }
        inner.games.insert(game.id.clone(), summary);
    }

    pub fn delete_game(&self, id: &str, deleted_at: i64) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(prev) = inner.games.remove(id) {
            remove_ref(&mut inner.by_owner, &prev.owner, id);
            remove_ref(&mut inner.by_team, &prev.away_team_id, id);
            remove_ref(&mut inner.by_team, &prev.home_team_id, id);
            inner.public_games.remove(id);
        }
        inner.deleted_games.insert(id.to_string(), deleted_at);
    }

    pub fn update_team(&self, team: &Team) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if team.status == EntityStatus::Deleted {
            drop(inner);
            self.delete_team(&team.id, team.deleted_at);
            return;
        }
        if let Some(prev) = inner.teams.remove(&team.id) {
            remove_ref(&mut inner.teams_by_owner, &prev.owner, &team.id);
        }
        inner.deleted_teams.remove(&team.id);
        let summary = TeamSummary::from(team);
        if !summary.owner.is_empty() {
            inner
                .teams_by_owner
                .entry(summary.owner.clone())
                .or_default()
                .insert(team.id.clone());
        }
        inner.teams.insert(team.id.clone(), summary);
    }

    pub fn delete_team(&self, id: &str, deleted_at: i64) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(prev) = inner.teams.remove(id) {
            remove_ref(&mut inner.teams_by_owner, &prev.owner, id);
        }
        inner.deleted_teams.insert(id.to_string(), deleted_at);
    }

    pub fn game_summary(&self, id: &str) -> Option<GameSummary> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .games
            .get(id)
            .cloned()
    }

    pub fn team_summary(&self, id: &str) -> Option<TeamSummary> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .teams
            .get(id)
            .cloned()
    }

    pub fn games_owned_by(&self, email: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_owner
            .get(email)
            .cloned()
            .unwrap_or_default()
    }

    pub fn games_for_team(&self, team_id: &str) -> BTreeSet<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .by_team
            .get(team_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn public_games(&self) -> BTreeSet<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .public_games
            .clone()
    }

    pub fn game_count(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").games.len()
    }

    pub fn team_count(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").teams.len()
    }

    /// Visible summaries for a listing request: everything for admins, owned
    /// plus public for everyone else.
    pub fn visible_games(&self, email: Option<&str>, is_admin: bool) -> Vec<GameSummary> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .games
            .values()
            .filter(|s| {
                is_admin
                    || s.public != PublicLevel::None
                    || email.is_some_and(|e| s.owner == e)
            })
            .cloned()
            .collect()
    }

    pub fn visible_teams(&self, email: Option<&str>, is_admin: bool) -> Vec<TeamSummary> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .teams
            .values()
            .filter(|s| is_admin || email.is_some_and(|e| s.owner == e))
            .cloned()
            .collect()
    }

    /// Reconstruct every index from store truth. Idempotent; on a partial
    /// failure the registry keeps whatever was rebuilt so far and readers
    /// treat results as eventually consistent.
    pub fn rebuild(
        &self,
        games: &EntityStore<Game>,
        teams: &EntityStore<Team>,
    ) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            *inner = Indices::default();
        }
        for game in games.list_all()? {
            match game {
                Ok(game) => self.update_game(&game),
                Err(e) => log::warn!("registry rebuild: skipping unreadable game: {e}"),
            }
        }
        for team in teams.list_all()? {
            match team {
                Ok(team) => self.update_team(&team),
                Err(e) => log::warn!("registry rebuild: skipping unreadable team: {e}"),
            }
        }
        Ok(())
    }

    /// Drop tombstones older than the TTL, purging the backing files.
    pub fn purge_old_tombstones(
        &self,
        games: &EntityStore<Game>,
        teams: &EntityStore<Team>,
        ttl_ns: i64,
        now_ns: i64,
    ) -> usize {
        let cutoff = now_ns - ttl_ns;
        let (expired_games, expired_teams) = {
            let inner = self.inner.read().expect("registry lock poisoned");
            (
                inner
                    .deleted_games
                    .iter()
                    .filter(|(_, at)| **at < cutoff)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>(),
                inner
                    .deleted_teams
                    .iter()
                    .filter(|(_, at)| **at < cutoff)
                    .map(|(id, _)| id.clone())
                    .collect::<Vec<_>>(),
            )
        };
        let mut purged = 0;
        for id in &expired_games {
            if let Err(e) = games.purge(id) {
                log::warn!("tombstone purge of game {id} failed: {e}");
                continue;
            }
            purged += 1;
        }
        for id in &expired_teams {
            if let Err(e) = teams.purge(id) {
                log::warn!("tombstone purge of team {id} failed: {e}");
                continue;
            }
            purged += 1;
        }
        let mut inner = self.inner.write().expect("registry lock poisoned");
        for id in &expired_games {
            inner.deleted_games.remove(id);
        }
        for id in &expired_teams {
            inner.deleted_teams.remove(id);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::now_ns;
    use crate::store::KeyRing;
    use std::sync::Arc;

    fn game(id: &str, owner: &str, public: PublicLevel) -> Game {
        let mut g = Game::new(id);
        g.owner = owner.into();
        g.permissions.public = public;
        g
    }

    #[test]
    fn update_reindexes_and_removes_stale_refs() {
        let reg = Registry::new();
        let mut g = game("g1", "a@e", PublicLevel::Read);
        g.away_team_id = "t1".into();
        reg.update_game(&g);
        assert!(reg.games_owned_by("a@e").contains("g1"));
        assert!(reg.games_for_team("t1").contains("g1"));
        assert!(reg.public_games().contains("g1"));

        g.owner = "b@e".into();
        g.away_team_id = "t2".into();
        g.permissions.public = PublicLevel::None;
        reg.update_game(&g);
        assert!(reg.games_owned_by("a@e").is_empty());
        assert!(reg.games_for_team("t1").is_empty());
        assert!(reg.games_owned_by("b@e").contains("g1"));
        assert!(reg.games_for_team("t2").contains("g1"));
        assert!(!reg.public_games().contains("g1"));
    }

    #[test]
    fn rebuild_reconstructs_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyRing::ephemeral());
        let games = EntityStore::<Game>::open(dir.path(), Arc::clone(&keys)).unwrap();
        let teams = EntityStore::<Team>::open(dir.path(), keys).unwrap();
        games.save(&game("g1", "a@e", PublicLevel::Read)).unwrap();
        games.save(&game("g2", "b@e", PublicLevel::None)).unwrap();

        let reg = Registry::new();
        reg.rebuild(&games, &teams).unwrap();
        assert_eq!(reg.game_count(), 2);
        assert!(reg.public_games().contains("g1"));
        // Rebuild is idempotent.
        reg.rebuild(&games, &teams).unwrap();
        assert_eq!(reg.game_count(), 2);
    }

    #[test]
    fn tombstone_gc_purges_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyRing::ephemeral());
        let games = EntityStore::<Game>::open(dir.path(), Arc::clone(&keys)).unwrap();
        let teams = EntityStore::<Team>::open(dir.path(), keys).unwrap();
        games.save(&game("old", "a@e", PublicLevel::None)).unwrap();
        games.save(&game("fresh", "a@e", PublicLevel::None)).unwrap();

        let now = now_ns();
        let ttl = 7 * 24 * 3600 * 1_000_000_000i64;
        games.delete("old", now - ttl - 1).unwrap();
        games.delete("fresh", now).unwrap();

        let reg = Registry::new();
        reg.delete_game("old", now - ttl - 1);
        reg.delete_game("fresh", now);

        assert_eq!(reg.purge_old_tombstones(&games, &teams, ttl, now), 1);
        assert!(!games.file_path("old").exists());
        assert!(games.file_path("fresh").exists());
    }
}
