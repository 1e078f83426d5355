use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{Entity, EntityStatus};

// Secondary indices, one file per principal. They carry the same Entity
// envelope as games/teams so the stores and snapshot pipeline can move them
// around without special cases.

macro_rules! index_entity {
    ($ty:ident, $kind:literal, $key:ident) => {
        impl Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.$key
            }

            fn status(&self) -> EntityStatus {
                self.status
            }

            fn deleted_at(&self) -> i64 {
                self.deleted_at
            }

            fn mark_deleted(&mut self, at_ns: i64) {
                self.status = EntityStatus::Deleted;
                self.deleted_at = at_ns;
            }

            fn last_raft_index(&self) -> u64 {
                self.last_raft_index
            }

            fn set_last_raft_index(&mut self, index: u64) {
                self.last_raft_index = index;
            }
        }
    };
}

/// Per-user ownership index: games and teams this email owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIndex {
    pub email: String,
    #[serde(default)]
    pub games: BTreeSet<String>,
    #[serde(default)]
    pub teams: BTreeSet<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
}

index_entity!(UserIndex, "users", email);

impl UserIndex {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }
}

/// Games owned by a team (as away or home side).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamGamesIndex {
    pub team_id: String,
    #[serde(default)]
    pub games: BTreeSet<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
}

index_entity!(TeamGamesIndex, "team_games", team_id);

impl TeamGamesIndex {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            ..Default::default()
        }
    }
}

/// Users with an explicit grant on a game.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameUsersIndex {
    pub game_id: String,
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
}

index_entity!(GameUsersIndex, "game_users", game_id);

impl GameUsersIndex {
    pub fn new(game_id: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            ..Default::default()
        }
    }
}

/// Role members of a team, flattened for reverse lookups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamUsersIndex {
    pub team_id: String,
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
}

index_entity!(TeamUsersIndex, "team_users", team_id);

impl TeamUsersIndex {
    pub fn new(team_id: impl Into<String>) -> Self {
        Self {
            team_id: team_id.into(),
            ..Default::default()
        }
    }
}
