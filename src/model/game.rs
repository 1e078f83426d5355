use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ActionRecord, Entity, policy::AccessLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Active,
    Final,
    Deleted,
}

/// Per-game visibility for users without an explicit grant. Anonymous
/// readers are capped at `Read` regardless of this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicLevel {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub public: PublicLevel,
    /// Explicit per-user grants, keyed by email.
    #[serde(default)]
    pub users: BTreeMap<String, AccessLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub away: String,
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub away_team_id: String,
    #[serde(default)]
    pub home_team_id: String,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub action_log: Vec<ActionRecord>,
    #[serde(default)]
    pub status: EntityStatus,
    /// Convenience pointer at the log tail; kept in lock-step by the
    /// reducer.
    #[serde(default)]
    pub last_action_id: String,
    /// Highest consensus index this game has absorbed. Monotone.
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
    #[serde(default)]
    pub schema_version: u32,
}

impl Game {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema_version: crate::model::SCHEMA_VERSION,
            ..Default::default()
        }
    }

    /// Current head revision: the id of the last log entry, or empty for an
    /// empty log.
    pub fn head(&self) -> &str {
        &self.last_action_id
    }

    /// Position of an action id in the log, scanning from the tail since
    /// lookups overwhelmingly target recent entries.
    pub fn find_action(&self, id: &str) -> Option<usize> {
        self.action_log.iter().rposition(|rec| rec.id == id)
    }

    /// Log suffix strictly after the entry with `id`.
    pub fn actions_since(&self, id: &str) -> Option<&[ActionRecord]> {
        self.find_action(id).map(|pos| &self.action_log[pos + 1..])
    }
}

impl Entity for Game {
    const KIND: &'static str = "games";

    fn id(&self) -> &str {
        &self.id
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
        debug_assert!(index >= self.last_raft_index);
        self.last_raft_index = index;
    }
}
