use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::{Entity, EntityStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamRoles {
    #[serde(default)]
    pub admins: BTreeSet<String>,
    #[serde(default)]
    pub scorekeepers: BTreeSet<String>,
    #[serde(default)]
    pub spectators: BTreeSet<String>,
}

impl TeamRoles {
    pub fn contains(&self, email: &str) -> bool {
        self.admins.contains(email)
            || self.scorekeepers.contains(email)
            || self.spectators.contains(email)
    }

    pub fn members(&self) -> impl Iterator<Item = &String> {
        self.admins
            .iter()
            .chain(self.scorekeepers.iter())
            .chain(self.spectators.iter())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub roles: TeamRoles,
    #[serde(default)]
    pub status: EntityStatus,
    #[serde(default)]
    pub last_raft_index: u64,
    #[serde(default)]
    pub deleted_at: i64,
}

impl Entity for Team {
    const KIND: &'static str = "teams";

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
