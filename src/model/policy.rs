use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Effective access for a principal on one game or team. Ordered so level
/// comparisons read naturally (`level >= AccessLevel::Write`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    None,
    Read,
    Write,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOverride {
    #[serde(default)]
    pub access: DefaultPolicy,
    /// Zero means "inherit the default quota".
    #[serde(default)]
    pub max_games: u32,
    #[serde(default)]
    pub max_teams: u32,
}

/// Global access policy, replicated via `UpdateAccessPolicy` commands and
/// persisted at `sys_access_policy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccessPolicy {
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    #[serde(default)]
    pub default_denial_message: String,
    #[serde(default)]
    pub admins: BTreeSet<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, UserOverride>,
    /// Zero disables the quota.
    #[serde(default)]
    pub default_max_games: u32,
    #[serde(default)]
    pub default_max_teams: u32,
}

impl Default for UserAccessPolicy {
    fn default() -> Self {
        Self {
            default_policy: DefaultPolicy::Allow,
            default_denial_message: "Access denied by the server policy".to_string(),
            admins: BTreeSet::new(),
            overrides: BTreeMap::new(),
            default_max_games: 0,
            default_max_teams: 0,
        }
    }
}

impl UserAccessPolicy {
    pub fn is_admin(&self, email: &str) -> bool {
        self.admins.contains(email)
    }

    pub fn allows(&self, email: &str) -> bool {
        match self.overrides.get(email) {
            Some(o) => o.access == DefaultPolicy::Allow,
            None => self.default_policy == DefaultPolicy::Allow,
        }
    }

    pub fn max_games_for(&self, email: &str) -> u32 {
        match self.overrides.get(email) {
            Some(o) if o.max_games > 0 => o.max_games,
            _ => self.default_max_games,
        }
    }

    pub fn max_teams_for(&self, email: &str) -> u32 {
        match self.overrides.get(email) {
            Some(o) if o.max_teams > 0 => o.max_teams,
            _ => self.default_max_teams,
        }
    }
}
