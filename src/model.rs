use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod action;
pub mod game;
pub mod index;
pub mod node;
pub mod policy;
pub mod team;

pub use action::ActionRecord;
pub use game::{EntityStatus, Game, Permissions, PublicLevel};
pub use index::{GameUsersIndex, TeamGamesIndex, TeamUsersIndex, UserIndex};
pub use node::NodeMeta;
pub use policy::{AccessLevel, UserAccessPolicy};
pub use team::{Team, TeamRoles};

/// Current on-disk schema for games; embedded in GAME_START payloads so
/// future migrations can branch on it.
pub const SCHEMA_VERSION: u32 = 3;
/// Sync protocol version advertised in NodeMeta.
pub const PROTOCOL_VERSION: u32 = 1;

/// Contract every persisted entity satisfies so the stores, registry and
/// snapshot pipeline can treat them uniformly. `kind()` doubles as the
/// directory name under the data dir.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn status(&self) -> EntityStatus;
    fn deleted_at(&self) -> i64;
    fn mark_deleted(&mut self, at_ns: i64);
    fn last_raft_index(&self) -> u64;
    fn set_last_raft_index(&mut self, index: u64);
}

/// Nanoseconds since the epoch; tombstones and action timestamps use this.
pub fn now_ns() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
