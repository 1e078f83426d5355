use std::sync::Arc;

use crate::error::Result;

pub mod command;
pub mod consensus;
pub mod fsm;
pub mod log_store;
pub mod snapshot;
pub mod transport;

pub use command::Command;
pub use consensus::{RaftConfig, RaftHandle};
pub use fsm::{ApplyOutcome, StateMachine};
pub use log_store::{LogEntry, LogStore, StableStore};
pub use snapshot::SnapshotStore;

/// The write path behind every hub: either a direct local apply (standalone
/// deployments) or a propose-and-wait through the consensus layer.
pub enum Commit {
    Standalone(Arc<StateMachine>),
    Raft(RaftHandle),
}

impl Commit {
    pub async fn submit(&self, cmd: Command) -> Result<ApplyOutcome> {
        match self {
            Commit::Standalone(sm) => sm.apply_local(cmd),
            Commit::Raft(handle) => handle.propose(cmd).await,
        }
    }

    pub fn is_clustered(&self) -> bool {
        matches!(self, Commit::Raft(_))
    }
}
