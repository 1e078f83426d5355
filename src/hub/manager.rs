use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::Core;
use crate::hub::{Hub, ResourceKind};
use crate::raft::Commit;

/// Lazily-created map of resource id to Hub. Idle hubs (no subscribers, no
/// writes for the configured window) are reclaimed after flushing so no
/// dirty state is lost with them.
pub struct HubManager {
    core: Arc<Core>,
    commit: Arc<Commit>,
    node_id: String,
    strict: bool,
    bootstrap_admin: Option<String>,
    idle_ns: i64,
    hubs: Mutex<HashMap<(ResourceKind, String), Arc<Hub>>>,
}

impl HubManager {
    pub fn new(
        core: Arc<Core>,
        commit: Arc<Commit>,
        node_id: String,
        strict: bool,
        bootstrap_admin: Option<String>,
        idle_secs: u64,
    ) -> Self {
        Self {
            core,
            commit,
            node_id,
            strict,
            bootstrap_admin,
            idle_ns: (idle_secs as i64) * 1_000_000_000,
            hubs: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_hub(&self, kind: ResourceKind, id: &str) -> Arc<Hub> {
        let mut hubs = self.hubs.lock().expect("hub map lock poisoned");
        hubs.entry((kind, id.to_string()))
            .or_insert_with(|| {
                Arc::new(Hub::new(
                    kind,
                    id.to_string(),
                    Arc::clone(&self.core),
                    Arc::clone(&self.commit),
                    self.node_id.clone(),
                    self.strict,
                    self.bootstrap_admin.clone(),
                ))
            })
            .clone()
    }

    /// A hub that already exists, without creating one. Used by the apply
    /// side-effects: nodes with no observers for a game have nothing to
    /// broadcast to.
    pub fn existing_hub(&self, kind: ResourceKind, id: &str) -> Option<Arc<Hub>> {
        self.hubs
            .lock()
            .expect("hub map lock poisoned")
            .get(&(kind, id.to_string()))
            .cloned()
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.lock().expect("hub map lock poisoned").len()
    }

    /// Drop hubs that have been idle past the window. Flushes the stores
    /// first so cached-but-dirty entities reach disk before their hub goes
    /// away.
    pub fn reclaim_idle(&self) -> usize {
        let cutoff = crate::model::now_ns() - self.idle_ns;
        let candidates: Vec<(ResourceKind, String)> = {
            let hubs = self.hubs.lock().expect("hub map lock poisoned");
            hubs.iter()
                .filter(|(_, hub)| hub.subscriber_count() == 0 && hub.idle_since_ns() < cutoff)
                .map(|(key, _)| key.clone())
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        if let Err(e) = self.core.flush_all() {
            log::warn!("flush before hub reclamation failed, keeping hubs: {e}");
            return 0;
        }
        let mut hubs = self.hubs.lock().expect("hub map lock poisoned");
        let mut reclaimed = 0;
        for key in candidates {
            // Re-check under the lock; a subscriber may have arrived.
            if let Some(hub) = hubs.get(&key)
                && hub.subscriber_count() == 0
                && hub.idle_since_ns() < cutoff
            {
                hubs.remove(&key);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}
