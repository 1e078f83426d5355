// Replicated event-sourced engine for a collaborative scorekeeping service.

// Many clients edit an append-only action log per game concurrently; the
// engine linearizes those writes per game, broadcasts accepted actions to
// every live observer, replicates state across a cluster so any node can
// serve reads and forward writes to the leader, and survives restarts with
// identical state on every node.

// Layering, bottom up: encrypted entity stores and the key ring (store),
// in-memory indices over them (registry), the action validator/reducer
// (action), per-resource single-writer hubs (hub), the consensus-backed
// state machine with snapshot support (raft), and the WebSocket/HTTP sync
// surface (server). `Engine` below wires one node together in either
// standalone or clustered mode.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::config::Config;
use crate::core::Core;
use crate::error::{EngineError, Result};
use crate::hub::HubManager;
use crate::metrics::name as metric;
use crate::model::NodeMeta;
use crate::raft::transport::Peers;
use crate::raft::{Commit, LogStore, RaftConfig, RaftHandle, SnapshotStore, StableStore,
    StateMachine, consensus::RaftNode};
use crate::store::KeyRing;

pub mod access;
pub mod action;
pub mod config;
pub mod core;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod model;
pub mod raft;
pub mod registry;
pub mod server;
pub mod store;

/// One engine node: the shared core, its state machine, the commit pipeline
/// and the hub map, plus the consensus handle when clustered.
pub struct Engine {
    pub cfg: Config,
    pub core: Arc<Core>,
    pub sm: Arc<StateMachine>,
    pub commit: Arc<Commit>,
    pub hubs: Arc<HubManager>,
    pub raft: Option<RaftHandle>,
    pub node: NodeMeta,
    pub connections: AtomicI64,
}

fn load_or_create_node_key(path: &Path) -> Result<SigningKey> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let bytes: [u8; 32] = hex::decode(raw.trim())
            .map_err(|_| EngineError::Corrupt("node key is not hex".into()))?
            .try_into()
            .map_err(|_| EngineError::Corrupt("node key has wrong length".into()))?;
        Ok(SigningKey::from_bytes(&bytes))
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = SigningKey::generate(&mut OsRng);
        std::fs::write(path, hex::encode(key.to_bytes()))?;
        Ok(key)
    }
}

impl Engine {
    fn node_meta(cfg: &Config, key: &SigningKey) -> NodeMeta {
        let public_key = hex::encode(key.verifying_key().to_bytes());
        let node_id = if cfg.node_id.is_empty() {
            format!("node-{}", &public_key[..8])
        } else {
            cfg.node_id.clone()
        };
        let mut meta = NodeMeta::new(node_id);
        meta.http_addr = cfg.public_advertise_addr().to_string();
        meta.cluster_addr = cfg.cluster_advertise_addr().to_string();
        meta.public_key = public_key;
        meta
    }

    /// Single-node deployment: no consensus, every apply is written through
    /// immediately.
    pub fn standalone(cfg: Config) -> Result<Arc<Self>> {
        let keys = Arc::new(KeyRing::open(&cfg.data_dir.join("keyring.json"))?);
        let core = Arc::new(Core::open(&cfg.data_dir, keys)?);
        let node_key = load_or_create_node_key(&cfg.data_dir.join("raft").join("node.key"))?;
        let node = Self::node_meta(&cfg, &node_key);

        let sm = Arc::new(StateMachine::new(
            Arc::clone(&core),
            node.node_id.clone(),
            false,
            true,
        ));
        let commit = Arc::new(Commit::Standalone(Arc::clone(&sm)));
        let hubs = Arc::new(HubManager::new(
            Arc::clone(&core),
            Arc::clone(&commit),
            node.node_id.clone(),
            cfg.strict_reconcile,
            cfg.admin.clone(),
            cfg.hub_idle_secs,
        ));
        sm.set_hubs(Arc::clone(&hubs));
        core.nodes.upsert(node.clone())?;

        Ok(Arc::new(Self {
            cfg,
            core,
            sm,
            commit,
            hubs,
            raft: None,
            node,
            connections: AtomicI64::new(0),
        }))
    }

    /// Clustered deployment on the consensus layer. `peers` carries the RPC
    /// transport so tests can run whole clusters in one process.
    pub fn clustered(cfg: Config, peers: Arc<Peers>) -> Result<Arc<Self>> {
        let keys = Arc::new(KeyRing::open(&cfg.data_dir.join("keyring.json"))?);
        let core = Arc::new(Core::open(&cfg.data_dir, keys)?);
        let raft_dir = cfg.data_dir.join("raft");
        let node_key = load_or_create_node_key(&raft_dir.join("node.key"))?;
        let node = Self::node_meta(&cfg, &node_key);

        let sm = Arc::new(StateMachine::new(
            Arc::clone(&core),
            node.node_id.clone(),
            true,
            cfg.raft_bootstrap,
        ));

        let raft_ring = Arc::new(KeyRing::open(&raft_dir.join("keyring.json"))?);
        let log = Arc::new(LogStore::open(
            &raft_dir.join("raft-log"),
            Arc::clone(&raft_ring),
        )?);
        let stable = Arc::new(StableStore::open(
            &raft_dir.join("stable-store"),
            Arc::clone(&raft_ring),
        )?);
        let cluster_key = Arc::new(KeyRing::from_secret(&cfg.raft_secret));
        let snaps = Arc::new(SnapshotStore::open(
            &raft_dir.join("snapshots"),
            Arc::clone(&core),
            cluster_key,
        )?);

        // This node always knows itself; the rest of the map arrives via
        // replicated NodeMeta commands or the join response.
        core.nodes.upsert(node.clone())?;

        let mut raft_cfg = RaftConfig::new(node.node_id.clone());
        raft_cfg.bootstrap = cfg.raft_bootstrap;
        raft_cfg.snapshot_threshold = cfg.snapshot_threshold;
        raft_cfg.snapshot_retain = cfg.snapshot_retain;
        let handle = RaftNode::spawn(
            raft_cfg,
            Arc::clone(&sm),
            log,
            stable,
            snaps,
            peers,
            raft_ring,
        );

        let commit = Arc::new(Commit::Raft(handle.clone()));
        let hubs = Arc::new(HubManager::new(
            Arc::clone(&core),
            Arc::clone(&commit),
            node.node_id.clone(),
            cfg.strict_reconcile,
            cfg.admin.clone(),
            cfg.hub_idle_secs,
        ));
        sm.set_hubs(Arc::clone(&hubs));

        Ok(Arc::new(Self {
            cfg,
            core,
            sm,
            commit,
            hubs,
            raft: Some(handle),
            node,
            connections: AtomicI64::new(0),
        }))
    }

    pub async fn is_leader(&self) -> bool {
        match &self.raft {
            None => true,
            Some(handle) => match handle.status().await {
                Ok(status) => status.leader.as_deref() == Some(self.node.node_id.as_str()),
                Err(_) => false,
            },
        }
    }

    /// The leader's public API address, for write forwarding.
    pub async fn leader_http_addr(&self) -> Option<String> {
        let handle = self.raft.as_ref()?;
        let status = handle.status().await.ok()?;
        let leader = status.leader?;
        if leader == self.node.node_id {
            return None;
        }
        self.core
            .nodes
            .get(&leader)
            .map(|meta| meta.http_addr)
            .filter(|addr| !addr.is_empty())
    }

    /// Join an existing cluster through any member's cluster endpoint. A
    /// follower answers with the leader's address; chase it a few hops.
    pub async fn join_cluster(&self, through: &str) -> Result<()> {
        let client = reqwest::Client::new();
        let mut target = through.to_string();
        for _ in 0..5 {
            let url = format!("http://{target}/api/cluster/join");
            let resp = client
                .post(&url)
                .header(crate::raft::transport::SECRET_HEADER, &self.cfg.raft_secret)
                .json(&self.node)
                .send()
                .await
                .map_err(|_| EngineError::Unavailable)?;
            if resp.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                let leader = resp.text().await.unwrap_or_default();
                if leader.is_empty() {
                    return Err(EngineError::Unavailable);
                }
                target = leader;
                continue;
            }
            if !resp.status().is_success() {
                return Err(EngineError::Forbidden(format!(
                    "cluster join via {target} rejected: {}",
                    resp.status()
                )));
            }
            let nodes: std::collections::HashMap<String, NodeMeta> =
                resp.json().await.map_err(|_| EngineError::Unavailable)?;
            for meta in nodes.into_values() {
                self.core.nodes.upsert(meta)?;
            }
            self.core.save_nodes()?;
            log::info!("joined cluster through {target}");
            return Ok(());
        }
        Err(EngineError::Unavailable)
    }

    /// Periodic housekeeping: tombstone GC, dirty flushes under clustered
    /// mode, idle hub reclamation and metrics sampling.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut gc = tokio::time::interval(Duration::from_secs(60));
            let mut flush = tokio::time::interval(Duration::from_secs(30));
            let mut metrics = tokio::time::interval(Duration::from_secs(15));
            loop {
                tokio::select! {
                    _ = gc.tick() => {
                        let purged = engine.core.registry.purge_old_tombstones(
                            &engine.core.games,
                            &engine.core.teams,
                            engine.cfg.tombstone_ttl_ns(),
                            crate::model::now_ns(),
                        );
                        if purged > 0 {
                            log::info!("tombstone gc purged {purged} entities");
                        }
                        engine.hubs.reclaim_idle();
                    }
                    _ = flush.tick() => {
                        if engine.commit.is_clustered()
                            && let Err(e) = engine.core.flush_all()
                        {
                            log::warn!("periodic flush failed: {e}");
                        }
                    }
                    _ = metrics.tick() => {
                        engine.sample_metrics().await;
                    }
                }
            }
        });
    }

    async fn sample_metrics(&self) {
        let m = &self.core.metrics;
        m.sample_rps(15.0);
        m.record(
            metric::ACTIVE_CONNECTIONS,
            self.connections.load(Ordering::Relaxed) as f64,
        );
        m.record(metric::GAMES, self.core.registry.game_count() as f64);
        m.record(metric::TEAMS, self.core.registry.team_count() as f64);
        m.merge_batch(m.local_batch(&self.node.node_id));
        if self.is_leader().await
            && let Some(handle) = &self.raft
        {
            let batch = m.local_batch(&self.node.node_id);
            if let Err(e) = handle
                .propose(crate::raft::Command::MetricsUpdate { batch })
                .await
            {
                log::debug!("metrics replication skipped: {e}");
            }
        }
    }

    /// Flush everything and persist bookkeeping for a clean restart.
    pub fn shutdown(&self) {
        if let Err(e) = self.core.flush_all() {
            log::error!("final flush failed: {e}");
        }
        if let Err(e) = self.sm.persist_state() {
            log::error!("persisting fsm state failed: {e}");
        }
        if let Err(e) = self
            .core
            .metrics
            .persist(&self.core.keys, &self.core.metrics_path())
        {
            log::warn!("persisting metrics failed: {e}");
        }
        if let Err(e) = self.core.save_nodes() {
            log::warn!("persisting node map failed: {e}");
        }
        self.core.keys.wipe();
    }
}
