use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::error::{EngineError, Result};
use crate::metrics::name as metric;
use crate::model::NodeMeta;
use crate::raft::fsm::{ApplyOutcome, StateMachine};
use crate::raft::log_store::{LogEntry, LogStore, StableStore};
use crate::raft::snapshot::{Manifest, SnapshotStore};
use crate::raft::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    Peers, VoteRequest, VoteResponse,
};
use crate::raft::command::Command;

const STABLE_TERM: &str = "current_term";
const STABLE_VOTED_FOR: &str = "voted_for";
const STABLE_SNAP_INDEX: &str = "snapshot_index";
const STABLE_SNAP_TERM: &str = "snapshot_term";

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    pub bootstrap: bool,
    pub heartbeat_ms: u64,
    pub election_min_ms: u64,
    pub election_max_ms: u64,
    pub propose_timeout_ms: u64,
    /// Committed entries between snapshots before the log is compacted.
    pub snapshot_threshold: u64,
    pub snapshot_retain: usize,
}

impl RaftConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            bootstrap: false,
            heartbeat_ms: 150,
            election_min_ms: 500,
            election_max_ms: 1000,
            propose_timeout_ms: 8_000,
            snapshot_threshold: 2_048,
            snapshot_retain: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RaftStatus {
    pub node_id: String,
    pub role: String,
    pub term: u64,
    pub leader: Option<String>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub initialized: bool,
    pub peers: Vec<String>,
}

enum Event {
    Propose {
        cmd: Command,
        reply: oneshot::Sender<Result<ApplyOutcome>>,
    },
    VoteReq {
        req: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    AppendReq {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    SnapshotReq {
        req: InstallSnapshotRequest,
        reply: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    VoteReply {
        peer: String,
        term_sent: u64,
        resp: VoteResponse,
    },
    AppendReply {
        peer: String,
        term_sent: u64,
        sent_up_to: u64,
        resp: AppendEntriesResponse,
    },
    SnapshotSent {
        peer: String,
        term_sent: u64,
        included_index: u64,
        ok: bool,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<String>>,
    },
}

/// Cheap clonable handle into the consensus task. Everything the rest of the
/// engine does with raft goes through here.
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Event>,
    propose_timeout: Duration,
}

impl RaftHandle {
    async fn send(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| EngineError::Unavailable)
    }

    pub async fn propose(&self, cmd: Command) -> Result<ApplyOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Propose { cmd, reply }).await?;
        match tokio::time::timeout(self.propose_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::Unavailable),
            Err(_) => Err(EngineError::Timeout),
        }
    }

    pub async fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::VoteReq { req, reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn handle_append(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::AppendReq { req, reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::SnapshotReq { req, reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status { reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)
    }

    pub async fn take_snapshot(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::TakeSnapshot { reply }).await?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }
}

pub struct RaftNode {
    cfg: RaftConfig,
    sm: Arc<StateMachine>,
    log: Arc<LogStore>,
    stable: Arc<StableStore>,
    snaps: Arc<SnapshotStore>,
    peers: Arc<Peers>,
    raft_ring: Arc<crate::store::KeyRing>,

    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    commit_index: u64,
    snapshot_index: u64,
    snapshot_term: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    votes: HashSet<String>,
    election_deadline: Instant,
    last_heartbeat: Instant,
    pending: HashMap<u64, oneshot::Sender<Result<ApplyOutcome>>>,
    internal_tx: mpsc::Sender<Event>,
}

impl RaftNode {
    /// Build the node, replay any log entries the stores have not absorbed
    /// yet, and spawn the consensus task.
    pub fn spawn(
        cfg: RaftConfig,
        sm: Arc<StateMachine>,
        log: Arc<LogStore>,
        stable: Arc<StableStore>,
        snaps: Arc<SnapshotStore>,
        peers: Arc<Peers>,
        raft_ring: Arc<crate::store::KeyRing>,
    ) -> RaftHandle {
        let (tx, rx) = mpsc::channel(512);
        let propose_timeout = Duration::from_millis(cfg.propose_timeout_ms);

        let current_term = stable.get_u64(STABLE_TERM).unwrap_or(0);
        let voted_for = stable
            .get(STABLE_VOTED_FOR)
            .and_then(|v| String::from_utf8(v).ok())
            .filter(|v| !v.is_empty());
        let snapshot_index = stable.get_u64(STABLE_SNAP_INDEX).unwrap_or(0);
        let snapshot_term = stable.get_u64(STABLE_SNAP_TERM).unwrap_or(0);

        // Crash recovery: entries past the last flushed apply are folded back
        // into the state machine; LastRaftIndex makes re-application a no-op
        // for anything that did reach disk.
        let replay = log.range_from(sm.last_applied() + 1);
        if !replay.is_empty() {
            log::info!("replaying {} consensus log entries after restart", replay.len());
            sm.apply_batch(&replay);
        }
        let commit_index = log.last_index().max(snapshot_index);

        let mut node = Self {
            role: Role::Follower,
            current_term,
            voted_for,
            leader_id: None,
            commit_index,
            snapshot_index,
            snapshot_term,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            election_deadline: Instant::now(),
            last_heartbeat: Instant::now(),
            pending: HashMap::new(),
            internal_tx: tx.clone(),
            cfg,
            sm,
            log,
            stable,
            snaps,
            peers,
            raft_ring,
        };
        node.reset_election_deadline();
        tokio::spawn(node.run(rx));
        RaftHandle {
            tx,
            propose_timeout,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = tick.tick() => self.on_tick(),
            }
        }
        log::info!("consensus task for {} stopped", self.cfg.node_id);
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Propose { cmd, reply } => self.on_propose(cmd, reply),
            Event::VoteReq { req, reply } => {
                let resp = self.on_vote_request(req);
                let _ = reply.send(resp);
            }
            Event::AppendReq { req, reply } => {
                let resp = self.on_append_request(req);
                let _ = reply.send(resp);
            }
            Event::SnapshotReq { req, reply } => {
                let resp = self.on_install_snapshot(req);
                let _ = reply.send(resp);
            }
            Event::VoteReply {
                peer,
                term_sent,
                resp,
            } => self.on_vote_reply(peer, term_sent, resp),
            Event::AppendReply {
                peer,
                term_sent,
                sent_up_to,
                resp,
            } => self.on_append_reply(peer, term_sent, sent_up_to, resp),
            Event::SnapshotSent {
                peer,
                term_sent,
                included_index,
                ok,
            } => self.on_snapshot_sent(peer, term_sent, included_index, ok),
            Event::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Event::TakeSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
        }
    }

    fn peer_metas(&self) -> Vec<NodeMeta> {
        self.sm
            .core()
            .nodes
            .peer_ids(&self.cfg.node_id)
            .into_iter()
            .filter_map(|id| self.sm.core().nodes.get(&id))
            .collect()
    }

    fn cluster_size(&self) -> usize {
        self.peer_metas().len() + 1
    }

    fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    fn reset_election_deadline(&mut self) {
        let ms = rand::thread_rng()
            .gen_range(self.cfg.election_min_ms..=self.cfg.election_max_ms);
        self.election_deadline = Instant::now() + Duration::from_millis(ms);
    }

    fn persist_term(&self) {
        if let Err(e) = self.stable.set_u64(STABLE_TERM, self.current_term) {
            log::error!("persisting current term failed: {e}");
        }
        let voted = self.voted_for.clone().unwrap_or_default();
        if let Err(e) = self.stable.set(STABLE_VOTED_FOR, voted.as_bytes()) {
            log::error!("persisting vote failed: {e}");
        }
    }

    fn step_down(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_term();
        }
        if self.role == Role::Leader {
            log::info!(
                "{} stepping down from leadership at term {}",
                self.cfg.node_id,
                self.current_term
            );
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.fail_pending(EngineError::NotLeader {
            leader: self.leader_id.clone(),
        });
        self.reset_election_deadline();
    }

    fn fail_pending(&mut self, err: EngineError) {
        if self.pending.is_empty() {
            return;
        }
        let message = err.to_string();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(EngineError::Internal(message.clone())));
        }
    }

    fn on_tick(&mut self) {
        match self.role {
            Role::Leader => {
                if self.last_heartbeat.elapsed()
                    >= Duration::from_millis(self.cfg.heartbeat_ms)
                {
                    self.replicate_all();
                }
            }
            Role::Follower | Role::Candidate => {
                if Instant::now() >= self.election_deadline {
                    self.start_election();
                }
            }
        }
    }

    fn start_election(&mut self) {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.cfg.node_id.clone());
        self.persist_term();
        self.votes = HashSet::from([self.cfg.node_id.clone()]);
        self.leader_id = None;
        self.reset_election_deadline();
        self.sm.core().metrics.record(metric::ELECTIONS, 1.0);
        log::info!(
            "{} starting election for term {}",
            self.cfg.node_id,
            self.current_term
        );

        if self.votes.len() >= self.majority() {
            self.become_leader();
            return;
        }

        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.cfg.node_id.clone(),
            last_log_index: self.log.last_index().max(self.snapshot_index),
            last_log_term: if self.log.is_empty() {
                self.snapshot_term
            } else {
                self.log.last_term()
            },
        };
        for peer in self.peer_metas() {
            let peers = Arc::clone(&self.peers);
            let tx = self.internal_tx.clone();
            let req = req.clone();
            let term_sent = self.current_term;
            tokio::spawn(async move {
                if let Ok(resp) = peers.vote(&peer, req).await {
                    let _ = tx
                        .send(Event::VoteReply {
                            peer: peer.node_id,
                            term_sent,
                            resp,
                        })
                        .await;
                }
            });
        }
    }

    fn on_vote_reply(&mut self, peer: String, term_sent: u64, resp: VoteResponse) {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return;
        }
        if self.role != Role::Candidate || term_sent != self.current_term || !resp.vote_granted {
            return;
        }
        self.votes.insert(peer);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        log::info!(
            "{} won the election for term {}",
            self.cfg.node_id,
            self.current_term
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.cfg.node_id.clone());
        let next = self.log.last_index().max(self.snapshot_index) + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peer_metas() {
            self.next_index.insert(peer.node_id.clone(), next);
            self.match_index.insert(peer.node_id, 0);
        }
        // Re-announce this node's metadata: peers learn the new leader and
        // the entry gives the fresh term something to commit immediately.
        if let Some(meta) = self.sm.core().nodes.get(&self.cfg.node_id) {
            self.append_to_log(Command::NodeMeta { node: meta });
        }
        self.replicate_all();
    }

    fn append_to_log(&mut self, cmd: Command) -> u64 {
        let index = self.log.last_index().max(self.snapshot_index) + 1;
        let entry = LogEntry {
            index,
            term: self.current_term,
            command: cmd,
        };
        if let Err(e) = self.log.append(std::slice::from_ref(&entry)) {
            log::error!("appending to the consensus log failed: {e}");
        }
        index
    }

    fn on_propose(&mut self, cmd: Command, reply: oneshot::Sender<Result<ApplyOutcome>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(EngineError::NotLeader {
                leader: self.leader_id.clone(),
            }));
            return;
        }
        let index = self.append_to_log(cmd);
        self.pending.insert(index, reply);
        if self.cluster_size() == 1 {
            self.advance_commit(index);
        } else {
            self.replicate_all();
        }
    }

    fn replicate_all(&mut self) {
        self.last_heartbeat = Instant::now();
        for peer in self.peer_metas() {
            self.replicate_to(peer);
        }
        // A single-node cluster commits by itself.
        if self.cluster_size() == 1 {
            let last = self.log.last_index().max(self.snapshot_index);
            self.advance_commit(last);
        }
    }

    fn replicate_to(&mut self, peer: NodeMeta) {
        let next = *self
            .next_index
            .entry(peer.node_id.clone())
            .or_insert_with(|| self.log.last_index().max(self.snapshot_index) + 1);

        if next <= self.snapshot_index {
            self.send_snapshot(peer);
            return;
        }

        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else if prev_log_index == self.snapshot_index {
            self.snapshot_term
        } else {
            match self.log.term_of(prev_log_index) {
                Some(term) => term,
                None => {
                    self.send_snapshot(peer);
                    return;
                }
            }
        };
        let entries = self.log.range_from(next);
        let sent_up_to = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        let req = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.cfg.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        let peers = Arc::clone(&self.peers);
        let tx = self.internal_tx.clone();
        let term_sent = self.current_term;
        tokio::spawn(async move {
            if let Ok(resp) = peers.append(&peer, req).await {
                let _ = tx
                    .send(Event::AppendReply {
                        peer: peer.node_id,
                        term_sent,
                        sent_up_to,
                        resp,
                    })
                    .await;
            }
        });
    }

    fn send_snapshot(&mut self, peer: NodeMeta) {
        let Some(id) = self.snaps.latest() else {
            log::warn!(
                "peer {} needs a snapshot but none exists yet",
                peer.node_id
            );
            return;
        };
        let snaps = Arc::clone(&self.snaps);
        let peers = Arc::clone(&self.peers);
        let tx = self.internal_tx.clone();
        let term_sent = self.current_term;
        let included_index = self.snapshot_index;
        let included_term = self.snapshot_term;
        let leader_id = self.cfg.node_id.clone();
        tokio::spawn(async move {
            let opened =
                tokio::task::spawn_blocking(move || snaps.open_snapshot(&id)).await;
            let Ok(Ok((_, sealed))) = opened else {
                log::warn!("opening snapshot for replication failed");
                return;
            };
            let req = InstallSnapshotRequest {
                term: term_sent,
                leader_id,
                last_included_index: included_index,
                last_included_term: included_term,
                data: InstallSnapshotRequest::encode_data(&sealed),
            };
            let ok = peers.snapshot(&peer, req).await.is_ok();
            let _ = tx
                .send(Event::SnapshotSent {
                    peer: peer.node_id,
                    term_sent,
                    included_index,
                    ok,
                })
                .await;
        });
    }

    fn on_snapshot_sent(&mut self, peer: String, term_sent: u64, included_index: u64, ok: bool) {
        if self.role != Role::Leader || term_sent != self.current_term || !ok {
            return;
        }
        self.next_index.insert(peer.clone(), included_index + 1);
        self.match_index.insert(peer, included_index);
    }

    fn on_append_reply(
        &mut self,
        peer: String,
        term_sent: u64,
        sent_up_to: u64,
        resp: AppendEntriesResponse,
    ) {
        if resp.term > self.current_term {
            self.step_down(resp.term);
            return;
        }
        if self.role != Role::Leader || term_sent != self.current_term {
            return;
        }
        if resp.success {
            let matched = resp.match_index.min(sent_up_to);
            self.match_index.insert(peer.clone(), matched);
            self.next_index.insert(peer, matched + 1);
            self.try_advance_commit();
        } else {
            let fallback = resp
                .conflict_index
                .unwrap_or_else(|| self.next_index.get(&peer).copied().unwrap_or(1).saturating_sub(1))
                .max(1);
            self.next_index.insert(peer, fallback);
        }
    }

    fn try_advance_commit(&mut self) {
        let last = self.log.last_index();
        let mut candidate = self.commit_index;
        for n in (self.commit_index + 1)..=last {
            // Only entries from the current term commit by counting.
            if self.log.term_of(n) != Some(self.current_term) {
                continue;
            }
            let replicated = 1 + self
                .match_index
                .values()
                .filter(|m| **m >= n)
                .count();
            if replicated >= self.majority() {
                candidate = n;
            }
        }
        if candidate > self.commit_index {
            self.advance_commit(candidate);
        }
    }

    fn advance_commit(&mut self, to: u64) {
        if to <= self.commit_index {
            return;
        }
        self.commit_index = to;
        let entries = self.log.range(self.sm.last_applied() + 1, to);
        if entries.is_empty() {
            return;
        }
        let results = self.sm.apply_batch(&entries);
        for (index, outcome) in results {
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(outcome);
            }
        }
        self.maybe_snapshot();
    }

    fn maybe_snapshot(&mut self) {
        let applied = self.sm.last_applied();
        if applied.saturating_sub(self.snapshot_index) < self.cfg.snapshot_threshold {
            return;
        }
        if let Err(e) = self.take_snapshot() {
            log::warn!("automatic snapshot failed: {e}");
        }
    }

    /// FlushAll, rotate the log key, persist fsm state, snapshot, compact.
    fn take_snapshot(&mut self) -> Result<String> {
        let applied = self.sm.last_applied();
        let term = if applied == self.snapshot_index {
            self.snapshot_term
        } else {
            self.log.term_of(applied).unwrap_or(self.current_term)
        };

        self.sm.core().flush_all()?;
        self.raft_ring.rotate()?;
        self.sm.persist_state()?;

        let manifest = Manifest {
            raft_index: applied,
            term,
            nodes: self.sm.core().nodes.all(),
            initialized: self.sm.is_initialized(),
            timestamp: crate::model::now_ns(),
        };
        let id = self.snaps.create(&manifest)?;

        self.log.compact_through(applied)?;
        self.snapshot_index = applied;
        self.snapshot_term = term;
        self.stable.set_u64(STABLE_SNAP_INDEX, applied)?;
        self.stable.set_u64(STABLE_SNAP_TERM, term)?;
        if let Err(e) = self.snaps.gc(self.cfg.snapshot_retain) {
            log::warn!("snapshot gc failed: {e}");
        }
        Ok(id)
    }

    fn on_vote_request(&mut self, req: VoteRequest) -> VoteResponse {
        if req.term > self.current_term {
            self.step_down(req.term);
        }
        let mut granted = false;
        if req.term == self.current_term
            && self
                .voted_for
                .as_ref()
                .is_none_or(|v| *v == req.candidate_id)
        {
            let our_last_index = self.log.last_index().max(self.snapshot_index);
            let our_last_term = if self.log.is_empty() {
                self.snapshot_term
            } else {
                self.log.last_term()
            };
            let up_to_date = req.last_log_term > our_last_term
                || (req.last_log_term == our_last_term && req.last_log_index >= our_last_index);
            if up_to_date {
                granted = true;
                self.voted_for = Some(req.candidate_id.clone());
                self.persist_term();
                self.reset_election_deadline();
            }
        }
        VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        }
    }

    fn on_append_request(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        if req.term < self.current_term {
            return AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: 0,
                conflict_index: None,
            };
        }
        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.reset_election_deadline();

        let last = self.log.last_index().max(self.snapshot_index);
        if req.prev_log_index > 0 && req.prev_log_index > self.snapshot_index {
            match self.log.term_of(req.prev_log_index) {
                None => {
                    return AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        conflict_index: Some(last + 1),
                    };
                }
                Some(term) if term != req.prev_log_term => {
                    if let Err(e) = self.log.truncate_from(req.prev_log_index) {
                        log::error!("truncating conflicting log suffix failed: {e}");
                    }
                    return AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: 0,
                        conflict_index: Some(req.prev_log_index),
                    };
                }
                Some(_) => {}
            }
        }

        let mut to_append = Vec::new();
        for entry in &req.entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            match self.log.term_of(entry.index) {
                Some(term) if term == entry.term => {}
                Some(_) => {
                    if let Err(e) = self.log.truncate_from(entry.index) {
                        log::error!("truncating diverging entries failed: {e}");
                    }
                    to_append.push(entry.clone());
                }
                None => to_append.push(entry.clone()),
            }
        }
        if !to_append.is_empty()
            && let Err(e) = self.log.append(&to_append)
        {
            log::error!("appending replicated entries failed: {e}");
        }

        let new_last = self.log.last_index().max(self.snapshot_index);
        if req.leader_commit > self.commit_index {
            let target = req.leader_commit.min(new_last);
            self.advance_commit(target);
        }
        AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: new_last,
            conflict_index: None,
        }
    }

    fn on_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
            });
        }
        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term);
        }
        self.leader_id = Some(req.leader_id.clone());
        self.reset_election_deadline();

        let sealed = req.decode_data()?;
        self.snaps.restore(&sealed, &self.sm)?;
        self.snaps
            .save_received(req.last_included_index, req.last_included_term, &sealed)?;
        if let Err(e) = self.snaps.gc(self.cfg.snapshot_retain) {
            log::warn!("snapshot gc after install failed: {e}");
        }

        self.log.compact_through(req.last_included_index)?;
        self.snapshot_index = req.last_included_index;
        self.snapshot_term = req.last_included_term;
        self.stable.set_u64(STABLE_SNAP_INDEX, self.snapshot_index)?;
        self.stable.set_u64(STABLE_SNAP_TERM, self.snapshot_term)?;
        self.commit_index = self.commit_index.max(req.last_included_index);
        Ok(InstallSnapshotResponse {
            term: self.current_term,
        })
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            node_id: self.cfg.node_id.clone(),
            role: match self.role {
                Role::Follower => "follower",
                Role::Candidate => "candidate",
                Role::Leader => "leader",
            }
            .to_string(),
            term: self.current_term,
            leader: self.leader_id.clone(),
            last_log_index: self.log.last_index().max(self.snapshot_index),
            commit_index: self.commit_index,
            last_applied: self.sm.last_applied(),
            initialized: self.sm.is_initialized(),
            peers: self.sm.core().nodes.peer_ids(&self.cfg.node_id),
        }
    }
}
