use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::NodeMeta;
use crate::raft::consensus::RaftHandle;
use crate::raft::log_store::LogEntry;

pub const SECRET_HEADER: &str = "X-Raft-Secret";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    #[serde(default)]
    pub match_index: u64,
    /// Backtracking hint: where the leader should resume on mismatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: String,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// The replication archive, base64 over the encrypted gzip stream.
    pub data: String,
}

impl InstallSnapshotRequest {
    pub fn encode_data(data: &[u8]) -> String {
        BASE64.encode(data)
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.data)
            .map_err(|_| EngineError::Corrupt("snapshot transfer payload".into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// RPC fan-out to cluster peers: HTTP in production, direct handle calls for
/// in-process cluster tests.
pub enum Peers {
    Http(HttpPeers),
    Local(LocalPeers),
}

impl Peers {
    pub async fn vote(&self, peer: &NodeMeta, req: VoteRequest) -> Result<VoteResponse> {
        match self {
            Peers::Http(http) => http.post(peer, "vote", &req).await,
            Peers::Local(local) => {
                let handle = local.handle_for(&peer.node_id)?;
                handle.handle_vote(req).await
            }
        }
    }

    pub async fn append(
        &self,
        peer: &NodeMeta,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self {
            Peers::Http(http) => http.post(peer, "append", &req).await,
            Peers::Local(local) => {
                let handle = local.handle_for(&peer.node_id)?;
                handle.handle_append(req).await
            }
        }
    }

    pub async fn snapshot(
        &self,
        peer: &NodeMeta,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        match self {
            Peers::Http(http) => http.post(peer, "snapshot", &req).await,
            Peers::Local(local) => {
                let handle = local.handle_for(&peer.node_id)?;
                handle.handle_install_snapshot(req).await
            }
        }
    }
}

/// Peer RPCs over the cluster HTTP surface, authenticated with the shared
/// secret header. mTLS wrapping is the deployment's concern.
pub struct HttpPeers {
    client: reqwest::Client,
    secret: String,
}

impl HttpPeers {
    pub fn new(secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self { client, secret }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        peer: &NodeMeta,
        rpc: &str,
        req: &Req,
    ) -> Result<Resp> {
        if peer.cluster_addr.is_empty() {
            return Err(EngineError::Unavailable);
        }
        let url = format!("http://{}/api/cluster/raft/{rpc}", peer.cluster_addr);
        let resp = self
            .client
            .post(&url)
            .header(SECRET_HEADER, &self.secret)
            .json(req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Unavailable
                }
            })?;
        if !resp.status().is_success() {
            return Err(EngineError::Unavailable);
        }
        resp.json().await.map_err(|_| EngineError::Unavailable)
    }
}

/// In-process peer table for cluster tests: node id straight to its raft
/// handle, no sockets involved.
#[derive(Default)]
pub struct LocalPeers {
    handles: Mutex<HashMap<String, RaftHandle>>,
}

impl LocalPeers {
    pub fn register(&self, node_id: &str, handle: RaftHandle) {
        self.handles
            .lock()
            .expect("local peers lock poisoned")
            .insert(node_id.to_string(), handle);
    }

    pub fn deregister(&self, node_id: &str) {
        self.handles
            .lock()
            .expect("local peers lock poisoned")
            .remove(node_id);
    }

    fn handle_for(&self, node_id: &str) -> Result<RaftHandle> {
        self.handles
            .lock()
            .expect("local peers lock poisoned")
            .get(node_id)
            .cloned()
            .ok_or(EngineError::Unavailable)
    }
}
