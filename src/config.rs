use std::path::PathBuf;

use clap::Parser;

/// Flat runtime configuration; every recognized option is a flag here, there
/// is no hidden global state.
#[derive(Debug, Clone, Parser)]
#[command(name = "scorebook", about = "Replicated collaborative scorekeeping service")]
pub struct Config {
    /// Root directory for entity stores, consensus state and snapshots.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Public HTTP/WebSocket listen address.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub addr: String,

    /// Run clustered on the consensus layer instead of standalone.
    #[arg(long)]
    pub raft: bool,

    /// Bootstrap a fresh single-node cluster (first node only).
    #[arg(long)]
    pub raft_bootstrap: bool,

    /// Cluster-internal listen address (raft RPCs, join/status). Defaults to
    /// the public address when empty.
    #[arg(long, default_value = "")]
    pub cluster_addr: String,

    /// Address other nodes should use to reach this node's cluster surface.
    #[arg(long, default_value = "")]
    pub cluster_advertise: String,

    /// Address other nodes should use for the public API (leader
    /// forwarding).
    #[arg(long, default_value = "")]
    pub advertise: String,

    /// An existing node's cluster address to join through.
    #[arg(long)]
    pub cluster_join: Option<String>,

    /// Shared secret protecting every cluster-internal endpoint.
    #[arg(long, default_value = "")]
    pub raft_secret: String,

    /// Stable node id; derived from the node key when empty.
    #[arg(long, default_value = "")]
    pub node_id: String,

    /// Bootstrap operator email, always granted admin.
    #[arg(long)]
    pub admin: Option<String>,

    /// Take the caller identity from the X-User-Email header instead of the
    /// external auth middleware. Tests and local development only.
    #[arg(long)]
    pub use_mock_auth: bool,

    #[arg(long)]
    pub debug: bool,

    /// How long deleted games and teams linger as tombstones.
    #[arg(long, default_value_t = 7 * 24 * 3600)]
    pub tombstone_ttl_secs: u64,

    /// Accept only exact head matches instead of the permissive
    /// partial-overlap reconciliation.
    #[arg(long)]
    pub strict_reconcile: bool,

    /// How many snapshots the store keeps.
    #[arg(long, default_value_t = 2)]
    pub snapshot_retain: usize,

    /// Committed entries between automatic snapshots.
    #[arg(long, default_value_t = 2048)]
    pub snapshot_threshold: u64,

    /// Seconds without subscribers or writes before a hub is reclaimed.
    #[arg(long, default_value_t = 300)]
    pub hub_idle_secs: u64,
}

impl Config {
    /// Programmatic construction for embedding and tests.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::parse_from(["scorebook"]).with_data_dir(data_dir)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn cluster_listen_addr(&self) -> &str {
        if self.cluster_addr.is_empty() {
            &self.addr
        } else {
            &self.cluster_addr
        }
    }

    pub fn cluster_advertise_addr(&self) -> &str {
        if self.cluster_advertise.is_empty() {
            self.cluster_listen_addr()
        } else {
            &self.cluster_advertise
        }
    }

    pub fn public_advertise_addr(&self) -> &str {
        if self.advertise.is_empty() {
            &self.addr
        } else {
            &self.advertise
        }
    }

    pub fn tombstone_ttl_ns(&self) -> i64 {
        self.tombstone_ttl_secs as i64 * 1_000_000_000
    }
}
