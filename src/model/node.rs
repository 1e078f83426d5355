use serde::{Deserialize, Serialize};

/// Cluster participation record, replicated as a consensus command and
/// mirrored to `nodes.json` so restarts come up with the last-known map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMeta {
    pub node_id: String,
    #[serde(default)]
    pub http_addr: String,
    #[serde(default)]
    pub cluster_addr: String,
    /// Hex-encoded ed25519 verifying key, pinned trust-on-first-use.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub app_version: String,
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub schema_version: u32,
}

impl NodeMeta {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: crate::model::PROTOCOL_VERSION,
            schema_version: crate::model::SCHEMA_VERSION,
            ..Default::default()
        }
    }
}
