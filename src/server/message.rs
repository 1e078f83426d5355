use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::ActionRecord;

/// Wire message types. The same envelope travels over the WebSocket and the
/// HTTP POST surface.
pub mod msg_type {
    pub const ACTION: &str = "ACTION";
    pub const JOIN: &str = "JOIN";
    pub const ACK: &str = "ACK";
    pub const CONFLICT: &str = "CONFLICT";
    pub const ERROR: &str = "ERROR";
    pub const SYNC_UPDATE: &str = "SYNC_UPDATE";
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub game_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<ActionRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn ack(game_id: &str, head: &str) -> Self {
        Self {
            kind: msg_type::ACK.into(),
            game_id: game_id.to_string(),
            base_revision: Some(head.to_string()),
            ..Default::default()
        }
    }

    pub fn conflict(game_id: &str, head: &str, reason: &str) -> Self {
        Self {
            kind: msg_type::CONFLICT.into(),
            game_id: game_id.to_string(),
            base_revision: Some(head.to_string()),
            error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn sync_update(game_id: &str, actions: Vec<ActionRecord>, head: &str) -> Self {
        Self {
            kind: msg_type::SYNC_UPDATE.into(),
            game_id: game_id.to_string(),
            actions: Some(actions),
            base_revision: Some(head.to_string()),
            ..Default::default()
        }
    }

    pub fn error(game_id: &str, text: impl Into<String>) -> Self {
        Self {
            kind: msg_type::ERROR.into(),
            game_id: game_id.to_string(),
            error: Some(text.into()),
            ..Default::default()
        }
    }

    /// The incoming batch, normalized: a single `action` and an `actions`
    /// array are the same thing to the engine.
    pub fn incoming_actions(&self) -> Vec<ActionRecord> {
        let mut out = Vec::new();
        if let Some(a) = &self.action {
            out.push(a.clone());
        }
        if let Some(batch) = &self.actions {
            out.extend(batch.iter().cloned());
        }
        out
    }
}

impl From<&EngineError> for Message {
    fn from(err: &EngineError) -> Self {
        match err {
            EngineError::StaleBase { head } => Message::conflict("", head, "stale base revision"),
            EngineError::Divergent { head } => Message::conflict("", head, "History divergence"),
            EngineError::NotLeader { .. } | EngineError::Unavailable => {
                Message::error("", "leader unavailable")
            }
            other => Message::error("", other.to_string()),
        }
    }
}
