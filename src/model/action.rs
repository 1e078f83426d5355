use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// One entry of a game's action log. The payload is kept as raw JSON so the
/// engine stores exactly the bytes the client signed off on; only the
/// envelope fields are parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(
        default,
        rename = "schemaVersion",
        skip_serializing_if = "Option::is_none"
    )]
    pub schema_version: Option<u32>,
}

impl ActionRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload: None,
            timestamp: crate::model::now_ns(),
            schema_version: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = RawValue::from_string(payload.to_string()).ok();
        self
    }

    pub fn payload_json(&self) -> Option<serde_json::Value> {
        self.payload
            .as_ref()
            .and_then(|raw| serde_json::from_str(raw.get()).ok())
    }
}

/// The closed action vocabulary. Everything else is rejected by the
/// validator before it can reach a log.
pub mod kind {
    pub const GAME_START: &str = "GAME_START";
    pub const GAME_METADATA_UPDATE: &str = "GAME_METADATA_UPDATE";
    pub const GAME_FINALIZE: &str = "GAME_FINALIZE";
    pub const UNDO: &str = "UNDO";
    pub const PITCH: &str = "PITCH";
    pub const BALL_IN_PLAY: &str = "BALL_IN_PLAY";
    pub const RUNNER_ADVANCE: &str = "RUNNER_ADVANCE";
    pub const SCORE_UPDATE: &str = "SCORE_UPDATE";
    pub const PLAYER_UPDATE: &str = "PLAYER_UPDATE";
    pub const COLUMN_ADD: &str = "COLUMN_ADD";

    pub const ALL: &[&str] = &[
        GAME_START,
        GAME_METADATA_UPDATE,
        GAME_FINALIZE,
        UNDO,
        PITCH,
        BALL_IN_PLAY,
        RUNNER_ADVANCE,
        SCORE_UPDATE,
        PLAYER_UPDATE,
        COLUMN_ADD,
    ];

    pub fn is_known(kind: &str) -> bool {
        ALL.contains(&kind)
    }

    /// Metadata-only kinds remain allowed once a game is final.
    pub fn is_metadata(kind: &str) -> bool {
        kind == GAME_METADATA_UPDATE
    }
}
