use serde::Deserialize;

use crate::error::{EngineError, Result};
use crate::model::{ActionRecord, Permissions, action::kind};

// Maximum lengths for client-supplied strings. Anything longer is rejected
// before it can reach a log.
const MAX_TEAM_NAME: usize = 50;
const MAX_EVENT: usize = 100;
const MAX_LOCATION: usize = 100;
const MAX_COL: usize = 20;
const MAX_LABEL: usize = 20;
const MAX_OUTCOME: usize = 20;
const MAX_PLAYER_NAME: usize = 50;
const MAX_PLAYER_NUMBER: usize = 10;
const MAX_RUNNER_KEY: usize = 50;
const MAX_SCORE: usize = 5;

const MAX_INNING: u32 = 99;
const MAX_BATTER_SLOT: u32 = 25;

fn bounded(field: &str, value: &str, max: usize) -> Result<()> {
    if value.chars().count() > max {
        return Err(EngineError::Malformed(format!(
            "{field} exceeds {max} characters"
        )));
    }
    Ok(())
}

fn bounded_opt(field: &str, value: &Option<String>, max: usize) -> Result<()> {
    match value {
        Some(v) => bounded(field, v, max),
        None => Ok(()),
    }
}

fn require_uuid(field: &str, value: &str) -> Result<()> {
    uuid::Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| EngineError::BadId(format!("{field} is not a UUID")))
}

fn parse_payload<'a, P: Deserialize<'a>>(rec: &'a ActionRecord) -> Result<P> {
    let raw = rec
        .payload
        .as_ref()
        .ok_or_else(|| EngineError::Malformed(format!("{} requires a payload", rec.kind)))?;
    serde_json::from_str(raw.get())
        .map_err(|e| EngineError::Malformed(format!("{} payload: {e}", rec.kind)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveContext {
    #[serde(default)]
    pub b: u32,
    #[serde(default)]
    pub i: u32,
    #[serde(default)]
    pub col: Option<String>,
}

impl ActiveContext {
    fn validate(&self) -> Result<()> {
        if self.i == 0 || self.i > MAX_INNING {
            return Err(EngineError::Malformed(format!(
                "inning must be in 1..={MAX_INNING}"
            )));
        }
        if self.b > MAX_BATTER_SLOT {
            return Err(EngineError::Malformed(format!(
                "batter slot must be at most {MAX_BATTER_SLOT}"
            )));
        }
        bounded_opt("col", &self.col, MAX_COL)
    }
}

fn validate_active_team(value: &Option<String>) -> Result<()> {
    match value.as_deref() {
        None | Some("away") | Some("home") => Ok(()),
        Some(other) => Err(EngineError::Malformed(format!(
            "activeTeam must be away or home, got {other:?}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStartPayload {
    #[serde(default, alias = "id")]
    pub game_id: Option<String>,
    #[serde(default, alias = "ownerId")]
    pub owner: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub away: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub away_team_id: Option<String>,
    #[serde(default)]
    pub home_team_id: Option<String>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
    #[serde(default)]
    pub schema_version: Option<u32>,
}

impl GameStartPayload {
    fn validate(&self) -> Result<()> {
        if let Some(id) = &self.game_id {
            require_uuid("gameId", id)?;
        }
        bounded_opt("away", &self.away, MAX_TEAM_NAME)?;
        bounded_opt("home", &self.home, MAX_TEAM_NAME)?;
        bounded_opt("event", &self.event, MAX_EVENT)?;
        bounded_opt("location", &self.location, MAX_LOCATION)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataPayload {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub away: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

impl MetadataPayload {
    fn validate(&self) -> Result<()> {
        bounded_opt("away", &self.away, MAX_TEAM_NAME)?;
        bounded_opt("home", &self.home, MAX_TEAM_NAME)?;
        bounded_opt("event", &self.event, MAX_EVENT)?;
        bounded_opt("location", &self.location, MAX_LOCATION)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UndoPayload {
    action_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PitchPayload {
    active_ctx: ActiveContext,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    res: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BallInPlayPayload {
    #[serde(default)]
    active_ctx: Option<ActiveContext>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    res: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerAdvancePayload {
    runner: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreUpdatePayload {
    #[serde(default)]
    active_team: Option<String>,
    score: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerUpdatePayload {
    #[serde(default)]
    active_team: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    pitcher: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnAddPayload {
    col: String,
    #[serde(default)]
    col_id: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

/// Validate one action envelope plus its type-specific payload. Pure: the
/// same record always yields the same verdict, and arbitrary input bytes can
/// only produce an error, never a panic.
pub fn validate(rec: &ActionRecord) -> Result<()> {
    require_uuid("id", &rec.id)?;
    if rec.kind.is_empty() {
        return Err(EngineError::Malformed("action type is empty".into()));
    }
    if !kind::is_known(&rec.kind) {
        return Err(EngineError::UnknownType(rec.kind.clone()));
    }

    match rec.kind.as_str() {
        kind::GAME_START => parse_payload::<GameStartPayload>(rec)?.validate(),
        kind::GAME_METADATA_UPDATE => parse_payload::<MetadataPayload>(rec)?.validate(),
        kind::GAME_FINALIZE => Ok(()),
        kind::UNDO => {
            let p: UndoPayload = parse_payload(rec)?;
            require_uuid("actionId", &p.action_id)
        }
        kind::PITCH => {
            let p: PitchPayload = parse_payload(rec)?;
            p.active_ctx.validate()?;
            bounded_opt("type", &p.kind, MAX_LABEL)?;
            bounded_opt("outcome", &p.outcome, MAX_OUTCOME)?;
            bounded_opt("res", &p.res, MAX_OUTCOME)
        }
        kind::BALL_IN_PLAY => {
            let p: BallInPlayPayload = parse_payload(rec)?;
            if let Some(ctx) = &p.active_ctx {
                ctx.validate()?;
            }
            bounded_opt("type", &p.kind, MAX_LABEL)?;
            bounded_opt("outcome", &p.outcome, MAX_OUTCOME)?;
            bounded_opt("res", &p.res, MAX_OUTCOME)
        }
        kind::RUNNER_ADVANCE => {
            let p: RunnerAdvancePayload = parse_payload(rec)?;
            bounded("runner", &p.runner, MAX_RUNNER_KEY)?;
            bounded_opt("source", &p.source, MAX_RUNNER_KEY)?;
            bounded_opt("target", &p.target, MAX_RUNNER_KEY)
        }
        kind::SCORE_UPDATE => {
            let p: ScoreUpdatePayload = parse_payload(rec)?;
            validate_active_team(&p.active_team)?;
            bounded("score", &p.score, MAX_SCORE)
        }
        kind::PLAYER_UPDATE => {
            let p: PlayerUpdatePayload = parse_payload(rec)?;
            validate_active_team(&p.active_team)?;
            bounded_opt("name", &p.name, MAX_PLAYER_NAME)?;
            bounded_opt("number", &p.number, MAX_PLAYER_NUMBER)?;
            bounded_opt("pitcher", &p.pitcher, MAX_PLAYER_NAME)
        }
        kind::COLUMN_ADD => {
            let p: ColumnAddPayload = parse_payload(rec)?;
            bounded("col", &p.col, MAX_COL)?;
            bounded_opt("colId", &p.col_id, MAX_COL)?;
            bounded_opt("action", &p.action, MAX_LABEL)
        }
        other => Err(EngineError::UnknownType(other.to_string())),
    }
}

/// Decode raw client bytes into a validated record.
pub fn validate_bytes(raw: &[u8]) -> Result<ActionRecord> {
    let rec: ActionRecord = serde_json::from_slice(raw)
        .map_err(|e| EngineError::Malformed(format!("action envelope: {e}")))?;
    validate(&rec)?;
    Ok(rec)
}
