use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::GameError;
use crate::session::{AnswerOutcome, GameSession, MoveOutcome};
use crate::types::{
    Direction, GameStateView, GameStatus, MoveResult, Player, Position, QuestionView,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Move { direction: Direction },
    Answer { question_id: u32, answer: String },
    Sync,
    Ping { t: f64 },
}

pub fn parse_client_message(raw: &str) -> Result<ClientMessage, GameError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|_| GameError::malformed("payload is not valid JSON"))?;
    let object = value
        .as_object()
        .ok_or_else(|| GameError::malformed("payload must be a JSON object"))?;
    let message_type = required_str(object, "type")?;

    match message_type {
        "move" => {
            let raw_direction = required_str(object, "direction")?;
            let direction = Direction::parse(raw_direction).ok_or_else(|| {
                GameError::malformed(format!("unknown direction {raw_direction:?}"))
            })?;
            Ok(ClientMessage::Move { direction })
        }
        "answer" => {
            let question_id = object
                .get("question_id")
                .and_then(Value::as_u64)
                .and_then(|id| u32::try_from(id).ok())
                .ok_or_else(|| GameError::malformed("question_id must be a non-negative integer"))?;
            let answer = required_str(object, "answer")?.to_string();
            Ok(ClientMessage::Answer {
                question_id,
                answer,
            })
        }
        "sync" => Ok(ClientMessage::Sync),
        "ping" => {
            let t = object
                .get("t")
                .and_then(Value::as_f64)
                .filter(|t| t.is_finite())
                .ok_or_else(|| GameError::malformed("t must be a finite number"))?;
            Ok(ClientMessage::Ping { t })
        }
        other => Err(GameError::malformed(format!(
            "unknown message type {other:?}"
        ))),
    }
}

fn required_str<'a>(object: &'a Map<String, Value>, key: &str) -> Result<&'a str, GameError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| GameError::malformed(format!("{key} must be a string")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    Moved,
    Blocked,
    QuestionWallHit,
    QuestionFound,
    Win,
    Correct,
    Incorrect,
    Sync,
}

impl From<MoveResult> for UpdateResult {
    fn from(result: MoveResult) -> Self {
        match result {
            MoveResult::Moved => UpdateResult::Moved,
            MoveResult::Blocked => UpdateResult::Blocked,
            MoveResult::QuestionWallHit => UpdateResult::QuestionWallHit,
            MoveResult::QuestionFound => UpdateResult::QuestionFound,
            MoveResult::Win => UpdateResult::Win,
        }
    }
}

/// Body of an `update` message.
///
/// Clients merge it into their state by replacing whole top-level fields.
/// `seq` orders updates of one session; terminal updates carry `game_state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub seq: u64,
    pub result: UpdateResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<Player>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<GameStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<QuestionView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_wall: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_state: Option<GameStateView>,
}

impl UpdatePayload {
    pub fn sync(seq: u64, snapshot: GameStateView) -> Self {
        Self {
            seq,
            result: UpdateResult::Sync,
            player: Some(snapshot.player),
            status: Some(snapshot.status),
            question: None,
            correct: None,
            opened_wall: None,
            game_state: Some(snapshot),
        }
    }

    pub fn for_move(seq: u64, outcome: &MoveOutcome, session: &GameSession) -> Self {
        Self {
            seq,
            result: outcome.result.into(),
            player: Some(session.player()),
            status: Some(session.status()),
            question: outcome.question.clone(),
            correct: None,
            opened_wall: None,
            game_state: terminal_snapshot(session),
        }
    }

    pub fn for_answer(seq: u64, outcome: &AnswerOutcome, session: &GameSession) -> Self {
        Self {
            seq,
            result: if outcome.correct {
                UpdateResult::Correct
            } else {
                UpdateResult::Incorrect
            },
            player: Some(session.player()),
            status: Some(session.status()),
            question: None,
            correct: Some(outcome.correct),
            opened_wall: outcome.opened_wall,
            game_state: terminal_snapshot(session),
        }
    }
}

fn terminal_snapshot(session: &GameSession) -> Option<GameStateView> {
    session
        .status()
        .is_terminal()
        .then(|| session.snapshot())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&GameError> for ErrorPayload {
    fn from(error: &GameError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    pub t: f64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Update(&'a UpdatePayload),
    Error(ErrorPayload),
    Pong(PongPayload),
}

impl ServerMessage<'_> {
    pub fn error(error: &GameError) -> ServerMessage<'static> {
        ServerMessage::Error(error.into())
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            json!({
                "type": "error",
                "payload": { "code": "INTERNAL", "message": err.to_string() },
            })
            .to_string()
        })
    }
}
