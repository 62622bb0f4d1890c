//! Error taxonomy shared by the engine, the HTTP routes and the realtime channel.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    #[error("game {0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("question {0} is not pending")]
    UnknownQuestion(u32),

    #[error("maze generation failed after {attempts} attempts")]
    GenerationFailure { attempts: u32 },

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl GameError {
    pub fn code(&self) -> &'static str {
        match self {
            GameError::NotFound(_) => "NOT_FOUND",
            GameError::InvalidState(_) => "INVALID_STATE",
            GameError::UnknownQuestion(_) => "UNKNOWN_QUESTION",
            GameError::GenerationFailure { .. } => "GENERATION_FAILURE",
            GameError::MalformedMessage(_) => "MALFORMED_MESSAGE",
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        GameError::MalformedMessage(reason.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuestionBankError {
    #[error("failed to read question bank: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse question bank: {0}")]
    Json(#[from] serde_json::Error),

    #[error("question bank is empty")]
    Empty,

    #[error("question {id} is invalid: {reason}")]
    InvalidQuestion { id: u32, reason: &'static str },
}
