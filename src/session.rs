use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::GameRules;
use crate::constants::score_multiplier;
use crate::error::GameError;
use crate::maze::Maze;
use crate::questions::{GateKind, QuestionBank, QuestionGate};
use crate::rng::Rng;
use crate::types::{
    CellType, Direction, GameStateView, GameStatus, MoveResult, Player, Position, QuestionView,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingQuestion {
    pub cell: Position,
    pub question_id: u32,
    pub kind: GateKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveOutcome {
    pub result: MoveResult,
    pub question: Option<QuestionView>,
}

impl MoveOutcome {
    fn plain(result: MoveResult) -> Self {
        Self {
            result,
            question: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnswerOutcome {
    pub correct: bool,
    pub opened_wall: Option<Position>,
    pub score_gained: u32,
}

/// One player's maze run.
///
/// ACTIVE moves to WON or LOST and never back. `lives` only goes down and
/// `score` only goes up. Callers serialize access; nothing in here locks.
#[derive(Clone, Debug)]
pub struct GameSession {
    id: String,
    maze: Maze,
    gate: QuestionGate,
    player: Player,
    status: GameStatus,
    pending: Option<PendingQuestion>,
    rules: GameRules,
    started_at: DateTime<Utc>,
}

impl GameSession {
    pub fn new(
        id: String,
        maze: Maze,
        bank: Arc<QuestionBank>,
        rules: GameRules,
        mut rng: Rng,
    ) -> Self {
        let gate = QuestionGate::for_maze(&maze, bank, rng.fork());
        let player = Player {
            current_pos: maze.start(),
            lives: rules.starting_lives,
            score: 0,
        };
        let status = if rules.starting_lives == 0 {
            GameStatus::Lost
        } else {
            GameStatus::Active
        };
        Self {
            id,
            maze,
            gate,
            player,
            status,
            pending: None,
            rules,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn maze(&self) -> &Maze {
        &self.maze
    }

    pub fn player(&self) -> Player {
        self.player
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn pending(&self) -> Option<PendingQuestion> {
        self.pending
    }

    pub fn rules(&self) -> GameRules {
        self.rules
    }

    pub fn apply_move(&mut self, dir: Direction) -> Result<MoveOutcome, GameError> {
        self.ensure_active()?;

        let target = self.player.current_pos.step(dir);
        let Some(cell) = self.maze.cell(target).copied() else {
            return Ok(MoveOutcome::plain(MoveResult::Blocked));
        };

        match cell.cell_type {
            CellType::Beyond => return Ok(MoveOutcome::plain(MoveResult::Blocked)),
            CellType::Wall if !cell.is_question_wall => {
                return Ok(MoveOutcome::plain(MoveResult::Blocked));
            }
            CellType::Wall if !self.gate.is_wall_open(target) => {
                let Some(question) = self.gate.challenge(target) else {
                    return Ok(MoveOutcome::plain(MoveResult::Blocked));
                };
                let view = question.view();
                self.pending = Some(PendingQuestion {
                    cell: target,
                    question_id: view.id,
                    kind: GateKind::QuestionWall,
                });
                return Ok(MoveOutcome {
                    result: MoveResult::QuestionWallHit,
                    question: Some(view),
                });
            }
            _ => {}
        }

        self.player.current_pos = target;
        self.pending = None;

        if cell.cell_type == CellType::Exit {
            self.status = GameStatus::Won;
            tracing::info!(session_id = %self.id, score = self.player.score, "maze solved");
            return Ok(MoveOutcome::plain(MoveResult::Win));
        }

        if cell.has_question {
            if let Some(question) = self.gate.challenge(target) {
                let view = question.view();
                self.pending = Some(PendingQuestion {
                    cell: target,
                    question_id: view.id,
                    kind: GateKind::PathQuestion,
                });
                return Ok(MoveOutcome {
                    result: MoveResult::QuestionFound,
                    question: Some(view),
                });
            }
        }

        Ok(MoveOutcome::plain(MoveResult::Moved))
    }

    pub fn answer(
        &mut self,
        question_id: u32,
        submitted: &str,
    ) -> Result<AnswerOutcome, GameError> {
        self.ensure_active()?;
        let pending = self
            .pending
            .ok_or(GameError::InvalidState("no question is pending"))?;
        if pending.question_id != question_id {
            return Err(GameError::UnknownQuestion(question_id));
        }

        let verdict = self.gate.answer(pending.cell, question_id, submitted)?;
        self.pending = None;

        if verdict.correct {
            let gained = self.rules.base_score * score_multiplier(verdict.difficulty);
            self.player.score = self.player.score.saturating_add(gained);
            let opened_wall = (verdict.kind == GateKind::QuestionWall).then_some(pending.cell);
            return Ok(AnswerOutcome {
                correct: true,
                opened_wall,
                score_gained: gained,
            });
        }

        self.player.lives = self.player.lives.saturating_sub(1);
        if self.player.lives == 0 {
            self.status = GameStatus::Lost;
            tracing::info!(session_id = %self.id, score = self.player.score, "out of lives");
        }
        Ok(AnswerOutcome {
            correct: false,
            opened_wall: None,
            score_gained: 0,
        })
    }

    pub fn snapshot(&self) -> GameStateView {
        GameStateView {
            id: self.id.clone(),
            board: self.maze.board().clone(),
            player: self.player,
            status: self.status,
            opened_walls: self.gate.opened_walls(),
            visibility_radius: self.rules.visibility_radius,
            started_at: self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn ensure_active(&self) -> Result<(), GameError> {
        match self.status {
            GameStatus::Active => Ok(()),
            GameStatus::Won => Err(GameError::InvalidState("game already won")),
            GameStatus::Lost => Err(GameError::InvalidState("game already lost")),
        }
    }
}
