use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{GameError, QuestionBankError};
use crate::maze::Maze;
use crate::rng::Rng;
use crate::types::{Difficulty, Position, QuestionView};

const BUILTIN_QUESTIONS: &str = include_str!("../data/questions.json");

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: u32,
    pub text: String,
    pub options: Vec<String>,
    #[serde(rename = "correct_ans")]
    correct_answer: String,
    pub difficulty: Difficulty,
}

impl Question {
    pub fn new(
        id: u32,
        text: impl Into<String>,
        options: Vec<String>,
        correct_answer: impl Into<String>,
        difficulty: Difficulty,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            options,
            correct_answer: correct_answer.into(),
            difficulty,
        }
    }

    pub fn correct_answer(&self) -> &str {
        &self.correct_answer
    }

    pub fn is_correct(&self, submitted: &str) -> bool {
        submitted.trim() == self.correct_answer.trim()
    }

    pub fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id,
            text: self.text.clone(),
            options: self.options.clone(),
            difficulty: self.difficulty,
        }
    }

    fn validate(&self) -> Result<(), QuestionBankError> {
        let invalid = |reason| QuestionBankError::InvalidQuestion {
            id: self.id,
            reason,
        };
        if self.options.is_empty() {
            return Err(invalid("no options"));
        }
        if !self.options.iter().any(|option| self.is_correct(option)) {
            return Err(invalid("correct answer is not one of the options"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct QuestionBank {
    questions: Vec<Question>,
}

impl QuestionBank {
    pub fn new(questions: Vec<Question>) -> Result<Self, QuestionBankError> {
        if questions.is_empty() {
            return Err(QuestionBankError::Empty);
        }
        let mut ids = HashSet::new();
        for question in &questions {
            question.validate()?;
            if !ids.insert(question.id) {
                return Err(QuestionBankError::InvalidQuestion {
                    id: question.id,
                    reason: "duplicate id",
                });
            }
        }
        Ok(Self { questions })
    }

    pub fn from_json_str(raw: &str) -> Result<Self, QuestionBankError> {
        Self::new(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, QuestionBankError> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn builtin() -> Result<Self, QuestionBankError> {
        Self::from_json_str(BUILTIN_QUESTIONS)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Question> {
        self.questions.iter().find(|question| question.id == id)
    }

    pub fn draw(&self, rng: &mut Rng, avoid: Option<u32>) -> &Question {
        let candidates: Vec<&Question> = self
            .questions
            .iter()
            .filter(|question| Some(question.id) != avoid)
            .collect();
        if candidates.is_empty() {
            return &self.questions[rng.pick_index(self.questions.len())];
        }
        candidates[rng.pick_index(candidates.len())]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    PathQuestion,
    QuestionWall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub correct: bool,
    pub kind: GateKind,
    pub difficulty: Difficulty,
}

#[derive(Clone, Debug)]
struct Binding {
    question: Question,
    kind: GateKind,
    settled: bool,
}

/// Binds questions to cells and judges answers.
///
/// A wrong answer consumes a path question for good, but a question-wall
/// stays closed and gets a fresh question for the next approach.
#[derive(Clone, Debug)]
pub struct QuestionGate {
    bank: Arc<QuestionBank>,
    bindings: HashMap<Position, Binding>,
    rng: Rng,
}

impl QuestionGate {
    pub fn new(bank: Arc<QuestionBank>, rng: Rng) -> Self {
        Self {
            bank,
            bindings: HashMap::new(),
            rng,
        }
    }

    pub fn for_maze(maze: &Maze, bank: Arc<QuestionBank>, rng: Rng) -> Self {
        let mut gate = Self::new(bank, rng);
        for cell in maze.question_cells() {
            gate.bind(cell, GateKind::PathQuestion);
        }
        for cell in maze.question_walls() {
            gate.bind(cell, GateKind::QuestionWall);
        }
        gate
    }

    pub fn bind(&mut self, cell: Position, kind: GateKind) -> u32 {
        let question = self.bank.draw(&mut self.rng, None).clone();
        let id = question.id;
        self.bindings.insert(
            cell,
            Binding {
                question,
                kind,
                settled: false,
            },
        );
        id
    }

    pub fn challenge(&self, cell: Position) -> Option<&Question> {
        self.bindings
            .get(&cell)
            .filter(|binding| !binding.settled)
            .map(|binding| &binding.question)
    }

    pub fn answer(
        &mut self,
        cell: Position,
        question_id: u32,
        submitted: &str,
    ) -> Result<Verdict, GameError> {
        let binding = self
            .bindings
            .get_mut(&cell)
            .filter(|binding| !binding.settled && binding.question.id == question_id)
            .ok_or(GameError::UnknownQuestion(question_id))?;

        let verdict = Verdict {
            correct: binding.question.is_correct(submitted),
            kind: binding.kind,
            difficulty: binding.question.difficulty,
        };

        match (verdict.kind, verdict.correct) {
            (GateKind::QuestionWall, false) => {
                binding.question = self.bank.draw(&mut self.rng, Some(question_id)).clone();
            }
            _ => binding.settled = true,
        }
        Ok(verdict)
    }

    pub fn is_pending(&self, cell: Position) -> bool {
        self.challenge(cell).is_some()
    }

    pub fn is_wall_open(&self, cell: Position) -> bool {
        self.bindings
            .get(&cell)
            .map(|binding| binding.kind == GateKind::QuestionWall && binding.settled)
            .unwrap_or(false)
    }

    pub fn opened_walls(&self) -> Vec<Position> {
        let mut out: Vec<Position> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.kind == GateKind::QuestionWall && binding.settled)
            .map(|(pos, _)| *pos)
            .collect();
        out.sort_unstable();
        out
    }
}
