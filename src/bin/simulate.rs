use clap::Parser;
use maze_quest_server::config::GameRules;
use maze_quest_server::constants::normalize_dimension;
use maze_quest_server::error::GameError;
use maze_quest_server::maze::{generate_maze_with_seed, MazeOptions};
use maze_quest_server::questions::QuestionBank;
use maze_quest_server::rng::Rng;
use maze_quest_server::session::GameSession;
use maze_quest_server::types::{
    Cell, CellType, Direction, GameStatus, MoveResult, Player, Position, QuestionView,
};
use maze_quest_server::visibility::visible_in;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plays headless bot games and reports invariant anomalies")]
struct Cli {
    #[arg(long, default_value_t = 20)]
    games: u32,
    #[arg(long, default_value_t = 21)]
    rows: i64,
    #[arg(long, default_value_t = 21)]
    cols: i64,
    #[arg(long)]
    seed: Option<u64>,
    /// Probability that the bot answers a question correctly.
    #[arg(long, default_value_t = 0.7)]
    accuracy: f32,
    #[arg(long, default_value_t = 5_000)]
    max_steps: u32,
    #[arg(long, default_value_t = 0.25)]
    braid: f32,
    #[arg(long)]
    summary_out: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug)]
struct GameSetup {
    index: u32,
    seed: u32,
    rows: usize,
    cols: usize,
    accuracy: f32,
    max_steps: u32,
}

#[derive(Clone, Debug, Serialize)]
struct GameResultLine {
    game: u32,
    seed: u32,
    rows: usize,
    cols: usize,
    status: Option<GameStatus>,
    steps: u32,
    lives: u32,
    score: u32,
    questions_answered: u32,
    correct_answers: u32,
    walls_opened: usize,
    anomalies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct RunSummary {
    run_id: String,
    started_at_ms: u64,
    finished_at_ms: u64,
    game_count: usize,
    anomaly_count: usize,
    average_steps: u32,
    status_counts: BTreeMap<String, usize>,
    games: Vec<GameResultLine>,
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simulate=info,maze_quest_server=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let bank = match QuestionBank::builtin() {
        Ok(bank) => Arc::new(bank),
        Err(err) => {
            tracing::error!(%err, "built-in question bank is invalid");
            std::process::exit(2);
        }
    };
    let options = MazeOptions {
        braid_factor: cli.braid.clamp(0.0, 1.0),
        ..MazeOptions::default()
    };
    let started_at_ms = now_ms();
    let base_seed = cli.seed.unwrap_or(started_at_ms) as u32;
    let run_id = format!("sim-{base_seed}-{started_at_ms}");
    let rows = normalize_dimension(cli.rows, options.max_dimension);
    let cols = normalize_dimension(cli.cols, options.max_dimension);

    let mut results = Vec::new();
    for index in 0..cli.games {
        let setup = GameSetup {
            index,
            seed: base_seed.wrapping_add(index),
            rows,
            cols,
            accuracy: cli.accuracy.clamp(0.0, 1.0),
            max_steps: cli.max_steps,
        };
        let result = play_game(&setup, &options, &bank);
        for anomaly in &result.anomalies {
            tracing::warn!(game = index, seed = setup.seed, anomaly = %anomaly, "anomaly detected");
        }
        match serde_json::to_string(&result) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::error!(%err, "failed to encode game result"),
        }
        results.push(result);
    }

    let summary = build_run_summary(run_id, started_at_ms, now_ms(), results);
    if let Some(path) = cli.summary_out.as_ref() {
        if let Err(err) = write_summary(path, &summary) {
            tracing::error!(path = %path.display(), %err, "failed to write summary");
            std::process::exit(2);
        }
    }
    tracing::info!(
        games = summary.game_count,
        anomalies = summary.anomaly_count,
        average_steps = summary.average_steps,
        statuses = ?summary.status_counts,
        "run finished"
    );

    if summary.anomaly_count > 0 {
        std::process::exit(1);
    }
}

fn play_game(setup: &GameSetup, options: &MazeOptions, bank: &Arc<QuestionBank>) -> GameResultLine {
    let mut result = GameResultLine {
        game: setup.index,
        seed: setup.seed,
        rows: setup.rows,
        cols: setup.cols,
        status: None,
        steps: 0,
        lives: 0,
        score: 0,
        questions_answered: 0,
        correct_answers: 0,
        walls_opened: 0,
        anomalies: Vec::new(),
    };

    let mut rng = Rng::new(setup.seed);
    let maze = match generate_maze_with_seed(setup.rows, setup.cols, options, rng.next_u32()) {
        Ok(maze) => maze,
        Err(err) => {
            result.anomalies.push(format!("generation failed: {err}"));
            return result;
        }
    };
    let mut session = GameSession::new(
        format!("sim_{}", setup.index),
        maze,
        Arc::clone(bank),
        GameRules::default(),
        rng.fork(),
    );
    let mut bot = Explorer::default();
    let mut anomalies = AnomalyLog::default();

    while !session.status().is_terminal() && result.steps < setup.max_steps {
        let pos = session.player().current_pos;
        bot.observe(&session);
        let Some(dir) = bot.next_direction(pos) else {
            anomalies.push("bot has nowhere left to go".into());
            break;
        };

        let before = session.player();
        let outcome = match session.apply_move(dir) {
            Ok(outcome) => outcome,
            Err(err) => {
                anomalies.push(format!("move rejected while active: {err}"));
                break;
            }
        };
        result.steps += 1;
        for anomaly in check_move(before, dir, outcome.result, &session) {
            anomalies.push(anomaly);
        }

        match outcome.result {
            MoveResult::Blocked => bot.mark_blocked(before.current_pos.step(dir)),
            MoveResult::QuestionWallHit | MoveResult::QuestionFound => {
                let Some(question) = outcome.question else {
                    anomalies.push(format!("{:?} without a question", outcome.result));
                    continue;
                };
                let submitted = choose_answer(&question, bank, setup.accuracy, &mut rng);
                let lives_before = session.player().lives;
                match session.answer(question.id, &submitted) {
                    Ok(answer) => {
                        result.questions_answered += 1;
                        if answer.correct {
                            result.correct_answers += 1;
                        } else if session.player().lives + 1 != lives_before {
                            anomalies.push("wrong answer did not cost exactly one life".into());
                        }
                        if session.player().lives == 0 && session.status() != GameStatus::Lost {
                            anomalies.push("no lives left but game not lost".into());
                        }
                    }
                    Err(err) => {
                        anomalies.push(format!("answer rejected: {err}"));
                    }
                }
            }
            MoveResult::Moved | MoveResult::Win => {}
        }
    }

    if session.status().is_terminal() {
        let frozen = session.player();
        if !matches!(session.apply_move(Direction::Up), Err(GameError::InvalidState(_))) {
            anomalies.push("terminal session accepted a move".into());
        }
        if session.player() != frozen {
            anomalies.push("terminal session mutated".into());
        }
    }

    let player = session.player();
    result.anomalies = anomalies.into_messages();
    result.status = Some(session.status());
    result.lives = player.lives;
    result.score = player.score;
    result.walls_opened = session.snapshot().opened_walls.len();
    result
}

fn check_move(
    before: Player,
    dir: Direction,
    result: MoveResult,
    session: &GameSession,
) -> Vec<String> {
    let after = session.player();
    let mut anomalies = Vec::new();
    if after.lives > before.lives {
        anomalies.push(format!("lives increased {} -> {}", before.lives, after.lives));
    }
    if after.score < before.score {
        anomalies.push(format!("score decreased {} -> {}", before.score, after.score));
    }
    match result {
        MoveResult::Blocked | MoveResult::QuestionWallHit => {
            if after.current_pos != before.current_pos {
                anomalies.push(format!("{result:?} moved the player"));
            }
        }
        MoveResult::Moved | MoveResult::QuestionFound | MoveResult::Win => {
            if after.current_pos != before.current_pos.step(dir) {
                anomalies.push(format!("{result:?} did not advance one cell"));
            }
        }
    }
    if (result == MoveResult::Win) != (session.status() == GameStatus::Won) {
        anomalies.push(format!("{result:?} with status {:?}", session.status()));
    }
    if result == MoveResult::Win && after.current_pos != session.maze().exit() {
        anomalies.push("won away from the exit".to_string());
    }
    anomalies
}

fn choose_answer(
    question: &QuestionView,
    bank: &QuestionBank,
    accuracy: f32,
    rng: &mut Rng,
) -> String {
    let correct = bank
        .get(question.id)
        .map(|q| q.correct_answer().to_string())
        .unwrap_or_default();
    if rng.bool(accuracy) {
        return correct;
    }
    let wrong: Vec<&String> = question
        .options
        .iter()
        .filter(|option| option.trim() != correct.trim())
        .collect();
    if wrong.is_empty() {
        format!("not {correct}")
    } else {
        wrong[rng.pick_index(wrong.len())].clone()
    }
}

#[derive(Default)]
struct Explorer {
    known: HashMap<Position, Cell>,
    visited: HashSet<Position>,
    blocked: HashSet<Position>,
    exit: Option<Position>,
}

impl Explorer {
    fn observe(&mut self, session: &GameSession) {
        let pos = session.player().current_pos;
        self.visited.insert(pos);
        let board = session.maze().board();
        for cell_pos in visible_in(board, pos, session.rules().visibility_radius) {
            if let Some(cell) = board.cell(cell_pos) {
                if cell.cell_type == CellType::Exit {
                    self.exit = Some(cell_pos);
                }
                self.known.insert(cell_pos, *cell);
            }
        }
    }

    fn mark_blocked(&mut self, pos: Position) {
        self.blocked.insert(pos);
    }

    fn passable(&self, pos: Position) -> bool {
        !self.blocked.contains(&pos)
            && self
                .known
                .get(&pos)
                .is_some_and(|cell| cell.cell_type.is_open() || cell.is_question_wall)
    }

    fn next_direction(&self, from: Position) -> Option<Direction> {
        self.exit
            .and_then(|exit| self.first_step(from, |pos| pos == exit))
            .or_else(|| self.first_step(from, |pos| !self.visited.contains(&pos)))
    }

    fn first_step(
        &self,
        from: Position,
        is_target: impl Fn(Position) -> bool,
    ) -> Option<Direction> {
        let mut parents: HashMap<Position, Position> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut target = None;
        while let Some(pos) = queue.pop_front() {
            if pos != from && is_target(pos) {
                target = Some(pos);
                break;
            }
            for next in pos.neighbors() {
                if next != from && !parents.contains_key(&next) && self.passable(next) {
                    parents.insert(next, pos);
                    queue.push_back(next);
                }
            }
        }

        let mut step = target?;
        while let Some(parent) = parents.get(&step).copied() {
            if parent == from {
                break;
            }
            step = parent;
        }
        Direction::ALL.into_iter().find(|dir| from.step(*dir) == step)
    }
}

#[derive(Default)]
struct AnomalyLog {
    messages: Vec<String>,
    seen: HashSet<String>,
}

impl AnomalyLog {
    fn push(&mut self, message: String) {
        if self.seen.insert(message.clone()) {
            self.messages.push(message);
        }
    }

    fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

fn status_key(status: Option<GameStatus>) -> String {
    match status {
        Some(GameStatus::Won) => "won",
        Some(GameStatus::Lost) => "lost",
        Some(GameStatus::Active) => "unfinished",
        None => "not_started",
    }
    .to_string()
}

fn build_run_summary(
    run_id: String,
    started_at_ms: u64,
    finished_at_ms: u64,
    games: Vec<GameResultLine>,
) -> RunSummary {
    let game_count = games.len();
    let anomaly_count = games.iter().map(|game| game.anomalies.len()).sum();
    let total_steps: u64 = games.iter().map(|game| u64::from(game.steps)).sum();
    let average_steps = if game_count == 0 {
        0
    } else {
        (total_steps / game_count as u64) as u32
    };
    let mut status_counts = BTreeMap::new();
    for game in &games {
        *status_counts.entry(status_key(game.status)).or_insert(0) += 1;
    }
    RunSummary {
        run_id,
        started_at_ms,
        finished_at_ms,
        game_count,
        anomaly_count,
        average_steps,
        status_counts,
        games,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn write_summary(path: &Path, summary: &RunSummary) -> io::Result<()> {
    let summary_text = serde_json::to_string_pretty(summary).map_err(io::Error::other)?;
    std::fs::write(path, summary_text)
}
