use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::{
    BASE_QUESTION_SCORE, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_DIMENSION,
    DEFAULT_SWEEP_INTERVAL_SECS, SERVER_BRAID_FACTOR, STARTING_LIVES, VISIBILITY_RADIUS,
};
use crate::maze::MazeOptions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameRules {
    pub starting_lives: u32,
    pub visibility_radius: u32,
    pub base_score: u32,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            starting_lives: STARTING_LIVES,
            visibility_radius: VISIBILITY_RADIUS,
            base_score: BASE_QUESTION_SCORE,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Maze quiz game session server")]
pub struct ServerConfig {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// JSON question bank; the bundled bank is used when absent.
    #[arg(long = "questions", env = "QUESTIONS_PATH")]
    pub questions_path: Option<PathBuf>,

    /// Built client bundle served for every non-API path.
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Sessions with no attached channel are evicted after this long.
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "MAX_DIMENSION", default_value_t = DEFAULT_MAX_DIMENSION)]
    pub max_dimension: usize,

    #[arg(long, env = "BRAID_FACTOR", default_value_t = SERVER_BRAID_FACTOR)]
    pub braid_factor: f32,
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn maze_options(&self) -> MazeOptions {
        MazeOptions {
            braid_factor: self.braid_factor.clamp(0.0, 1.0),
            max_dimension: self.max_dimension,
            ..MazeOptions::default()
        }
    }
}
