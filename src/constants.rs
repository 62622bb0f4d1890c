use crate::types::Difficulty;

pub const STARTING_LIVES: u32 = 3;
pub const VISIBILITY_RADIUS: u32 = 3;
pub const BASE_QUESTION_SCORE: u32 = 10;

pub const MIN_DIMENSION: usize = 5;
pub const DEFAULT_MAX_DIMENSION: usize = 151;
pub const DEFAULT_DIMENSION: i64 = 10;

pub const MAX_GENERATION_ATTEMPTS: u32 = 8;
pub const LARGE_BOARD_CELLS: usize = 61 * 61;

pub const PATH_QUESTION_RATE: f32 = 0.05;
pub const QUESTION_WALL_RATE: f32 = 0.15;
pub const SERVER_BRAID_FACTOR: f32 = 0.25;

pub const EVENT_BUFFER: usize = 64;
pub const OUTBOUND_QUEUE: usize = 64;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

pub fn score_multiplier(difficulty: Difficulty) -> u32 {
    match difficulty {
        Difficulty::Easy => 1,
        Difficulty::Medium => 2,
        Difficulty::Hard => 3,
    }
}

pub fn normalize_dimension(requested: i64, max: usize) -> usize {
    let max = max.max(MIN_DIMENSION);
    let max = if max % 2 == 0 { max - 1 } else { max };
    // i64::MAX is odd, so saturating keeps the upper bound odd.
    let max = i64::try_from(max).unwrap_or(i64::MAX);
    let clamped = requested.clamp(MIN_DIMENSION as i64, max) as usize;
    if clamped % 2 == 0 {
        clamped - 1
    } else {
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_dimension_forces_odd_and_minimum() {
        assert_eq!(normalize_dimension(-3, 151), 5);
        assert_eq!(normalize_dimension(0, 151), 5);
        assert_eq!(normalize_dimension(5, 151), 5);
        assert_eq!(normalize_dimension(6, 151), 5);
        assert_eq!(normalize_dimension(10, 151), 9);
        assert_eq!(normalize_dimension(11, 151), 11);
        assert_eq!(normalize_dimension(10_000, 151), 151);
        assert_eq!(normalize_dimension(10_000, 150), 149);
    }

    #[test]
    fn normalize_dimension_tolerates_huge_limits() {
        assert_eq!(normalize_dimension(10, usize::MAX), 9);
        assert_eq!(normalize_dimension(-1, usize::MAX), 5);
        assert_eq!(normalize_dimension(i64::MAX, usize::MAX), i64::MAX as usize);
    }

    #[test]
    fn harder_questions_score_more() {
        assert!(score_multiplier(Difficulty::Easy) < score_multiplier(Difficulty::Medium));
        assert!(score_multiplier(Difficulty::Medium) < score_multiplier(Difficulty::Hard));
    }
}
