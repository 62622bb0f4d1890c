use std::collections::{HashSet, VecDeque};

use crate::constants::{
    normalize_dimension, DEFAULT_MAX_DIMENSION, MAX_GENERATION_ATTEMPTS, PATH_QUESTION_RATE,
    QUESTION_WALL_RATE,
};
use crate::error::GameError;
use crate::rng::Rng;
use crate::types::{Board, Cell, CellType, Direction, Position};

#[derive(Clone, Copy, Debug)]
pub struct MazeOptions {
    pub braid_factor: f32,
    pub path_question_rate: f32,
    pub question_wall_rate: f32,
    pub max_dimension: usize,
}

impl Default for MazeOptions {
    fn default() -> Self {
        Self {
            braid_factor: 0.0,
            path_question_rate: PATH_QUESTION_RATE,
            question_wall_rate: QUESTION_WALL_RATE,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Maze {
    board: Board,
    start: Position,
    exit: Position,
    solution: Vec<Position>,
}

impl Maze {
    pub fn rows(&self) -> usize {
        self.board.rows
    }

    pub fn cols(&self) -> usize {
        self.board.cols
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn start(&self) -> Position {
        self.start
    }

    pub fn exit(&self) -> Position {
        self.exit
    }

    pub fn cell(&self, pos: Position) -> Option<&Cell> {
        self.board.cell(pos)
    }

    pub fn solution(&self) -> &[Position] {
        &self.solution
    }

    pub fn question_cells(&self) -> impl Iterator<Item = Position> + '_ {
        self.board
            .cells()
            .filter(|cell| cell.has_question)
            .map(|cell| cell.position)
    }

    pub fn question_walls(&self) -> impl Iterator<Item = Position> + '_ {
        self.board
            .cells()
            .filter(|cell| cell.is_question_wall)
            .map(|cell| cell.position)
    }

    /// Builds a maze from ASCII rows: `#` wall, `.` path, `S` start, `E` exit,
    /// `?` path with a question, `Q` question-wall, `~` beyond.
    ///
    /// Returns `None` for ragged input or when START or EXIT is missing or repeated.
    pub fn from_tiles(tiles: &[&str]) -> Option<Maze> {
        let rows = tiles.len();
        let cols = tiles.first()?.chars().count();
        let mut grid = Vec::with_capacity(rows);
        let mut start = None;
        let mut exit = None;

        for (y, line) in tiles.iter().enumerate() {
            if line.chars().count() != cols {
                return None;
            }
            let mut row = Vec::with_capacity(cols);
            for (x, ch) in line.chars().enumerate() {
                let position = Position::new(x as i32, y as i32);
                let mut cell = Cell::wall(position);
                match ch {
                    '#' => {}
                    '.' => cell.cell_type = CellType::Path,
                    '?' => {
                        cell.cell_type = CellType::Path;
                        cell.has_question = true;
                    }
                    'Q' => cell.is_question_wall = true,
                    '~' => cell.cell_type = CellType::Beyond,
                    'S' => {
                        if start.replace(position).is_some() {
                            return None;
                        }
                        cell.cell_type = CellType::Start;
                    }
                    'E' => {
                        if exit.replace(position).is_some() {
                            return None;
                        }
                        cell.cell_type = CellType::Exit;
                    }
                    _ => return None,
                }
                row.push(cell);
            }
            grid.push(row);
        }

        let board = Board { rows, cols, grid };
        let start = start?;
        let exit = exit?;
        let solution = shortest_path(&board, start, exit).unwrap_or_default();
        Some(Maze {
            board,
            start,
            exit,
            solution,
        })
    }

    pub fn tiles(&self) -> Vec<String> {
        self.board
            .grid
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| match cell.cell_type {
                        CellType::Start => 'S',
                        CellType::Exit => 'E',
                        CellType::Beyond => '~',
                        CellType::Path if cell.has_question => '?',
                        CellType::Path => '.',
                        CellType::Wall if cell.is_question_wall => 'Q',
                        CellType::Wall => '#',
                    })
                    .collect()
            })
            .collect()
    }
}

pub fn generate_maze(rows: usize, cols: usize, options: &MazeOptions) -> Result<Maze, GameError> {
    generate_maze_with_seed(rows, cols, options, Rng::from_entropy().next_u32())
}

pub fn generate_maze_with_seed(
    rows: usize,
    cols: usize,
    options: &MazeOptions,
    seed: u32,
) -> Result<Maze, GameError> {
    let rows = normalize_dimension(i64::try_from(rows).unwrap_or(i64::MAX), options.max_dimension);
    let cols = normalize_dimension(i64::try_from(cols).unwrap_or(i64::MAX), options.max_dimension);
    let mut rng = Rng::new(seed);

    for attempt in 1..=MAX_GENERATION_ATTEMPTS {
        if let Some(maze) = build_maze(rows, cols, options, &mut rng) {
            if is_connected(&maze) {
                return Ok(maze);
            }
        }
        tracing::warn!(attempt, rows, cols, seed, "generated maze failed validation");
    }

    Err(GameError::GenerationFailure {
        attempts: MAX_GENERATION_ATTEMPTS,
    })
}

pub fn is_connected(maze: &Maze) -> bool {
    maze.start != maze.exit && reachable_from(&maze.board, maze.start).contains(&maze.exit)
}

// Question-walls count as closed.
pub fn reachable_from(board: &Board, start: Position) -> HashSet<Position> {
    let mut out = HashSet::new();
    if !is_open(board, start) {
        return out;
    }

    let mut queue = VecDeque::new();
    out.insert(start);
    queue.push_back(start);

    while let Some(pos) = queue.pop_front() {
        for next in pos.neighbors() {
            if !is_open(board, next) {
                continue;
            }
            if out.insert(next) {
                queue.push_back(next);
            }
        }
    }

    out
}

pub fn is_open(board: &Board, pos: Position) -> bool {
    board
        .cell(pos)
        .map(|cell| cell.cell_type.is_open())
        .unwrap_or(false)
}

fn build_maze(rows: usize, cols: usize, options: &MazeOptions, rng: &mut Rng) -> Option<Maze> {
    let mut grid = vec![vec![CellType::Wall; cols]; rows];
    carve_passages(&mut grid, rows as i32, cols as i32, rng);
    if options.braid_factor > 0.0 {
        braid_dead_ends(&mut grid, rows as i32, cols as i32, options.braid_factor, rng);
    }

    let start = pick_start(rows as i32, cols as i32, rng);
    let mut board = Board {
        rows,
        cols,
        grid: grid
            .iter()
            .enumerate()
            .map(|(y, row)| {
                row.iter()
                    .enumerate()
                    .map(|(x, cell_type)| Cell {
                        position: Position::new(x as i32, y as i32),
                        cell_type: *cell_type,
                        has_question: false,
                        is_question_wall: false,
                    })
                    .collect()
            })
            .collect(),
    };

    let exit = farthest_cell(&board, start)?;
    set_type(&mut board, start, CellType::Start);
    set_type(&mut board, exit, CellType::Exit);
    let solution = shortest_path(&board, start, exit)?;

    place_path_questions(&mut board, options.path_question_rate, rng);
    place_question_walls(&mut board, &solution, options.question_wall_rate, rng);

    Some(Maze {
        board,
        start,
        exit,
        solution,
    })
}

fn carve_passages(grid: &mut [Vec<CellType>], rows: i32, cols: i32, rng: &mut Rng) {
    let cells_x = (cols - 1) / 2;
    let cells_y = (rows - 1) / 2;
    let origin = (
        1 + 2 * rng.pick_index(cells_x as usize) as i32,
        1 + 2 * rng.pick_index(cells_y as usize) as i32,
    );
    grid[origin.1 as usize][origin.0 as usize] = CellType::Path;
    let mut stack = vec![origin];

    while let Some(&(x, y)) = stack.last() {
        let mut dirs = Direction::ALL;
        rng.shuffle(&mut dirs);
        let next = dirs.into_iter().find_map(|dir| {
            let (dx, dy) = dir.delta();
            let (nx, ny) = (x + dx * 2, y + dy * 2);
            if !is_interior(nx, ny, rows, cols) || grid[ny as usize][nx as usize] != CellType::Wall
            {
                return None;
            }
            Some((nx, ny, dx, dy))
        });

        match next {
            Some((nx, ny, dx, dy)) => {
                grid[(y + dy) as usize][(x + dx) as usize] = CellType::Path;
                grid[ny as usize][nx as usize] = CellType::Path;
                stack.push((nx, ny));
            }
            None => {
                stack.pop();
            }
        }
    }
}

fn braid_dead_ends(grid: &mut [Vec<CellType>], rows: i32, cols: i32, factor: f32, rng: &mut Rng) {
    for y in (1..rows - 1).step_by(2) {
        for x in (1..cols - 1).step_by(2) {
            let open_neighbors = Direction::ALL
                .iter()
                .filter(|dir| {
                    let (dx, dy) = dir.delta();
                    grid[(y + dy) as usize][(x + dx) as usize] == CellType::Path
                })
                .count();
            if open_neighbors != 1 || !rng.bool(factor) {
                continue;
            }

            let mut dirs = Direction::ALL;
            rng.shuffle(&mut dirs);
            for dir in dirs {
                let (dx, dy) = dir.delta();
                let (mx, my) = (x + dx, y + dy);
                let (nx, ny) = (x + dx * 2, y + dy * 2);
                if !is_interior(nx, ny, rows, cols) {
                    continue;
                }
                if grid[my as usize][mx as usize] == CellType::Wall
                    && grid[ny as usize][nx as usize] == CellType::Path
                {
                    grid[my as usize][mx as usize] = CellType::Path;
                    break;
                }
            }
        }
    }
}

fn is_interior(x: i32, y: i32, rows: i32, cols: i32) -> bool {
    x >= 1 && y >= 1 && x < cols - 1 && y < rows - 1
}

fn pick_start(rows: i32, cols: i32, rng: &mut Rng) -> Position {
    let mut candidates = Vec::new();
    for y in (1..rows - 1).step_by(2) {
        for x in (1..cols - 1).step_by(2) {
            if x == 1 || y == 1 || x == cols - 2 || y == rows - 2 {
                candidates.push(Position::new(x, y));
            }
        }
    }
    candidates
        .get(rng.pick_index(candidates.len()))
        .copied()
        .unwrap_or(Position::new(1, 1))
}

fn set_type(board: &mut Board, pos: Position, cell_type: CellType) {
    if let Some(cell) = board
        .grid
        .get_mut(pos.y as usize)
        .and_then(|row| row.get_mut(pos.x as usize))
    {
        cell.cell_type = cell_type;
    }
}

fn cell_mut(board: &mut Board, pos: Position) -> Option<&mut Cell> {
    if pos.x < 0 || pos.y < 0 {
        return None;
    }
    board
        .grid
        .get_mut(pos.y as usize)
        .and_then(|row| row.get_mut(pos.x as usize))
}

fn bfs_tree(board: &Board, start: Position) -> (Vec<Vec<Option<Position>>>, Vec<(Position, u32)>) {
    let mut parents = vec![vec![None; board.cols]; board.rows];
    let mut seen = vec![vec![false; board.cols]; board.rows];
    let mut order = Vec::new();
    let mut queue = VecDeque::new();
    if !is_open(board, start) {
        return (parents, order);
    }

    seen[start.y as usize][start.x as usize] = true;
    queue.push_back((start, 0u32));
    while let Some((pos, dist)) = queue.pop_front() {
        order.push((pos, dist));
        for next in pos.neighbors() {
            if !is_open(board, next) || seen[next.y as usize][next.x as usize] {
                continue;
            }
            seen[next.y as usize][next.x as usize] = true;
            parents[next.y as usize][next.x as usize] = Some(pos);
            queue.push_back((next, dist + 1));
        }
    }
    (parents, order)
}

fn farthest_cell(board: &Board, start: Position) -> Option<Position> {
    let (_, order) = bfs_tree(board, start);
    let (pos, dist) = order
        .into_iter()
        .fold(None, |best: Option<(Position, u32)>, (pos, dist)| match best {
            Some((_, best_dist)) if best_dist >= dist => best,
            _ => Some((pos, dist)),
        })?;
    (dist > 0).then_some(pos)
}

fn shortest_path(board: &Board, start: Position, goal: Position) -> Option<Vec<Position>> {
    let (parents, _) = bfs_tree(board, start);
    let mut path = vec![goal];
    let mut cursor = goal;
    while cursor != start {
        cursor = parents
            .get(cursor.y as usize)
            .and_then(|row| row.get(cursor.x as usize))
            .copied()
            .flatten()?;
        path.push(cursor);
    }
    path.reverse();
    Some(path)
}

fn place_path_questions(board: &mut Board, rate: f32, rng: &mut Rng) {
    if rate <= 0.0 {
        return;
    }
    let candidates: Vec<Position> = board
        .cells()
        .filter(|cell| cell.cell_type == CellType::Path)
        .map(|cell| cell.position)
        .collect();
    let chosen = sparse_subset(&candidates, rate, rng);
    for pos in chosen {
        if let Some(cell) = cell_mut(board, pos) {
            cell.has_question = true;
        }
    }
}

fn place_question_walls(board: &mut Board, solution: &[Position], rate: f32, rng: &mut Rng) {
    if rate <= 0.0 {
        return;
    }
    let on_route: HashSet<Position> = solution.iter().copied().collect();
    let mut candidates = Vec::new();
    for cell in board.cells() {
        if cell.cell_type != CellType::Wall {
            continue;
        }
        let pos = cell.position;
        if !pos.neighbors().iter().any(|n| on_route.contains(n)) {
            continue;
        }
        let horizontal = is_open(board, pos.step(Direction::Left))
            && is_open(board, pos.step(Direction::Right));
        let vertical =
            is_open(board, pos.step(Direction::Up)) && is_open(board, pos.step(Direction::Down));
        if horizontal || vertical {
            candidates.push(pos);
        }
    }

    let chosen = sparse_subset(&candidates, rate, rng);
    for pos in chosen {
        if let Some(cell) = cell_mut(board, pos) {
            cell.is_question_wall = true;
        }
    }
}

fn sparse_subset(candidates: &[Position], rate: f32, rng: &mut Rng) -> Vec<Position> {
    let mut chosen: Vec<Position> = candidates
        .iter()
        .copied()
        .filter(|_| rng.bool(rate))
        .collect();
    if chosen.is_empty() && !candidates.is_empty() {
        chosen.push(candidates[rng.pick_index(candidates.len())]);
    }
    chosen
}
