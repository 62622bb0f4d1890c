//! Fog-of-war radius. A view concern only: nothing here touches maze state,
//! and walls do not occlude.

use std::collections::BTreeSet;

use crate::types::{Board, Position};

pub fn is_visible(from: Position, cell: Position, radius: u32) -> bool {
    let dx = i64::from(from.x - cell.x);
    let dy = i64::from(from.y - cell.y);
    let r = i64::from(radius);
    dx * dx + dy * dy <= r * r
}

pub fn visible(from: Position, radius: u32) -> BTreeSet<Position> {
    let r = radius as i32;
    let mut out = BTreeSet::new();
    for y in (from.y - r)..=(from.y + r) {
        for x in (from.x - r)..=(from.x + r) {
            let cell = Position::new(x, y);
            if is_visible(from, cell, radius) {
                out.insert(cell);
            }
        }
    }
    out
}

pub fn visible_in(board: &Board, from: Position, radius: u32) -> BTreeSet<Position> {
    visible(from, radius)
        .into_iter()
        .filter(|pos| board.cell(*pos).is_some())
        .collect()
}
