//! Procedural tile artwork shared by the demo scenes.
//!
//! Real drivers decode tile graphics out of ROM; we synthesize a small
//! bank of patterns instead. Pens stay below 16 so one colortable row of
//! 32 entries is plenty, and pen 0 doubles as the transparent pen.

use std::sync::Arc;

use lazy_static::lazy_static;
use tilescape_engine::{compute_pen_usage, TilePixels};

/// Number of distinct tile patterns in each bank.
pub const TILE_COUNT: usize = 32;

lazy_static! {
    pub static ref BANK16: Arc<[u8]> = build_bank(16);
    pub static ref BANK8: Arc<[u8]> = build_bank(8);
    pub static ref USAGE16: Vec<u32> = usage_table(&BANK16, 16);
    pub static ref USAGE8: Vec<u32> = usage_table(&BANK8, 8);
}

pub fn pixels(bank: &Arc<[u8]>, tile: usize, code: usize) -> TilePixels {
    let code = code % TILE_COUNT;
    TilePixels::new(bank.clone(), code * tile * tile)
}

fn build_bank(t: usize) -> Arc<[u8]> {
    let mut data = vec![0u8; TILE_COUNT * t * t];
    for code in 0..TILE_COUNT {
        let tile = &mut data[code * t * t..(code + 1) * t * t];
        for y in 0..t {
            for x in 0..t {
                tile[y * t + x] = pen_at(code, x, y, t);
            }
        }
    }
    data.into()
}

fn usage_table(bank: &Arc<[u8]>, t: usize) -> Vec<u32> {
    (0..TILE_COUNT)
        .map(|code| compute_pen_usage(&TilePixels::new(bank.clone(), code * t * t), t))
        .collect()
}

fn pen_at(code: usize, x: usize, y: usize, t: usize) -> u8 {
    let (fx, fy) = (x as i32, y as i32);
    let edge = t as i32 - 1;
    match code {
        // 0: fully transparent, 1: solid fill.
        0 => 0,
        1 => 1,
        // Coarse checkerboard.
        2 => {
            if (x / (t / 4) + y / (t / 4)) % 2 == 0 {
                2
            } else {
                3
            }
        }
        // Diagonal stripes.
        3 => ((x + y) * 4 / t % 4 + 1) as u8,
        // Hollow ring on transparent ground.
        4 => {
            let (dx, dy) = (2 * fx - edge, 2 * fy - edge);
            let d2 = dx * dx + dy * dy;
            let r2 = edge * edge;
            if d2 <= r2 && d2 >= r2 / 4 {
                4
            } else {
                0
            }
        }
        // Solid dome: circle filled, rest transparent.
        5 => {
            let (dx, dy) = (2 * fx - edge, 2 * fy - edge);
            if dx * dx + dy * dy <= edge * edge {
                5
            } else {
                0
            }
        }
        // Brick courses.
        6 => {
            let course = y / (t / 4);
            let shift = if course % 2 == 0 { 0 } else { t / 2 };
            if y % (t / 4) == 0 || (x + shift) % t < 1 {
                6
            } else {
                7
            }
        }
        // Vertical pillar with transparent margins, used by split scenes.
        7 => {
            if x >= t / 4 && x < 3 * t / 4 {
                8
            } else {
                0
            }
        }
        // Horizon gradient bands.
        8..=11 => (1 + (y * 4 / t) + (code - 8)) as u8 & 0x0f,
        // Sparse starfield dots on transparent ground.
        12 => {
            if (x * 7 + y * 13) % 29 == 0 {
                9
            } else {
                0
            }
        }
        // Cross-hatch.
        13 => {
            if x == t / 2 || y == t / 2 {
                10
            } else {
                0
            }
        }
        // Remaining codes: deterministic dither so every code looks
        // different without a table of hand-drawn art.
        _ => ((x * 3 + y * 5 + code * 7) % 5 + 1) as u8,
    }
}
