//! Synthetic drivers: each scene owns its VRAM, feeds the engine through
//! `TileSource` callbacks, and composites one frame per tick.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::Result;
use rand::Rng;
use tilescape_common::Color;
use tilescape_engine::{
    scan_rows, Bitmap, Colortable, DrawOp, ScreenConfig, SplitPass, TileFlip, TileInfo, TileSize,
    TileSource, TilemapId, TilemapKind, TilemapSystem,
};

use crate::atlas;
use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};

const LAYER_COLS: u32 = 64;
const LAYER_ROWS: u32 = 32;

/// VRAM word layout used by every demo layer:
/// bits 0-4 tile code, 8-10 palette row, 11-12 split class, 13 priority,
/// 14-15 flip.
const fn word(code: u16, color: u16) -> u16 {
    (code & 0x1f) | (color & 7) << 8
}

const fn word_split(code: u16, color: u16, class: u16) -> u16 {
    word(code, color) | (class & 3) << 11
}

/// One scrolling layer backed by a shared VRAM vector. The scene keeps a
/// clone of the `Rc` so it can write words and mark tiles dirty.
struct VramLayer {
    vram: Rc<RefCell<Vec<u16>>>,
    bank: Arc<[u8]>,
    usage: &'static [u32],
    tile: usize,
}

impl TileSource for VramLayer {
    fn memory_offset(&self, col: u32, row: u32, num_cols: u32, num_rows: u32) -> u32 {
        scan_rows(col, row, num_cols, num_rows)
    }

    fn tile_info(&mut self, memory_offset: u32, info: &mut TileInfo) {
        let word = self
            .vram
            .borrow()
            .get(memory_offset as usize)
            .copied()
            .unwrap_or(0);
        let code = (word & 0x1f) as usize;
        info.pixels = Some(atlas::pixels(&self.bank, self.tile, code));
        info.pen_usage = self.usage[code];
        info.palette_base = ((word >> 8) & 7) as u32 * 32;
        info.split_class = ((word >> 11) & 3) as u8;
        info.priority = ((word >> 13) & 1) as u8;
        info.flip = TileFlip::from_bits_truncate((word >> 14) as u8);
    }
}

fn demo_colortable() -> Colortable {
    let hues: [(u32, u32, u32); 8] = [
        (60, 190, 80),   // grass
        (90, 140, 235),  // sky
        (160, 160, 165), // stone
        (225, 190, 80),  // sand
        (210, 95, 70),   // brick
        (140, 95, 220),  // violet
        (80, 210, 210),  // teal
        (235, 235, 235), // near-white
    ];
    let mut entries = vec![0u16; 256];
    for (row, &(r, g, b)) in hues.iter().enumerate() {
        for pen in 1..32u32 {
            let scale = (72 + pen * 12).min(255);
            let c = Color::new_rgb(
                (r * scale / 255) as u8,
                (g * scale / 255) as u8,
                (b * scale / 255) as u8,
            );
            entries[row * 32 + pen as usize] = c.to_rgb555();
        }
    }
    Colortable::from_entries(entries)
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SceneKind {
    /// Line-scrolled opaque playfield with a transparent text band.
    Playfield,
    /// Split layer whose pillars pass in front of a priority-tested
    /// sprite while the ground stays behind it.
    Split,
}

pub struct Scene {
    kind: SceneKind,
    sys: TilemapSystem<u16>,
    bg: TilemapId,
    fg: TilemapId,
    bg_vram: Rc<RefCell<Vec<u16>>>,
    fg_vram: Rc<RefCell<Vec<u16>>>,
    framebuffer: Bitmap<u16>,
    frame: u64,
    scroll_x: i32,
    speed: i32,
    flipped: bool,
}

const WOBBLE: [i32; 16] = [0, 1, 2, 3, 4, 3, 2, 1, 0, -1, -2, -3, -4, -3, -2, -1];
const SPRITE_COLOR: u16 = 0x2ffd; // warm yellow in rgb555

impl Scene {
    pub fn new(kind: SceneKind) -> Result<Scene> {
        let mut sys = TilemapSystem::new(
            ScreenConfig::plain(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32),
            demo_colortable(),
        );
        let cells = (LAYER_COLS * LAYER_ROWS) as usize;

        let bg_vram = Rc::new(RefCell::new(vec![0u16; cells]));
        let fg_vram = Rc::new(RefCell::new(vec![0u16; cells]));
        match kind {
            SceneKind::Playfield => fill_playfield(&mut bg_vram.borrow_mut()),
            SceneKind::Split => fill_split_field(&mut bg_vram.borrow_mut()),
        }
        fill_overlay(&mut fg_vram.borrow_mut());

        let bg_kind = match kind {
            SceneKind::Playfield => TilemapKind::Opaque,
            SceneKind::Split => TilemapKind::Split,
        };
        let bg = sys.create(
            Box::new(VramLayer {
                vram: bg_vram.clone(),
                bank: atlas::BANK16.clone(),
                usage: &atlas::USAGE16,
                tile: 16,
            }),
            bg_kind,
            TileSize::S16,
            LAYER_COLS,
            LAYER_ROWS,
        )?;
        let fg = sys.create(
            Box::new(VramLayer {
                vram: fg_vram.clone(),
                bank: atlas::BANK8.clone(),
                usage: &atlas::USAGE8,
                tile: 8,
            }),
            TilemapKind::Transparent,
            TileSize::S8,
            LAYER_COLS,
            LAYER_ROWS,
        )?;

        if kind == SceneKind::Split {
            // Class 0 tiles belong wholly to the back pass; class 1 tiles
            // keep pen 0 in the back and their pillar pens in front.
            sys.tilemap_mut(bg).set_transmask(0, 0xffff_ffff);
            sys.tilemap_mut(bg).set_transmask(1, 0x0000_0001);
        }
        if kind == SceneKind::Playfield {
            // One scroll strip per half tile row for the road wobble.
            sys.tilemap_mut(bg).set_scroll_rows(64);
        }

        Ok(Scene {
            kind,
            sys,
            bg,
            fg,
            bg_vram,
            fg_vram,
            framebuffer: Bitmap::new(SCREEN_WIDTH, SCREEN_HEIGHT),
            frame: 0,
            scroll_x: 0,
            speed: 1,
            flipped: false,
        })
    }

    pub fn kind(&self) -> SceneKind {
        self.kind
    }

    pub fn toggle_flip(&mut self) {
        self.flipped = !self.flipped;
        let attributes = if self.flipped {
            TileFlip::X | TileFlip::Y
        } else {
            TileFlip::empty()
        };
        self.sys.set_flip_all(attributes);
        log::info!("flip toggled: {attributes:?}");
    }

    pub fn adjust_speed(&mut self, delta: i32) {
        self.speed = (self.speed + delta).clamp(-8, 8);
        log::debug!("scroll speed now {}", self.speed);
    }

    /// Advance driver state and run the engine's update/render pipeline.
    pub fn tick(&mut self) {
        self.frame += 1;
        self.scroll_x += self.speed;

        match self.kind {
            SceneKind::Playfield => {
                // Line scroll: lower strips drift faster than the horizon
                // and wobble slightly, the classic pseudo-road effect.
                for strip in 0..64usize {
                    let depth = strip as i32;
                    let value = self.scroll_x * (8 + depth) / 40
                        + WOBBLE[(strip + self.frame as usize / 8) % WOBBLE.len()];
                    self.sys.tilemap_mut(self.bg).set_scrollx(strip, value);
                }
            }
            SceneKind::Split => {
                self.sys.tilemap_mut(self.bg).set_scrollx(0, self.scroll_x / 2);
            }
        }
        self.sys.tilemap_mut(self.fg).set_scrollx(0, self.scroll_x / 4);

        // Blink one overlay star so the dirty-tile path runs every frame.
        if self.frame % 16 == 0 {
            let col = (self.frame / 16 * 7) % LAYER_COLS as u64;
            let offset = 3 * LAYER_COLS as u64 + col;
            let current = self.fg_vram.borrow()[offset as usize];
            let next = if current == 0 { word(12, 6) } else { 0 };
            self.write_fg(offset as u32, next);
        }

        self.sys.update_all();
        self.sys.render_all();
    }

    /// Composite the frame: layers back to front, then a sprite gated by
    /// the priority buffer so front-pass pixels occlude it.
    pub fn composite(&mut self) -> &Bitmap<u16> {
        self.framebuffer.fill(0);
        let Scene {
            kind,
            sys,
            bg,
            fg,
            framebuffer,
            frame,
            ..
        } = self;

        match kind {
            SceneKind::Playfield => {
                sys.draw(framebuffer, *bg, DrawOp::default());
                sys.draw(
                    framebuffer,
                    *fg,
                    DrawOp {
                        priority_code: 1,
                        ..DrawOp::default()
                    },
                );
            }
            SceneKind::Split => {
                sys.draw(
                    framebuffer,
                    *bg,
                    DrawOp {
                        pass: SplitPass::Back,
                        ..DrawOp::default()
                    },
                );
                sys.draw(
                    framebuffer,
                    *bg,
                    DrawOp {
                        pass: SplitPass::Front,
                        priority_code: 1,
                        ..DrawOp::default()
                    },
                );
                sys.draw(
                    framebuffer,
                    *fg,
                    DrawOp {
                        priority_code: 1,
                        ..DrawOp::default()
                    },
                );
            }
        }

        let t = *frame as i32;
        let sprite_x = t * 2 % (SCREEN_WIDTH as i32 + 64) - 32;
        let sprite_y = SCREEN_HEIGHT as i32 / 2 + WOBBLE[(t as usize / 4) % WOBBLE.len()] * 4;
        draw_sprite(framebuffer, sys.priority_buffer(), sprite_x, sprite_y);

        &self.framebuffer
    }

    fn write_fg(&mut self, offset: u32, value: u16) {
        let changed = {
            let mut vram = self.fg_vram.borrow_mut();
            let slot = &mut vram[offset as usize];
            let changed = *slot != value;
            *slot = value;
            changed
        };
        if changed {
            self.sys.tilemap_mut(self.fg).mark_tile_dirty(offset);
        }
    }

    #[cfg(test)]
    fn write_bg(&mut self, offset: u32, value: u16) {
        self.bg_vram.borrow_mut()[offset as usize] = value;
        self.sys.tilemap_mut(self.bg).mark_tile_dirty(offset);
    }
}

/// 16x16 diamond sprite, drawn only where no front-pass pixel (priority
/// code >= 1) was stamped.
fn draw_sprite(fb: &mut Bitmap<u16>, priority: &Bitmap<u8>, x0: i32, y0: i32) {
    for dy in 0..16i32 {
        for dx in 0..16i32 {
            if (dx - 8).abs() + (dy - 8).abs() > 8 {
                continue;
            }
            let (x, y) = (x0 + dx, y0 + dy);
            if x < 0 || y < 0 || x >= fb.width() as i32 || y >= fb.height() as i32 {
                continue;
            }
            if priority.pixel(x as usize, y as usize) < 1 {
                fb.set_pixel(x as usize, y as usize, SPRITE_COLOR);
            }
        }
    }
}

/// Opaque terrain: sky gradient, brick horizon, checkered ground with
/// scattered props.
fn fill_playfield(vram: &mut [u16]) {
    for row in 0..LAYER_ROWS as usize {
        for col in 0..LAYER_COLS as usize {
            let offset = row * LAYER_COLS as usize + col;
            vram[offset] = match row {
                0..=7 => word(8 + (row as u16 / 2).min(3), 1),
                8..=9 => word(6, 4),
                _ => word(2, 0),
            };
        }
    }
    let mut rng = rand::thread_rng();
    for _ in 0..48 {
        let col = rng.gen_range(0..LAYER_COLS as usize);
        let row = rng.gen_range(11..LAYER_ROWS as usize);
        let code = if rng.gen_bool(0.5) { 4 } else { 5 };
        let color = if rng.gen_bool(0.3) { 3 } else { 0 };
        vram[row * LAYER_COLS as usize + col] = word(code, color);
    }
}

/// Split-scene field: class-0 ground and sky drawn wholly in the back
/// pass, class-1 pillar columns whose pillars render in the front pass.
fn fill_split_field(vram: &mut [u16]) {
    for row in 0..LAYER_ROWS as usize {
        for col in 0..LAYER_COLS as usize {
            let offset = row * LAYER_COLS as usize + col;
            vram[offset] = match row {
                0..=7 => word_split(8 + (row as u16 / 2).min(3), 1, 0),
                8..=14 if col % 5 == 0 => word_split(7, 2, 1),
                _ => word_split(2, 0, 0),
            };
        }
    }
}

/// Transparent overlay: a marquee band plus sparse star rows.
fn fill_overlay(vram: &mut [u16]) {
    let cols = LAYER_COLS as usize;
    for col in 0..cols {
        let code = if col % 2 == 0 { 4 } else { 13 };
        vram[6 * cols + col] = word(code, 7);
    }
    for row in [2usize, 4] {
        for col in 0..cols {
            if (col * 11 + row) % 7 == 0 {
                vram[row * cols + col] = word(12, 6);
            }
        }
    }
}
