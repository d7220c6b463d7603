//! The compositor context: owns the priority buffer, the scratch decode
//! record, the palette boundary, and the registry of live tilemaps.

use anyhow::Result;

use crate::bitmap::{Bitmap, Pixel, Rect};
use crate::palette::{Colortable, PaletteUsage};
use crate::tile::{Orientation, TileFlip, TileInfo, TileSize, TileSource, TilemapKind};
use crate::tilemap::{DrawOp, Tilemap};

/// Geometry of the destination surface, in post-rotation (framebuffer)
/// pixels, plus the one-time global orientation. `visible_area` is in
/// logical screen coordinates and becomes each new tilemap's initial clip.
#[derive(Clone, Copy, Debug)]
pub struct ScreenConfig {
    pub width: u32,
    pub height: u32,
    pub visible_area: Rect,
    pub orientation: Orientation,
}

impl ScreenConfig {
    /// Unrotated screen with the whole surface visible.
    pub fn plain(width: u32, height: u32) -> ScreenConfig {
        ScreenConfig {
            width,
            height,
            visible_area: Rect::new(0, 0, width as i32, height as i32),
            orientation: Orientation::empty(),
        }
    }
}

/// Handle to a tilemap inside a [`TilemapSystem`]. Stays valid until the
/// tilemap is disposed; handles are never reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TilemapId(usize);

/// Owns every scrolling layer of one render surface together with the
/// state they share: the priority buffer, the colortable and its usage
/// counts, and the scratch record passed across the driver callback
/// boundary.
///
/// The per-frame contract is `update_all`, then `render_all`, then `draw`
/// calls in back-to-front order. The engine does not enforce the order;
/// violating it yields stale pixels, not a crash.
pub struct TilemapSystem<P: Pixel> {
    screen: ScreenConfig,
    colortable: Colortable,
    usage: PaletteUsage,
    priority: Bitmap<u8>,
    scratch: TileInfo,
    tilemaps: Vec<Option<Tilemap<P>>>,
}

impl<P: Pixel> TilemapSystem<P> {
    pub fn new(screen: ScreenConfig, colortable: Colortable) -> TilemapSystem<P> {
        let usage = PaletteUsage::new(colortable.len());
        let priority = Bitmap::new(screen.width as usize, screen.height as usize);
        TilemapSystem {
            screen,
            colortable,
            usage,
            priority,
            scratch: TileInfo::default(),
            tilemaps: Vec::new(),
        }
    }

    pub fn screen(&self) -> &ScreenConfig {
        &self.screen
    }

    /// Register a new layer. Fails fast on bad geometry; on error nothing
    /// is registered and no partially-built layer exists.
    pub fn create(
        &mut self,
        source: Box<dyn TileSource>,
        kind: TilemapKind,
        tile: TileSize,
        num_cols: u32,
        num_rows: u32,
    ) -> Result<TilemapId> {
        let tilemap = Tilemap::new(source, kind, tile, num_cols, num_rows, &self.screen)?;
        let id = TilemapId(self.tilemaps.len());
        log::info!(
            "created {kind:?} tilemap {}: {num_cols}x{num_rows} tiles of {}px",
            id.0,
            tile.pixels()
        );
        self.tilemaps.push(Some(tilemap));
        Ok(id)
    }

    /// Drop a layer, releasing its buffers and giving back its palette
    /// usage counts. Disposing twice is a no-op.
    pub fn dispose(&mut self, id: TilemapId) {
        if let Some(slot) = self.tilemaps.get_mut(id.0) {
            if let Some(tilemap) = slot.take() {
                tilemap.unregister_all(&mut self.usage);
                log::debug!("disposed tilemap {}", id.0);
            }
        }
    }

    /// Borrow a layer for configuration. Panics if `id` was disposed.
    pub fn tilemap(&self, id: TilemapId) -> &Tilemap<P> {
        self.tilemaps[id.0].as_ref().expect("tilemap was disposed")
    }

    pub fn tilemap_mut(&mut self, id: TilemapId) -> &mut Tilemap<P> {
        self.tilemaps[id.0].as_mut().expect("tilemap was disposed")
    }

    /// Re-decode dirty tiles of one layer.
    pub fn update(&mut self, id: TilemapId) {
        let TilemapSystem {
            tilemaps,
            scratch,
            usage,
            colortable,
            ..
        } = self;
        if let Some(Some(tilemap)) = tilemaps.get_mut(id.0) {
            tilemap.update(scratch, usage, colortable);
        }
    }

    /// Start a frame: clear the priority buffer and re-decode dirty tiles
    /// of every layer.
    pub fn update_all(&mut self) {
        self.priority.fill(0);
        let TilemapSystem {
            tilemaps,
            scratch,
            usage,
            colortable,
            ..
        } = self;
        for tilemap in tilemaps.iter_mut().flatten() {
            tilemap.update(scratch, usage, colortable);
        }
    }

    /// Repaint pixel-dirty tiles of one layer into its pixmap.
    pub fn render(&mut self, id: TilemapId) {
        let TilemapSystem {
            tilemaps,
            colortable,
            ..
        } = self;
        if let Some(Some(tilemap)) = tilemaps.get_mut(id.0) {
            tilemap.render(colortable);
        }
    }

    pub fn render_all(&mut self) {
        let TilemapSystem {
            tilemaps,
            colortable,
            ..
        } = self;
        for tilemap in tilemaps.iter_mut().flatten() {
            tilemap.render(colortable);
        }
    }

    /// Composite one layer onto `dest`, stamping the shared priority
    /// buffer. Callers issue draws in back-to-front order.
    pub fn draw(&mut self, dest: &mut Bitmap<P>, id: TilemapId, op: DrawOp) {
        let TilemapSystem {
            tilemaps, priority, ..
        } = self;
        if let Some(Some(tilemap)) = tilemaps.get(id.0) {
            tilemap.draw_into(dest, priority, op);
        }
    }

    /// Runtime flip broadcast to every layer.
    pub fn set_flip_all(&mut self, attributes: TileFlip) {
        for tilemap in self.tilemaps.iter_mut().flatten() {
            tilemap.set_flip(attributes);
        }
    }

    /// Force a repaint of every layer (palette changed externally).
    pub fn mark_all_pixels_dirty(&mut self) {
        for tilemap in self.tilemaps.iter_mut().flatten() {
            tilemap.mark_all_pixels_dirty();
        }
    }

    /// Pick up colortable edits: if any entry changed since the last
    /// call, every layer is flagged for repaint. Returns whether that
    /// happened.
    pub fn recalc_palette(&mut self) -> bool {
        if self.colortable.take_dirty() {
            log::debug!("colortable changed, repainting all layers");
            self.mark_all_pixels_dirty();
            true
        } else {
            false
        }
    }

    pub fn colortable(&self) -> &Colortable {
        &self.colortable
    }

    pub fn colortable_mut(&mut self) -> &mut Colortable {
        &mut self.colortable
    }

    pub fn palette_usage(&self) -> &PaletteUsage {
        &self.usage
    }

    /// The shared priority buffer; sprite code reads this to arbitrate
    /// against the codes layers stamped.
    pub fn priority_buffer(&self) -> &Bitmap<u8> {
        &self.priority
    }

    pub fn clear_priority(&mut self) {
        self.priority.fill(0);
    }
}
