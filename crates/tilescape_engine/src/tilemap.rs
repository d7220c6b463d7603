//! The tilemap object: one scrolling layer, its dirty-tracked tile cache,
//! its rendered pixmap, and the compositing path onto a destination
//! bitmap.

use anyhow::{bail, Result};

use crate::bitmap::{Bitmap, Pixel, Rect};
use crate::blit::{copy_span_masked, expand_row, fill_span_masked};
use crate::cache::{CacheEntry, TileCache};
use crate::mapper::CoordMapper;
use crate::mask::{MaskLayer, TileClass, TileMaskWriter};
use crate::palette::{Colortable, PaletteUsage};
use crate::system::ScreenConfig;
use crate::tile::{
    Orientation, TileFlip, TileInfo, TileMaskData, TileSize, TileSource, TilemapKind,
};

/// Sentinel scroll value: a row/column strip with this value is not drawn
/// at all. Useful for split-screen effects that black out bands.
pub const LINE_DISABLED: i32 = i32::MIN;

/// Upper bound on tiles per layer; creation fails beyond this.
const MAX_TILES: u32 = 1 << 20;

/// Which half of a `Split` tilemap a draw call composites.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum SplitPass {
    #[default]
    Front,
    Back,
}

/// Parameters of one compositing pass.
#[derive(Copy, Clone, Debug, Default)]
pub struct DrawOp {
    /// Only tiles whose cached priority equals this participate.
    pub tile_priority: u8,
    /// Stamped into the shared priority buffer on every written pixel,
    /// last-writer-wins.
    pub priority_code: u8,
    /// Which mask of a `Split` tilemap to draw through.
    pub pass: SplitPass,
    /// Force the opaque fast path regardless of the tilemap kind.
    pub ignore_transparency: bool,
}

impl DrawOp {
    /// Pass matching `tile_priority`, stamping the same value as its code.
    pub fn priority(tile_priority: u8) -> DrawOp {
        DrawOp {
            tile_priority,
            priority_code: tile_priority,
            ..DrawOp::default()
        }
    }
}

/// One scrolling tile layer. Created through
/// [`crate::system::TilemapSystem::create`]; per-frame mutation happens on
/// this type, the update/render/draw pipeline on the system.
pub struct Tilemap<P: Pixel> {
    source: Box<dyn TileSource>,
    kind: TilemapKind,
    tile: TileSize,

    num_logical_cols: u32,
    num_logical_rows: u32,
    num_cached_cols: u32,
    num_cached_rows: u32,
    cached_width: i32,
    cached_height: i32,
    screen_width: i32,
    screen_height: i32,

    mapper: CoordMapper,
    cache: TileCache,
    fg_mask: MaskLayer,
    bg_mask: Option<MaskLayer>,
    pixmap: Bitmap<P>,

    screen_orientation: Orientation,
    orientation: Orientation,
    attributes: TileFlip,

    enable: bool,
    transparent_pen: u8,
    transparent_color: u16,
    transmask: [u32; 4],

    scroll_rows: usize,
    scroll_cols: usize,
    rowscroll: Vec<i32>,
    colscroll: Vec<i32>,
    dx: i32,
    dx_flipped: i32,
    dy: i32,
    dy_flipped: i32,
    scrollx_delta: i32,
    scrolly_delta: i32,

    clip: Rect,
    user_clip: Option<Rect>,
}

impl<P: Pixel> Tilemap<P> {
    pub(crate) fn new(
        source: Box<dyn TileSource>,
        kind: TilemapKind,
        tile: TileSize,
        num_cols: u32,
        num_rows: u32,
        screen: &ScreenConfig,
    ) -> Result<Tilemap<P>> {
        if num_cols == 0 || num_rows == 0 {
            bail!("tilemap grid must be at least 1x1 ({num_cols}x{num_rows} requested)");
        }
        let Some(num_tiles) = num_cols.checked_mul(num_rows).filter(|&n| n <= MAX_TILES) else {
            bail!("tilemap grid {num_cols}x{num_rows} exceeds {MAX_TILES} tiles");
        };

        let orientation = screen.orientation;
        let (num_cached_cols, num_cached_rows) = if orientation.contains(Orientation::SWAP_XY) {
            (num_rows, num_cols)
        } else {
            (num_cols, num_rows)
        };
        let t = tile.pixels();
        let cached_width = num_cached_cols as usize * t;
        let cached_height = num_cached_rows as usize * t;

        let mapper = CoordMapper::build(
            source.as_ref(),
            num_cols,
            num_rows,
            num_cached_cols,
            num_cached_rows,
            orientation,
        );

        let mut tilemap = Tilemap {
            source,
            kind,
            tile,
            num_logical_cols: num_cols,
            num_logical_rows: num_rows,
            num_cached_cols,
            num_cached_rows,
            cached_width: cached_width as i32,
            cached_height: cached_height as i32,
            screen_width: screen.width as i32,
            screen_height: screen.height as i32,
            mapper,
            cache: TileCache::new(num_tiles as usize),
            fg_mask: MaskLayer::new(num_cached_cols as usize, num_cached_rows as usize, t),
            bg_mask: (kind == TilemapKind::Split)
                .then(|| MaskLayer::new(num_cached_cols as usize, num_cached_rows as usize, t)),
            pixmap: Bitmap::new(cached_width, cached_height),
            screen_orientation: orientation,
            orientation,
            attributes: TileFlip::empty(),
            enable: true,
            transparent_pen: 0,
            transparent_color: 0,
            transmask: [0; 4],
            scroll_rows: 1,
            scroll_cols: 1,
            rowscroll: vec![0],
            colscroll: vec![0],
            dx: 0,
            dx_flipped: 0,
            dy: 0,
            dy_flipped: 0,
            scrollx_delta: 0,
            scrolly_delta: 0,
            clip: Rect::new(0, 0, screen.width as i32, screen.height as i32),
            user_clip: None,
        };
        tilemap.set_clip(Some(screen.visible_area));
        Ok(tilemap)
    }

    #[inline]
    pub fn kind(&self) -> TilemapKind {
        self.kind
    }

    #[inline]
    pub fn tile_size(&self) -> TileSize {
        self.tile
    }

    /// Layer width in cached pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.cached_width as u32
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.cached_height as u32
    }

    #[inline]
    pub fn num_cols(&self) -> u32 {
        self.num_logical_cols
    }

    #[inline]
    pub fn num_rows(&self) -> u32 {
        self.num_logical_rows
    }

    /// The layer's rendered image, in cached space.
    pub fn pixmap(&self) -> &Bitmap<P> {
        &self.pixmap
    }

    /// Opacity class of the tile at a driver memory offset, for one draw
    /// pass. `None` for unmapped offsets.
    pub fn tile_class(&self, memory_offset: u32, pass: SplitPass) -> Option<TileClass> {
        let index = self.mapper.cached_index(memory_offset)? as usize;
        Some(self.mask_layer(pass).class(index))
    }

    pub(crate) fn mask_layer(&self, pass: SplitPass) -> &MaskLayer {
        match pass {
            SplitPass::Back => self.bg_mask.as_ref().unwrap_or(&self.fg_mask),
            SplitPass::Front => &self.fg_mask,
        }
    }

    // ---- dirty tracking -------------------------------------------------

    /// Flag the tile at a driver memory offset for re-decoding. Offsets
    /// past the mapped range or in holes of a sparse offset space are
    /// ignored; drivers routinely probe addresses beyond real VRAM.
    pub fn mark_tile_dirty(&mut self, memory_offset: u32) {
        if let Some(index) = self.mapper.cached_index(memory_offset) {
            self.cache.set_dirty_vram(index as usize);
        }
    }

    /// Flag every tile for re-decoding (bank switches, wholesale VRAM
    /// reinterpretation).
    pub fn mark_all_tiles_dirty(&mut self) {
        self.cache.mark_all_vram_dirty();
    }

    /// Flag every tile for re-rendering without re-decoding (palette
    /// changes).
    pub fn mark_all_pixels_dirty(&mut self) {
        self.cache.mark_all_pixels_dirty();
    }

    // ---- configuration --------------------------------------------------

    pub fn set_enable(&mut self, enable: bool) {
        self.enable = enable;
    }

    pub fn set_transparent_pen(&mut self, pen: u8) {
        if self.transparent_pen != pen {
            self.transparent_pen = pen;
            self.cache.mark_all_vram_dirty();
        }
    }

    pub fn set_transparent_color(&mut self, color: u16) {
        if self.transparent_color != color {
            self.transparent_color = color;
            self.cache.mark_all_vram_dirty();
        }
    }

    /// Set one of the four pen-class masks of a `Split` tilemap: bits name
    /// the pens transparent in the front pass (and opaque in the back).
    pub fn set_transmask(&mut self, which: usize, front_transparent_pens: u32) {
        if let Some(slot) = self.transmask.get_mut(which) {
            if *slot != front_transparent_pens {
                *slot = front_transparent_pens;
                self.cache.mark_all_vram_dirty();
            }
        }
    }

    /// Runtime flip of the whole layer, combined with the fixed screen
    /// orientation. Rebuilds the address maps and invalidates every tile.
    pub fn set_flip(&mut self, attributes: TileFlip) {
        if self.attributes == attributes {
            return;
        }
        self.attributes = attributes;
        let mut orientation = self.screen_orientation;
        if attributes.contains(TileFlip::X) {
            orientation ^= Orientation::FLIP_X;
        }
        if attributes.contains(TileFlip::Y) {
            orientation ^= Orientation::FLIP_Y;
        }
        self.orientation = orientation;
        self.scrollx_delta = if attributes.contains(TileFlip::X) {
            self.dx_flipped
        } else {
            self.dx
        };
        self.scrolly_delta = if attributes.contains(TileFlip::Y) {
            self.dy_flipped
        } else {
            self.dy
        };
        self.mapper = CoordMapper::build(
            self.source.as_ref(),
            self.num_logical_cols,
            self.num_logical_rows,
            self.num_cached_cols,
            self.num_cached_rows,
            orientation,
        );
        self.set_clip(self.user_clip);
        self.cache.mark_all_vram_dirty();
        log::debug!("tilemap flip set to {attributes:?}");
    }

    /// Clip rectangle in logical screen coordinates; `None` restores the
    /// whole screen. Stored post-transform, in cached space.
    pub fn set_clip(&mut self, clip: Option<Rect>) {
        self.user_clip = clip;
        let (sw, sh) = (self.screen_width, self.screen_height);
        let cached = match clip {
            None => Rect::new(0, 0, sw, sh),
            Some(r) => {
                let (mut left, mut top, mut right, mut bottom) = (r.left, r.top, r.right, r.bottom);
                if self.orientation.contains(Orientation::SWAP_XY) {
                    std::mem::swap(&mut left, &mut top);
                    std::mem::swap(&mut right, &mut bottom);
                }
                if self.orientation.contains(Orientation::FLIP_X) {
                    let (l, r) = (sw - right, sw - left);
                    left = l;
                    right = r;
                }
                if self.orientation.contains(Orientation::FLIP_Y) {
                    let (t, b) = (sh - bottom, sh - top);
                    top = t;
                    bottom = b;
                }
                Rect::new(left, top, right, bottom)
            }
        };
        self.clip = cached.intersect(&Rect::new(0, 0, sw, sh));
    }

    // ---- scroll ---------------------------------------------------------

    /// Number of independently scrolling horizontal strips (1 = whole
    /// layer). Resets the strip offsets to zero.
    pub fn set_scroll_rows(&mut self, n: usize) {
        let n = n.max(1);
        if self.orientation.contains(Orientation::SWAP_XY) {
            self.scroll_cols = n;
            self.colscroll = vec![0; n];
        } else {
            self.scroll_rows = n;
            self.rowscroll = vec![0; n];
        }
    }

    /// Number of independently scrolling vertical strips.
    pub fn set_scroll_cols(&mut self, n: usize) {
        let n = n.max(1);
        if self.orientation.contains(Orientation::SWAP_XY) {
            self.scroll_rows = n;
            self.rowscroll = vec![0; n];
        } else {
            self.scroll_cols = n;
            self.colscroll = vec![0; n];
        }
    }

    /// Horizontal scroll of strip `which`. Positive values move the layer
    /// content rightwards; scroll wraps modulo the layer width. Indices
    /// past the configured granularity are ignored.
    pub fn set_scrollx(&mut self, which: usize, value: i32) {
        let base = if value == LINE_DISABLED {
            LINE_DISABLED
        } else {
            self.scrollx_delta + value
        };
        if self.orientation.contains(Orientation::SWAP_XY) {
            let which = if self.orientation.contains(Orientation::FLIP_X) {
                self.scroll_cols.wrapping_sub(1).wrapping_sub(which)
            } else {
                which
            };
            let value = if base != LINE_DISABLED && self.orientation.contains(Orientation::FLIP_Y) {
                self.screen_height - self.cached_height - base
            } else {
                base
            };
            if let Some(slot) = self.colscroll.get_mut(which) {
                *slot = value;
            }
        } else {
            let which = if self.orientation.contains(Orientation::FLIP_Y) {
                self.scroll_rows.wrapping_sub(1).wrapping_sub(which)
            } else {
                which
            };
            let value = if base != LINE_DISABLED && self.orientation.contains(Orientation::FLIP_X) {
                self.screen_width - self.cached_width - base
            } else {
                base
            };
            if let Some(slot) = self.rowscroll.get_mut(which) {
                *slot = value;
            }
        }
    }

    /// Vertical scroll of strip `which`; positive moves content down.
    pub fn set_scrolly(&mut self, which: usize, value: i32) {
        let base = if value == LINE_DISABLED {
            LINE_DISABLED
        } else {
            self.scrolly_delta + value
        };
        if self.orientation.contains(Orientation::SWAP_XY) {
            let which = if self.orientation.contains(Orientation::FLIP_Y) {
                self.scroll_rows.wrapping_sub(1).wrapping_sub(which)
            } else {
                which
            };
            let value = if base != LINE_DISABLED && self.orientation.contains(Orientation::FLIP_X) {
                self.screen_width - self.cached_width - base
            } else {
                base
            };
            if let Some(slot) = self.rowscroll.get_mut(which) {
                *slot = value;
            }
        } else {
            let which = if self.orientation.contains(Orientation::FLIP_X) {
                self.scroll_cols.wrapping_sub(1).wrapping_sub(which)
            } else {
                which
            };
            let value = if base != LINE_DISABLED && self.orientation.contains(Orientation::FLIP_Y) {
                self.screen_height - self.cached_height - base
            } else {
                base
            };
            if let Some(slot) = self.colscroll.get_mut(which) {
                *slot = value;
            }
        }
    }

    /// Fixed display offsets added to every scroll value, with separate
    /// values for the flipped-screen case.
    pub fn set_scrolldx(&mut self, dx: i32, dx_flipped: i32) {
        self.dx = dx;
        self.dx_flipped = dx_flipped;
        self.scrollx_delta = if self.attributes.contains(TileFlip::X) {
            dx_flipped
        } else {
            dx
        };
    }

    pub fn set_scrolldy(&mut self, dy: i32, dy_flipped: i32) {
        self.dy = dy;
        self.dy_flipped = dy_flipped;
        self.scrolly_delta = if self.attributes.contains(TileFlip::Y) {
            dy_flipped
        } else {
            dy
        };
    }

    // ---- per-frame pipeline ---------------------------------------------

    /// Re-decode every dirty visible tile through the driver callback and
    /// refresh its opacity mask(s).
    pub(crate) fn update(
        &mut self,
        scratch: &mut TileInfo,
        usage: &mut PaletteUsage,
        table: &Colortable,
    ) {
        if !self.enable {
            return;
        }
        let tile = self.tile.pixels();
        let cols = self.num_cached_cols as usize;
        let Tilemap {
            source,
            cache,
            mapper,
            fg_mask,
            bg_mask,
            kind,
            transparent_pen,
            transparent_color,
            transmask,
            ..
        } = self;
        let mut fg_writer = TileMaskWriter::new(tile);
        let mut bg_writer = TileMaskWriter::new(tile);

        for index in 0..cache.len() {
            if !cache.dirty_vram(index) || !cache.visible(index) {
                continue;
            }
            let offset = mapper.memory_offset(index as u32);

            {
                let old = cache.entry(index);
                if old.pixels.is_some() || old.pen_usage != 0 {
                    usage.unregister(old.palette_base, old.pen_usage);
                }
            }

            scratch.reset();
            source.tile_info(offset, scratch);
            let flip = mapper.remap_flip(scratch.flip);
            {
                let entry = cache.entry_mut(index);
                entry.pixels = scratch.pixels.take();
                entry.palette_base = scratch.palette_base;
                entry.pen_usage = scratch.pen_usage;
                entry.flip = flip;
                entry.split_class = scratch.split_class;
            }
            cache.set_priority(index, scratch.priority);
            usage.register(scratch.palette_base, scratch.pen_usage);
            cache.set_dirty_pixels(index);
            cache.clear_dirty_vram(index);

            render_mask(
                *kind,
                *transparent_pen,
                *transparent_color,
                transmask,
                table,
                cache.entry(index),
                scratch.mask.as_ref(),
                index,
                tile,
                cols,
                fg_mask,
                bg_mask.as_mut(),
                &mut fg_writer,
                &mut bg_writer,
            );
        }
    }

    /// Repaint every pixel-dirty visible tile into the layer pixmap.
    pub(crate) fn render(&mut self, table: &Colortable) {
        if !self.enable {
            return;
        }
        let tile = self.tile.pixels();
        let cols = self.num_cached_cols as usize;
        let Tilemap { cache, pixmap, .. } = self;

        for index in 0..cache.len() {
            if !cache.dirty_pixels(index) || !cache.visible(index) {
                continue;
            }
            let (tcol, trow) = (index % cols, index / cols);
            {
                let entry = cache.entry(index);
                let flip_x = entry.flip.contains(TileFlip::X);
                let flip_y = entry.flip.contains(TileFlip::Y);
                for ty in 0..tile {
                    let sy = if flip_y { tile - 1 - ty } else { ty };
                    let dest =
                        &mut pixmap.row_mut(trow * tile + ty)[tcol * tile..(tcol + 1) * tile];
                    match entry.pixels.as_ref().and_then(|p| p.row(tile, sy)) {
                        Some(pens) => expand_row(dest, pens, table, entry.palette_base, flip_x),
                        None => dest.fill(P::from_entry(table.entry(entry.palette_base))),
                    }
                }
            }
            cache.clear_dirty_pixels(index);
        }
    }

    /// Give back every pen this layer's cache has registered; used when
    /// the layer is disposed.
    pub(crate) fn unregister_all(&self, usage: &mut PaletteUsage) {
        for index in 0..self.cache.len() {
            let entry = self.cache.entry(index);
            if entry.pixels.is_some() || entry.pen_usage != 0 {
                usage.unregister(entry.palette_base, entry.pen_usage);
            }
        }
    }

    /// Composite this layer onto `dest`, stamping `priority_buf`.
    pub(crate) fn draw_into(&self, dest: &mut Bitmap<P>, priority_buf: &mut Bitmap<u8>, op: DrawOp) {
        if !self.enable {
            return;
        }
        let clip = self
            .clip
            .intersect(&dest.bounds())
            .intersect(&priority_buf.bounds());
        if clip.is_empty() {
            return;
        }

        let ctx = BlitCtx {
            pixmap: &self.pixmap,
            mask: self.mask_layer(op.pass),
            priorities: self.cache.priorities(),
            cols: self.num_cached_cols as usize,
            tile: self.tile,
            tile_priority: op.tile_priority,
            priority_code: op.priority_code,
            force_opaque: op.ignore_transparency,
        };
        let (w, h) = (self.cached_width, self.cached_height);

        if self.scroll_rows == 1 && self.scroll_cols == 1 {
            // Whole-layer XY scroll: tile the layer image across the clip
            // rectangle so scroll wraps at the layer edges.
            let scrollx = self.rowscroll[0].rem_euclid(w);
            let scrolly = self.colscroll[0].rem_euclid(h);
            let mut ypos = scrolly - h;
            while ypos < clip.bottom {
                let mut xpos = scrollx - w;
                while xpos < clip.right {
                    ctx.draw(dest, priority_buf, clip, xpos, ypos);
                    xpos += w;
                }
                ypos += h;
            }
        } else if self.scroll_rows == 1 {
            // Per-column vertical scroll with one shared horizontal
            // scroll. Adjacent columns with equal offsets coalesce into
            // one clipped strip.
            let scrollx = self.rowscroll[0].rem_euclid(w);
            let colwidth = w / self.scroll_cols as i32;
            let mut col = 0;
            while col < self.scroll_cols {
                let value = self.colscroll[col];
                let mut cons = 1;
                while col + cons < self.scroll_cols && self.colscroll[col + cons] == value {
                    cons += 1;
                }
                if value != LINE_DISABLED {
                    let scrolly = value.rem_euclid(h);
                    for xpos in [scrollx, scrollx - w] {
                        let strip = Rect::new(
                            col as i32 * colwidth + xpos,
                            clip.top,
                            (col + cons) as i32 * colwidth + xpos,
                            clip.bottom,
                        )
                        .intersect(&clip);
                        if !strip.is_empty() {
                            let mut ypos = scrolly - h;
                            while ypos < strip.bottom {
                                ctx.draw(dest, priority_buf, strip, xpos, ypos);
                                ypos += h;
                            }
                        }
                    }
                }
                col += cons;
            }
        } else if self.scroll_cols == 1 {
            // Per-row horizontal scroll (line scroll) with one shared
            // vertical scroll.
            let scrolly = self.colscroll[0].rem_euclid(h);
            let rowheight = h / self.scroll_rows as i32;
            let mut row = 0;
            while row < self.scroll_rows {
                let value = self.rowscroll[row];
                let mut cons = 1;
                while row + cons < self.scroll_rows && self.rowscroll[row + cons] == value {
                    cons += 1;
                }
                if value != LINE_DISABLED {
                    let scrollx = value.rem_euclid(w);
                    for ypos in [scrolly, scrolly - h] {
                        let strip = Rect::new(
                            clip.left,
                            row as i32 * rowheight + ypos,
                            clip.right,
                            (row + cons) as i32 * rowheight + ypos,
                        )
                        .intersect(&clip);
                        if !strip.is_empty() {
                            let mut xpos = scrollx - w;
                            while xpos < strip.right {
                                ctx.draw(dest, priority_buf, strip, xpos, ypos);
                                xpos += w;
                            }
                        }
                    }
                }
                row += cons;
            }
        }
        // Fine-grained scroll on both axes at once is not supported.
    }
}

// ---- opacity classification ---------------------------------------------

#[allow(clippy::too_many_arguments)]
fn render_mask(
    kind: TilemapKind,
    transparent_pen: u8,
    transparent_color: u16,
    transmask: &[u32; 4],
    table: &Colortable,
    entry: &CacheEntry,
    mask_data: Option<&TileMaskData>,
    index: usize,
    tile: usize,
    cols: usize,
    fg: &mut MaskLayer,
    bg: Option<&mut MaskLayer>,
    fg_writer: &mut TileMaskWriter,
    bg_writer: &mut TileMaskWriter,
) {
    let (tcol, trow) = (index % cols, index / cols);
    match kind {
        TilemapKind::Opaque => fg.set_class(index, TileClass::Opaque),
        TilemapKind::Transparent => {
            // A zero pen-usage bitmap means the driver did not provide
            // one; fall through to the pixel scan in that case.
            let bit = 1u32 << transparent_pen.min(31);
            let usage = entry.pen_usage;
            if usage != 0 && usage & bit == 0 {
                fg.set_class(index, TileClass::Opaque);
            } else if usage == bit {
                fg.set_class(index, TileClass::Transparent);
            } else {
                let class = scan_pens(entry, tile, tcol, trow, fg, fg_writer, |pen| {
                    pen != transparent_pen
                });
                fg.set_class(index, class);
            }
        }
        TilemapKind::TransparentColor => {
            let base = entry.palette_base;
            let class = scan_pens(entry, tile, tcol, trow, fg, fg_writer, |pen| {
                table.entry(base + pen as u32) != transparent_color
            });
            fg.set_class(index, class);
        }
        TilemapKind::Split => {
            let bg = bg.expect("split tilemap always carries a back mask");
            let fg_trans = transmask[(entry.split_class & 3) as usize];
            let usage = entry.pen_usage;
            if usage != 0 && usage & fg_trans == 0 {
                fg.set_class(index, TileClass::Opaque);
                bg.set_class(index, TileClass::Transparent);
            } else if usage != 0 && usage & !fg_trans == 0 {
                fg.set_class(index, TileClass::Transparent);
                bg.set_class(index, TileClass::Opaque);
            } else {
                let (front, back) = scan_pens_split(
                    entry, tile, tcol, trow, fg, bg, fg_writer, bg_writer, fg_trans,
                );
                fg.set_class(index, front);
                bg.set_class(index, back);
            }
        }
        TilemapKind::Bitmask => {
            let class = scan_bitmask(entry, mask_data, tile, tcol, trow, fg, fg_writer);
            fg.set_class(index, class);
        }
    }
}

fn scan_pens(
    entry: &CacheEntry,
    tile: usize,
    tcol: usize,
    trow: usize,
    layer: &mut MaskLayer,
    writer: &mut TileMaskWriter,
    opaque: impl Fn(u8) -> bool,
) -> TileClass {
    let flip_x = entry.flip.contains(TileFlip::X);
    let flip_y = entry.flip.contains(TileFlip::Y);
    for ty in 0..tile {
        let sy = if flip_y { tile - 1 - ty } else { ty };
        let pens = entry.pixels.as_ref().and_then(|p| p.row(tile, sy));
        writer.begin_row();
        for tx in 0..tile {
            let sx = if flip_x { tile - 1 - tx } else { tx };
            let pen = pens.map_or(0, |row| row[sx]);
            if opaque(pen) {
                writer.set(tx);
            }
        }
        writer.commit_row(layer.tile_row_mut(tcol, trow * tile + ty));
    }
    writer.finish()
}

/// One scan of the source pixels feeds both halves of a split tile:
/// every pen is opaque in exactly one of the two passes.
#[allow(clippy::too_many_arguments)]
fn scan_pens_split(
    entry: &CacheEntry,
    tile: usize,
    tcol: usize,
    trow: usize,
    fg: &mut MaskLayer,
    bg: &mut MaskLayer,
    fg_writer: &mut TileMaskWriter,
    bg_writer: &mut TileMaskWriter,
    fg_trans: u32,
) -> (TileClass, TileClass) {
    let flip_x = entry.flip.contains(TileFlip::X);
    let flip_y = entry.flip.contains(TileFlip::Y);
    for ty in 0..tile {
        let sy = if flip_y { tile - 1 - ty } else { ty };
        let pens = entry.pixels.as_ref().and_then(|p| p.row(tile, sy));
        fg_writer.begin_row();
        bg_writer.begin_row();
        for tx in 0..tile {
            let sx = if flip_x { tile - 1 - tx } else { tx };
            let pen = pens.map_or(0, |row| row[sx]);
            if fg_trans >> pen.min(31) & 1 == 0 {
                fg_writer.set(tx);
            } else {
                bg_writer.set(tx);
            }
        }
        fg_writer.commit_row(fg.tile_row_mut(tcol, trow * tile + ty));
        bg_writer.commit_row(bg.tile_row_mut(tcol, trow * tile + ty));
    }
    (fg_writer.finish(), bg_writer.finish())
}

fn scan_bitmask(
    entry: &CacheEntry,
    mask_data: Option<&TileMaskData>,
    tile: usize,
    tcol: usize,
    trow: usize,
    layer: &mut MaskLayer,
    writer: &mut TileMaskWriter,
) -> TileClass {
    let flip_x = entry.flip.contains(TileFlip::X);
    let flip_y = entry.flip.contains(TileFlip::Y);
    for ty in 0..tile {
        let sy = if flip_y { tile - 1 - ty } else { ty };
        let bytes = mask_data.and_then(|m| m.row(tile, sy));
        writer.begin_row();
        if let Some(bytes) = bytes {
            for tx in 0..tile {
                let sx = if flip_x { tile - 1 - tx } else { tx };
                if bytes[sx / 8] & (0x80 >> (sx % 8)) != 0 {
                    writer.set(tx);
                }
            }
        }
        writer.commit_row(layer.tile_row_mut(tcol, trow * tile + ty));
    }
    writer.finish()
}

// ---- the band/run compositor --------------------------------------------

/// Read-only state of one compositing pass; the destination and priority
/// surfaces travel separately so the borrow of the layer stays shared.
struct BlitCtx<'a, P: Pixel> {
    pixmap: &'a Bitmap<P>,
    mask: &'a MaskLayer,
    priorities: &'a [u8],
    cols: usize,
    tile: TileSize,
    tile_priority: u8,
    priority_code: u8,
    force_opaque: bool,
}

impl<P: Pixel> BlitCtx<'_, P> {
    /// Blit the whole layer image positioned at (`xpos`, `ypos`),
    /// clipped. The generic body below is instantiated once per tile
    /// size; combined with the two pixel types that gives the six
    /// specialized blitters.
    fn draw(
        &self,
        dest: &mut Bitmap<P>,
        priority_buf: &mut Bitmap<u8>,
        clip: Rect,
        xpos: i32,
        ypos: i32,
    ) {
        match self.tile {
            TileSize::S8 => self.draw_sized::<8>(dest, priority_buf, clip, xpos, ypos),
            TileSize::S16 => self.draw_sized::<16>(dest, priority_buf, clip, xpos, ypos),
            TileSize::S32 => self.draw_sized::<32>(dest, priority_buf, clip, xpos, ypos),
        }
    }

    fn draw_sized<const T: usize>(
        &self,
        dest: &mut Bitmap<P>,
        priority_buf: &mut Bitmap<u8>,
        clip: Rect,
        xpos: i32,
        ypos: i32,
    ) {
        let x1 = xpos.max(clip.left);
        let y1 = ypos.max(clip.top);
        let x2 = (xpos + self.pixmap.width() as i32).min(clip.right);
        let y2 = (ypos + self.pixmap.height() as i32).min(clip.bottom);
        if x1 >= x2 || y1 >= y2 {
            return;
        }

        // Walk destination rows in bands aligned to tile-row boundaries,
        // then coalesce maximal runs of columns sharing one effective
        // class so each run becomes a single wide blit.
        let mut y = y1;
        while y < y2 {
            let trow = ((y - ypos) as usize) / T;
            let band_end = (ypos + ((trow + 1) * T) as i32).min(y2);
            let classes = self.mask.classes_row(trow);
            let priorities = &self.priorities[trow * self.cols..(trow + 1) * self.cols];

            let first_col = ((x1 - xpos) as usize) / T;
            let last_col = ((x2 - 1 - xpos) as usize) / T;
            let mut col = first_col;
            while col <= last_col {
                let class = self.column_class(classes, priorities, col);
                let mut end = col + 1;
                while end <= last_col && self.column_class(classes, priorities, end) == class {
                    end += 1;
                }
                if class != TileClass::Transparent {
                    let rx1 = x1.max(xpos + (col * T) as i32);
                    let rx2 = x2.min(xpos + (end * T) as i32);
                    if class == TileClass::Opaque {
                        self.blit_opaque(dest, priority_buf, xpos, ypos, rx1, rx2, y, band_end);
                    } else {
                        self.blit_masked(dest, priority_buf, xpos, ypos, rx1, rx2, y, band_end);
                    }
                }
                col = end;
            }
            y = band_end;
        }
    }

    /// Effective class of one tile column: tiles failing the priority
    /// filter are forced transparent, the opaque override wins otherwise.
    #[inline]
    fn column_class(&self, classes: &[TileClass], priorities: &[u8], col: usize) -> TileClass {
        if priorities[col] != self.tile_priority {
            TileClass::Transparent
        } else if self.force_opaque {
            TileClass::Opaque
        } else {
            classes[col]
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn blit_opaque(
        &self,
        dest: &mut Bitmap<P>,
        priority_buf: &mut Bitmap<u8>,
        xpos: i32,
        ypos: i32,
        x1: i32,
        x2: i32,
        y1: i32,
        y2: i32,
    ) {
        let (sx1, sx2) = ((x1 - xpos) as usize, (x2 - xpos) as usize);
        for y in y1..y2 {
            let sy = (y - ypos) as usize;
            dest.row_mut(y as usize)[x1 as usize..x2 as usize]
                .copy_from_slice(&self.pixmap.row(sy)[sx1..sx2]);
            priority_buf.row_mut(y as usize)[x1 as usize..x2 as usize].fill(self.priority_code);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn blit_masked(
        &self,
        dest: &mut Bitmap<P>,
        priority_buf: &mut Bitmap<u8>,
        xpos: i32,
        ypos: i32,
        x1: i32,
        x2: i32,
        y1: i32,
        y2: i32,
    ) {
        let (sx1, sx2) = ((x1 - xpos) as usize, (x2 - xpos) as usize);
        for y in y1..y2 {
            let sy = (y - ypos) as usize;
            let mask = &self.mask.bitmap_row(sy)[sx1 / 8..];
            let bit_offset = sx1 % 8;
            copy_span_masked(
                &mut dest.row_mut(y as usize)[x1 as usize..x2 as usize],
                &self.pixmap.row(sy)[sx1..sx2],
                mask,
                bit_offset,
            );
            fill_span_masked(
                &mut priority_buf.row_mut(y as usize)[x1 as usize..x2 as usize],
                self.priority_code,
                mask,
                bit_offset,
            );
        }
    }
}
