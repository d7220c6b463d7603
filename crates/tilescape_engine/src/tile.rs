//! The driver-facing tile boundary: flags, sizes, pixel sources, and the
//! `TileSource` callback trait.

use std::sync::Arc;

use bitflags::bitflags;

bitflags! {
    /// Tile flip bits, both as reported by a driver and after remapping
    /// into cache space.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct TileFlip: u8 {
        const X = 0x01;
        const Y = 0x02;
    }
}

bitflags! {
    /// Global screen orientation. `SWAP_XY` exchanges the axes before the
    /// mirror bits apply, which is how 90-degree rotations are expressed.
    #[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
    pub struct Orientation: u8 {
        const FLIP_X = 0x01;
        const FLIP_Y = 0x02;
        const SWAP_XY = 0x04;
    }
}

/// Square tile edge length. Each size has its own specialized blit loop.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TileSize {
    S8,
    S16,
    S32,
}

impl TileSize {
    #[inline]
    pub fn pixels(self) -> usize {
        match self {
            TileSize::S8 => 8,
            TileSize::S16 => 16,
            TileSize::S32 => 32,
        }
    }
}

/// Transparency semantics of a tilemap.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TilemapKind {
    /// Every tile is fully opaque.
    Opaque,
    /// Pixels whose pen equals the tilemap's transparent pen are skipped.
    Transparent,
    /// Like `Transparent`, but the test is on the resolved colortable
    /// value, so two pens aliasing to the same color are both transparent.
    TransparentColor,
    /// Tiles contribute to two passes at once: the `transmask` entry
    /// selected by the tile's split class names the pens transparent in
    /// the front pass; the back pass uses the complement.
    Split,
    /// The driver supplies a ready-made 1bpp mask per tile.
    Bitmask,
}

/// Shared reference to one tile's decoded 8-bit pen data.
///
/// `bank` typically holds a whole graphics set; `offset` is the byte
/// position of this tile's first row. Rows are `size` bytes apart, one pen
/// per byte.
#[derive(Clone)]
pub struct TilePixels {
    bank: Arc<[u8]>,
    offset: usize,
}

impl TilePixels {
    pub fn new(bank: Arc<[u8]>, offset: usize) -> TilePixels {
        TilePixels { bank, offset }
    }

    /// One row of pens, or `None` if the driver handed out an offset past
    /// the end of the bank (tolerated; callers substitute pen 0).
    #[inline]
    pub(crate) fn row(&self, size: usize, row: usize) -> Option<&[u8]> {
        let start = self.offset + row * size;
        self.bank.get(start..start + size)
    }
}

/// Shared reference to a driver-supplied packed 1bpp tile mask.
///
/// Rows are `size / 8` bytes apart; bits are MSB-first, so bit 7 of the
/// first byte is the leftmost pixel.
#[derive(Clone)]
pub struct TileMaskData {
    bank: Arc<[u8]>,
    offset: usize,
}

impl TileMaskData {
    pub fn new(bank: Arc<[u8]>, offset: usize) -> TileMaskData {
        TileMaskData { bank, offset }
    }

    #[inline]
    pub(crate) fn row(&self, size: usize, row: usize) -> Option<&[u8]> {
        let bytes = size / 8;
        let start = self.offset + row * bytes;
        self.bank.get(start..start + bytes)
    }
}

/// Scratch record a [`TileSource`] fills for one tile.
///
/// The same record is reused for every callback invocation within an
/// update pass; `tile_info` implementations should treat it as
/// write-only.
#[derive(Clone, Default)]
pub struct TileInfo {
    /// Decoded pen data. Leaving this `None` makes the tile all pen 0.
    pub pixels: Option<TilePixels>,
    /// Base index into the system colortable; pen `n` resolves through
    /// entry `palette_base + n`.
    pub palette_base: u32,
    /// Bitmap of pens present in the tile, bit `n` for pen `n`. Pens 32
    /// and up collapse onto bit 31.
    pub pen_usage: u32,
    /// Raw flip bits in the driver's own frame of reference.
    pub flip: TileFlip,
    /// Priority tag matched against `DrawOp::tile_priority`.
    pub priority: u8,
    /// Which `transmask` entry applies to a `Split` tilemap tile.
    pub split_class: u8,
    /// Explicit mask for `Bitmask` tilemaps; ignored by the other kinds.
    pub mask: Option<TileMaskData>,
}

impl TileInfo {
    pub(crate) fn reset(&mut self) {
        *self = TileInfo::default();
    }
}

/// Driver callbacks a tilemap pulls its content from.
///
/// `memory_offset` must be pure: the engine calls it for the whole
/// logical grid while building its address maps and assumes the answers
/// never change. It may be non-injective and its range may have holes.
pub trait TileSource {
    fn memory_offset(&self, col: u32, row: u32, num_cols: u32, num_rows: u32) -> u32;

    /// Describe the tile at `memory_offset`. Called only for tiles that
    /// are dirty and visible.
    fn tile_info(&mut self, memory_offset: u32, info: &mut TileInfo);
}

/// Row-major addressing: `offset = row * num_cols + col`.
#[inline]
pub fn scan_rows(col: u32, row: u32, num_cols: u32, _num_rows: u32) -> u32 {
    row * num_cols + col
}

/// Column-major addressing: `offset = col * num_rows + row`.
#[inline]
pub fn scan_cols(col: u32, row: u32, _num_cols: u32, num_rows: u32) -> u32 {
    col * num_rows + row
}

/// Derive the pen-usage bitmap of a `size`-pixel square tile.
///
/// Drivers whose graphics decoder does not precompute usage tables can
/// call this when filling [`TileInfo::pen_usage`].
pub fn compute_pen_usage(pixels: &TilePixels, size: usize) -> u32 {
    let mut usage = 0u32;
    for row in 0..size {
        if let Some(pens) = pixels.row(size, row) {
            for &pen in pens {
                usage |= 1 << (pen.min(31));
            }
        } else {
            usage |= 1; // missing rows read as pen 0
        }
    }
    usage
}
