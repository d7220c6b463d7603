//! Logical-to-cached tile addressing.
//!
//! Built once at creation and again whenever the effective orientation
//! changes, so that per-frame code only ever works in cache space: the
//! coordinate system of the rotated/flipped layer as it is stored and
//! blitted.

use crate::tile::{Orientation, TileFlip, TileSource};

pub(crate) struct CoordMapper {
    offset_to_cached: Vec<Option<u32>>,
    cached_to_offset: Vec<u32>,
    flip_remap: [TileFlip; 4],
}

impl CoordMapper {
    /// Walk the whole logical grid and record both directions of the
    /// mapping. A non-injective `memory_offset` is accepted: the last
    /// logical tile in row-major order wins the offset slot.
    pub fn build(
        source: &dyn TileSource,
        num_logical_cols: u32,
        num_logical_rows: u32,
        num_cached_cols: u32,
        num_cached_rows: u32,
        orientation: Orientation,
    ) -> CoordMapper {
        let mut max_offset = 0u32;
        for row in 0..num_logical_rows {
            for col in 0..num_logical_cols {
                let offset = source.memory_offset(col, row, num_logical_cols, num_logical_rows);
                max_offset = max_offset.max(offset);
            }
        }

        let num_cached = (num_cached_cols * num_cached_rows) as usize;
        let mut offset_to_cached = vec![None; max_offset as usize + 1];
        let mut cached_to_offset = vec![0u32; num_cached];

        for row in 0..num_logical_rows {
            for col in 0..num_logical_cols {
                let offset = source.memory_offset(col, row, num_logical_cols, num_logical_rows);
                let (mut c, mut r) = (col, row);
                if orientation.contains(Orientation::SWAP_XY) {
                    std::mem::swap(&mut c, &mut r);
                }
                if orientation.contains(Orientation::FLIP_X) {
                    c = num_cached_cols - 1 - c;
                }
                if orientation.contains(Orientation::FLIP_Y) {
                    r = num_cached_rows - 1 - r;
                }
                let cached = r * num_cached_cols + c;
                offset_to_cached[offset as usize] = Some(cached);
                cached_to_offset[cached as usize] = offset;
            }
        }

        let mut flip_remap = [TileFlip::empty(); 4];
        for (raw, slot) in flip_remap.iter_mut().enumerate() {
            let mut flip = TileFlip::from_bits_truncate(raw as u8);
            if orientation.contains(Orientation::SWAP_XY) {
                let (x, y) = (flip.contains(TileFlip::X), flip.contains(TileFlip::Y));
                flip = TileFlip::empty();
                flip.set(TileFlip::X, y);
                flip.set(TileFlip::Y, x);
            }
            if orientation.contains(Orientation::FLIP_X) {
                flip ^= TileFlip::X;
            }
            if orientation.contains(Orientation::FLIP_Y) {
                flip ^= TileFlip::Y;
            }
            *slot = flip;
        }

        CoordMapper {
            offset_to_cached,
            cached_to_offset,
            flip_remap,
        }
    }

    /// Cached slot for a driver memory offset, or `None` for offsets past
    /// the table or in holes of a sparse offset space.
    #[inline]
    pub fn cached_index(&self, memory_offset: u32) -> Option<u32> {
        self.offset_to_cached
            .get(memory_offset as usize)
            .copied()
            .flatten()
    }

    #[inline]
    pub fn memory_offset(&self, cached_index: u32) -> u32 {
        self.cached_to_offset[cached_index as usize]
    }

    /// Translate raw driver flip bits into cache space.
    #[inline]
    pub fn remap_flip(&self, raw: TileFlip) -> TileFlip {
        self.flip_remap[raw.bits() as usize]
    }
}
