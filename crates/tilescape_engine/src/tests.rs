use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::bitmap::{Bitmap, Pixel, Rect};
use crate::mapper::CoordMapper;
use crate::mask::TileClass;
use crate::palette::Colortable;
use crate::system::{ScreenConfig, TilemapId, TilemapSystem};
use crate::tile::{
    compute_pen_usage, scan_rows, Orientation, TileFlip, TileInfo, TileMaskData, TilePixels,
    TileSize, TileSource, TilemapKind,
};
use crate::tilemap::{DrawOp, SplitPass, LINE_DISABLED};

const SENTINEL: u16 = 0xffff;

/// Everything a test driver can say about one tile.
#[derive(Copy, Clone, Default)]
struct TileSpec {
    code: u8,
    flip: TileFlip,
    priority: u8,
    split_class: u8,
    palette_base: u32,
}

/// Row-major test driver: a shared spec table plus a pixel bank, with a
/// callback counter so tests can assert how often the engine re-decodes.
struct GridSource {
    bank: Arc<[u8]>,
    tile: usize,
    specs: Rc<RefCell<Vec<TileSpec>>>,
    calls: Rc<Cell<usize>>,
    mask_bank: Option<Arc<[u8]>>,
}

impl GridSource {
    fn new(bank: Arc<[u8]>, tile: usize, specs: Rc<RefCell<Vec<TileSpec>>>) -> GridSource {
        GridSource {
            bank,
            tile,
            specs,
            calls: Rc::new(Cell::new(0)),
            mask_bank: None,
        }
    }
}

impl TileSource for GridSource {
    fn memory_offset(&self, col: u32, row: u32, num_cols: u32, num_rows: u32) -> u32 {
        scan_rows(col, row, num_cols, num_rows)
    }

    fn tile_info(&mut self, memory_offset: u32, info: &mut TileInfo) {
        self.calls.set(self.calls.get() + 1);
        let spec = self
            .specs
            .borrow()
            .get(memory_offset as usize)
            .copied()
            .unwrap_or_default();
        let pixels = TilePixels::new(
            self.bank.clone(),
            spec.code as usize * self.tile * self.tile,
        );
        info.pen_usage = compute_pen_usage(&pixels, self.tile);
        info.pixels = Some(pixels);
        info.palette_base = spec.palette_base;
        info.flip = spec.flip;
        info.priority = spec.priority;
        info.split_class = spec.split_class;
        if let Some(bank) = &self.mask_bank {
            info.mask = Some(TileMaskData::new(
                bank.clone(),
                spec.code as usize * self.tile * self.tile / 8,
            ));
        }
    }
}

/// Bank where tile `k` is solid pen `k`.
fn solid_bank(tiles: usize, t: usize) -> Arc<[u8]> {
    let mut data = vec![0u8; tiles * t * t];
    for k in 0..tiles {
        data[k * t * t..(k + 1) * t * t].fill(k as u8);
    }
    data.into()
}

fn specs_with_codes(codes: impl IntoIterator<Item = u8>) -> Rc<RefCell<Vec<TileSpec>>> {
    Rc::new(RefCell::new(
        codes
            .into_iter()
            .map(|code| TileSpec {
                code,
                ..TileSpec::default()
            })
            .collect(),
    ))
}

fn system(width: u32, height: u32) -> TilemapSystem<u16> {
    TilemapSystem::new(ScreenConfig::plain(width, height), Colortable::identity(256))
}

fn draw_fresh(sys: &mut TilemapSystem<u16>, id: TilemapId, op: DrawOp) -> Bitmap<u16> {
    let mut dest = Bitmap::new(
        sys.screen().width as usize,
        sys.screen().height as usize,
    );
    dest.fill(SENTINEL);
    sys.draw(&mut dest, id, op);
    dest
}

// ---- addressing ----------------------------------------------------------

struct RowMajorOnly;

impl TileSource for RowMajorOnly {
    fn memory_offset(&self, col: u32, row: u32, num_cols: u32, num_rows: u32) -> u32 {
        scan_rows(col, row, num_cols, num_rows)
    }
    fn tile_info(&mut self, _offset: u32, _info: &mut TileInfo) {}
}

#[test]
fn round_trip_addressing_under_every_orientation() {
    let orientations = [
        Orientation::empty(),
        Orientation::FLIP_X,
        Orientation::FLIP_Y,
        Orientation::FLIP_X | Orientation::FLIP_Y,
        Orientation::SWAP_XY,
        Orientation::SWAP_XY | Orientation::FLIP_X,
        Orientation::SWAP_XY | Orientation::FLIP_Y,
        Orientation::SWAP_XY | Orientation::FLIP_X | Orientation::FLIP_Y,
    ];
    let (cols, rows) = (8u32, 4u32);
    for orientation in orientations {
        let (ccols, crows) = if orientation.contains(Orientation::SWAP_XY) {
            (rows, cols)
        } else {
            (cols, rows)
        };
        let mapper = CoordMapper::build(&RowMajorOnly, cols, rows, ccols, crows, orientation);
        let mut seen = vec![false; (cols * rows) as usize];
        for row in 0..rows {
            for col in 0..cols {
                let offset = scan_rows(col, row, cols, rows);
                let cached = mapper
                    .cached_index(offset)
                    .unwrap_or_else(|| panic!("{orientation:?}: offset {offset} unmapped"));
                assert_eq!(
                    mapper.memory_offset(cached),
                    offset,
                    "{orientation:?}: round trip broke at ({col},{row})"
                );
                // Bijective: no two logical tiles share a cached slot.
                assert!(!seen[cached as usize], "{orientation:?}: slot {cached} reused");
                seen[cached as usize] = true;
            }
        }
    }
}

// ---- dirty tracking ------------------------------------------------------

#[test]
fn second_update_decodes_nothing() {
    let mut sys = system(64, 64);
    let specs = specs_with_codes((0..64).map(|_| 1));
    let source = GridSource::new(solid_bank(4, 8), 8, specs);
    let calls = source.calls.clone();
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 8, 8)
        .unwrap();

    sys.update_all();
    assert_eq!(calls.get(), 64);
    sys.update_all();
    assert_eq!(calls.get(), 64, "clean tiles must not be re-decoded");

    sys.tilemap_mut(id).mark_tile_dirty(13);
    sys.update_all();
    assert_eq!(calls.get(), 65);

    // Offsets past VRAM fail silently and trigger nothing.
    sys.tilemap_mut(id).mark_tile_dirty(0xdead_beef);
    sys.update_all();
    assert_eq!(calls.get(), 65);
}

#[test]
fn disabled_tilemap_neither_updates_nor_draws() {
    let mut sys = system(32, 32);
    let specs = specs_with_codes((0..16).map(|_| 1));
    let source = GridSource::new(solid_bank(4, 8), 8, specs);
    let calls = source.calls.clone();
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 4, 4)
        .unwrap();

    sys.tilemap_mut(id).set_enable(false);
    sys.update_all();
    sys.render_all();
    assert_eq!(calls.get(), 0);
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    assert!(dest.row(0).iter().all(|&p| p == SENTINEL));

    sys.tilemap_mut(id).set_enable(true);
    sys.update_all();
    assert_eq!(calls.get(), 16);
}

// ---- opacity classification ----------------------------------------------

/// Bank of three 8px tiles for transparency tests: tile 0 all pen 0,
/// tile 1 all pen 1, tile 2 left half pen 0 / right half pen 1.
fn mixed_bank() -> Arc<[u8]> {
    let mut data = vec![0u8; 3 * 64];
    data[64..128].fill(1);
    for y in 0..8 {
        for x in 4..8 {
            data[128 + y * 8 + x] = 1;
        }
    }
    data.into()
}

#[test]
fn opacity_partition_matches_pen_test() {
    let mut sys = system(24, 8);
    let specs = specs_with_codes([0, 1, 2]);
    let source = GridSource::new(mixed_bank(), 8, specs);
    let bank = source.bank.clone();
    let id = sys
        .create(Box::new(source), TilemapKind::Transparent, TileSize::S8, 3, 1)
        .unwrap();
    sys.update_all();

    let tilemap = sys.tilemap(id);
    assert_eq!(
        tilemap.tile_class(0, SplitPass::Front),
        Some(TileClass::Transparent)
    );
    assert_eq!(
        tilemap.tile_class(1, SplitPass::Front),
        Some(TileClass::Opaque)
    );
    assert_eq!(
        tilemap.tile_class(2, SplitPass::Front),
        Some(TileClass::Masked)
    );
    assert_eq!(tilemap.tile_class(99, SplitPass::Front), None);

    // Re-derive the masked tile's bits from the pen data.
    let layer = tilemap.mask_layer(SplitPass::Front);
    for y in 0..8 {
        for x in 0..8 {
            let pen = bank[2 * 64 + y * 8 + x];
            assert_eq!(
                layer.bit(16 + x, y),
                pen != 0,
                "mask bit ({x},{y}) disagrees with pen test"
            );
        }
    }
}

#[test]
fn transparent_color_classifies_by_resolved_color() {
    // Entries 0 and 5 alias to the same color; pen 1 resolves elsewhere.
    let mut entries: Vec<u16> = (0..256).map(|i| i as u16).collect();
    entries[0] = 99;
    entries[5] = 99;
    let mut sys: TilemapSystem<u16> =
        TilemapSystem::new(ScreenConfig::plain(16, 8), Colortable::from_entries(entries));

    // Tile 0: pens 0 and 5 only. Tile 1: pens 5 and 1.
    let mut data = vec![0u8; 2 * 64];
    for i in 0..32 {
        data[i * 2 + 1] = 5;
    }
    data[64..96].fill(5);
    data[96..128].fill(1);
    let specs = specs_with_codes([0, 1]);
    let source = GridSource::new(data.into(), 8, specs);
    let id = sys
        .create(
            Box::new(source),
            TilemapKind::TransparentColor,
            TileSize::S8,
            2,
            1,
        )
        .unwrap();
    sys.tilemap_mut(id).set_transparent_color(99);
    sys.update_all();

    assert_eq!(
        sys.tilemap(id).tile_class(0, SplitPass::Front),
        Some(TileClass::Transparent),
        "both pens alias to the transparent color"
    );
    assert_eq!(
        sys.tilemap(id).tile_class(1, SplitPass::Front),
        Some(TileClass::Masked)
    );
}

#[test]
fn bitmask_kind_uses_driver_mask() {
    let mut sys = system(16, 8);
    let specs = specs_with_codes([0, 1]);
    let mut source = GridSource::new(solid_bank(2, 8), 8, specs);
    // Tile 0 mask: nothing set. Tile 1 mask: top four rows set.
    let mut mask = vec![0u8; 2 * 8];
    mask[8..12].fill(0xff);
    source.mask_bank = Some(mask.into());
    let id = sys
        .create(Box::new(source), TilemapKind::Bitmask, TileSize::S8, 2, 1)
        .unwrap();
    sys.update_all();
    sys.render_all();

    assert_eq!(
        sys.tilemap(id).tile_class(0, SplitPass::Front),
        Some(TileClass::Transparent)
    );
    assert_eq!(
        sys.tilemap(id).tile_class(1, SplitPass::Front),
        Some(TileClass::Masked)
    );

    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..8 {
        for x in 8..16 {
            let expect = if y < 4 { 1 } else { SENTINEL };
            assert_eq!(dest.pixel(x, y), expect, "pixel ({x},{y})");
        }
    }
}

// ---- compositing ---------------------------------------------------------

/// 32x32 grid of 16px tiles where every tile in column `c` is solid pen
/// `c`, on a 512x512 screen.
fn column_coded_map(sys: &mut TilemapSystem<u16>) -> TilemapId {
    let specs = specs_with_codes((0..32 * 32).map(|i| (i % 32) as u8));
    let source = GridSource::new(solid_bank(32, 16), 16, specs);
    sys.create(Box::new(source), TilemapKind::Opaque, TileSize::S16, 32, 32)
        .unwrap()
}

#[test]
fn whole_layer_scroll_wraps_at_source_width() {
    let mut sys = system(512, 512);
    let id = column_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();

    let base = draw_fresh(&mut sys, id, DrawOp::default());
    // Scrolling by exactly the layer width is invisible.
    sys.tilemap_mut(id).set_scrollx(0, 512);
    let wrapped = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..512 {
        assert_eq!(base.row(y), wrapped.row(y), "row {y}");
    }

    // Scrolling by one tile rotates the columns: the last column's
    // content wraps around to column 0.
    sys.tilemap_mut(id).set_scrollx(0, 16);
    let shifted = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..512 {
        for x in 0..512 {
            let expect = base.pixel((x + 512 - 16) % 512, y);
            assert_eq!(shifted.pixel(x, y), expect, "pixel ({x},{y})");
        }
    }
    assert_eq!(shifted.pixel(0, 0), 31);
}

#[test]
fn opaque_grid_scenario_classifies_everything_opaque() {
    let mut sys = system(512, 512);
    let specs = specs_with_codes((0..32 * 32).map(|_| 7));
    let source = GridSource::new(solid_bank(32, 16), 16, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S16, 32, 32)
        .unwrap();
    sys.update_all();
    sys.render_all();

    for offset in 0..32 * 32 {
        assert_eq!(
            sys.tilemap(id).tile_class(offset, SplitPass::Front),
            Some(TileClass::Opaque)
        );
    }
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    assert!(dest.row(100).iter().all(|&p| p == 7));
}

#[test]
fn fully_transparent_layer_writes_nothing() {
    let mut sys = system(128, 128);
    // Every tile is solid pen 0 with transparent pen 0: pen usage is
    // exactly the transparent bit everywhere.
    let specs = specs_with_codes((0..256).map(|_| 0));
    let source = GridSource::new(solid_bank(1, 8), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Transparent, TileSize::S8, 16, 16)
        .unwrap();
    sys.update_all();
    sys.render_all();

    for offset in 0..256 {
        assert_eq!(
            sys.tilemap(id).tile_class(offset, SplitPass::Front),
            Some(TileClass::Transparent)
        );
    }
    sys.tilemap_mut(id).set_clip(Some(Rect::new(3, 5, 100, 90)));
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    assert!((0..128).all(|y| dest.row(y).iter().all(|&p| p == SENTINEL)));
    assert!((0..128).all(|y| sys.priority_buffer().row(y).iter().all(|&p| p == 0)));
}

#[test]
fn priority_filter_paints_only_matching_tiles() {
    let mut sys = system(64, 64);
    let specs = Rc::new(RefCell::new(
        (0..64)
            .map(|i| TileSpec {
                code: 1 + (i % 2) as u8,
                priority: (i % 2) as u8,
                ..TileSpec::default()
            })
            .collect::<Vec<_>>(),
    ));
    let source = GridSource::new(solid_bank(3, 8), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 8, 8)
        .unwrap();
    sys.update_all();
    sys.render_all();

    let mut dest = Bitmap::new(64, 64);
    dest.fill(SENTINEL);
    sys.draw(
        &mut dest,
        id,
        DrawOp {
            tile_priority: 1,
            priority_code: 5,
            ..DrawOp::default()
        },
    );
    for y in 0..64 {
        for x in 0..64 {
            let odd_column = (x / 8) % 2 == 1;
            if odd_column {
                assert_eq!(dest.pixel(x, y), 2);
                assert_eq!(sys.priority_buffer().pixel(x, y), 5);
            } else {
                assert_eq!(dest.pixel(x, y), SENTINEL, "sentinel clobbered at ({x},{y})");
                assert_eq!(sys.priority_buffer().pixel(x, y), 0);
            }
        }
    }

    // The second pass fills in the rest; its code overwrites nothing of
    // the first pass because the footprints are disjoint.
    sys.draw(
        &mut dest,
        id,
        DrawOp {
            tile_priority: 0,
            priority_code: 9,
            ..DrawOp::default()
        },
    );
    assert!((0..64).all(|y| dest.row(y).iter().all(|&p| p != SENTINEL)));
    assert_eq!(sys.priority_buffer().pixel(8, 0), 5);
    assert_eq!(sys.priority_buffer().pixel(0, 0), 9);
}

/// Bank of one 8px tile whose pixel (x, y) is pen `(1 + x + 8*y) & 0x1f`:
/// asymmetric under both axes.
fn gradient_bank() -> Arc<[u8]> {
    let mut data = vec![0u8; 64];
    for y in 0..8 {
        for x in 0..8 {
            data[y * 8 + x] = (1 + x + 8 * y) as u8 & 0x1f;
        }
    }
    data.into()
}

#[test]
fn flipping_the_tilemap_mirrors_the_output() {
    let mut sys = system(32, 32);
    let specs = specs_with_codes((0..16).map(|_| 0));
    let source = GridSource::new(gradient_bank(), 8, specs.clone());
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 4, 4)
        .unwrap();
    sys.update_all();
    sys.render_all();
    let base = draw_fresh(&mut sys, id, DrawOp::default());

    sys.tilemap_mut(id).set_flip(TileFlip::X | TileFlip::Y);
    sys.update_all();
    sys.render_all();
    let flipped = draw_fresh(&mut sys, id, DrawOp::default());

    for y in 0..32 {
        for x in 0..32 {
            assert_eq!(
                flipped.pixel(x, y),
                base.pixel(31 - x, 31 - y),
                "mirror mismatch at ({x},{y})"
            );
        }
    }

    // A driver-side flip of a single tile goes through the same remap
    // table: with the layer unflipped, tile 0 alone comes out mirrored.
    sys.tilemap_mut(id).set_flip(TileFlip::empty());
    specs.borrow_mut()[0].flip = TileFlip::X | TileFlip::Y;
    sys.update_all();
    sys.render_all();
    let tile_flipped = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(tile_flipped.pixel(x, y), base.pixel(7 - x, 7 - y));
        }
    }
    assert_eq!(tile_flipped.pixel(8, 0), base.pixel(8, 0));
}

#[test]
fn split_passes_partition_every_pixel() {
    let mut sys = system(16, 16);
    let specs = specs_with_codes((0..4).map(|_| 0));
    let source = GridSource::new(gradient_bank(), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Split, TileSize::S8, 2, 2)
        .unwrap();
    // Pens 0..16 transparent in the front pass, opaque in the back.
    sys.tilemap_mut(id).set_transmask(0, 0x0000_ffff);
    sys.update_all();
    sys.render_all();

    let front = draw_fresh(&mut sys, id, DrawOp::default());
    let back = draw_fresh(
        &mut sys,
        id,
        DrawOp {
            pass: SplitPass::Back,
            ..DrawOp::default()
        },
    );
    for y in 0..16 {
        for x in 0..16 {
            let in_front = front.pixel(x, y) != SENTINEL;
            let in_back = back.pixel(x, y) != SENTINEL;
            assert!(
                in_front ^ in_back,
                "pixel ({x},{y}) must belong to exactly one pass"
            );
            let pen = gradient_bank()[(y % 8) * 8 + (x % 8)] as u32;
            assert_eq!(in_back, pen < 16, "pen {pen} landed in the wrong pass");
        }
    }
}

#[test]
fn ignore_transparency_forces_the_opaque_path() {
    let mut sys = system(16, 8);
    let specs = specs_with_codes([0, 2]);
    let source = GridSource::new(mixed_bank(), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Transparent, TileSize::S8, 2, 1)
        .unwrap();
    sys.update_all();
    sys.render_all();

    let dest = draw_fresh(
        &mut sys,
        id,
        DrawOp {
            ignore_transparency: true,
            ..DrawOp::default()
        },
    );
    assert!((0..8).all(|y| dest.row(y).iter().all(|&p| p != SENTINEL)));
}

// ---- row/column scroll ---------------------------------------------------

/// 8x8 grid of 8px tiles, tile (c, r) solid pen `(r * 8 + c) & 0x3f`, on
/// a 64x64 screen.
fn cell_coded_map(sys: &mut TilemapSystem<u16>) -> TilemapId {
    let specs = specs_with_codes((0..64).map(|i| (i & 0x3f) as u8));
    let source = GridSource::new(solid_bank(64, 8), 8, specs);
    sys.create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 8, 8)
        .unwrap()
}

#[test]
fn row_scroll_coalescing_matches_naive_shifts() {
    let mut sys = system(64, 64);
    let id = cell_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();
    let base = draw_fresh(&mut sys, id, DrawOp::default());

    let values = [5, 5, 5, 9, 9, 2, 2, 2];
    sys.tilemap_mut(id).set_scroll_rows(8);
    for (row, &v) in values.iter().enumerate() {
        sys.tilemap_mut(id).set_scrollx(row, v);
    }
    let scrolled = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..64usize {
        let shift = values[y / 8];
        for x in 0..64i32 {
            let sx = (x - shift).rem_euclid(64) as usize;
            assert_eq!(
                scrolled.pixel(x as usize, y),
                base.pixel(sx, y),
                "row {y} pixel {x}"
            );
        }
    }
}

#[test]
fn column_scroll_matches_naive_shifts() {
    let mut sys = system(64, 64);
    let id = cell_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();
    let base = draw_fresh(&mut sys, id, DrawOp::default());

    let values = [0, 12, 12, 70, -8, 3, 3, 3];
    sys.tilemap_mut(id).set_scroll_cols(8);
    for (col, &v) in values.iter().enumerate() {
        sys.tilemap_mut(id).set_scrolly(col, v);
    }
    let scrolled = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..64i32 {
        for x in 0..64usize {
            let shift = values[x / 8];
            let sy = (y - shift).rem_euclid(64) as usize;
            assert_eq!(
                scrolled.pixel(x, y as usize),
                base.pixel(x, sy),
                "col {x} pixel {y}"
            );
        }
    }
}

#[test]
fn disabled_scroll_line_is_not_drawn() {
    let mut sys = system(64, 64);
    let id = cell_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();

    sys.tilemap_mut(id).set_scroll_rows(8);
    for row in 0..8 {
        sys.tilemap_mut(id).set_scrollx(row, 0);
    }
    sys.tilemap_mut(id).set_scrollx(3, LINE_DISABLED);
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..64 {
        let disabled = (24..32).contains(&y);
        let all_sentinel = dest.row(y).iter().all(|&p| p == SENTINEL);
        let any_sentinel = dest.row(y).iter().any(|&p| p == SENTINEL);
        assert_eq!(all_sentinel, disabled, "row {y}");
        assert_eq!(any_sentinel, disabled, "row {y}");
    }
}

#[test]
fn scrolldx_offsets_every_scroll_value() {
    let mut sys = system(64, 64);
    let id = cell_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();
    let base = draw_fresh(&mut sys, id, DrawOp::default());

    sys.tilemap_mut(id).set_scrolldx(4, 0);
    sys.tilemap_mut(id).set_scrollx(0, 0);
    let offset = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..64 {
        for x in 0..64i32 {
            let sx = (x - 4).rem_euclid(64) as usize;
            assert_eq!(offset.pixel(x as usize, y), base.pixel(sx, y));
        }
    }
}

// ---- clip ----------------------------------------------------------------

#[test]
fn clip_rectangle_bounds_the_footprint() {
    let mut sys = system(64, 64);
    let id = cell_coded_map(&mut sys);
    sys.update_all();
    sys.render_all();

    let clip = Rect::new(10, 20, 30, 40);
    sys.tilemap_mut(id).set_clip(Some(clip));
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    for y in 0..64 {
        for x in 0..64 {
            let inside = clip.contains(x as i32, y as i32);
            assert_eq!(
                dest.pixel(x, y) != SENTINEL,
                inside,
                "clip violated at ({x},{y})"
            );
        }
    }

    sys.tilemap_mut(id).set_clip(None);
    let dest = draw_fresh(&mut sys, id, DrawOp::default());
    assert!((0..64).all(|y| dest.row(y).iter().all(|&p| p != SENTINEL)));
}

// ---- palette boundary ----------------------------------------------------

#[test]
fn palette_usage_brackets_rebuilds_and_dispose() {
    let mut sys = system(16, 8);
    let specs = specs_with_codes([1, 1]);
    let source = GridSource::new(solid_bank(3, 8), 8, specs.clone());
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 2, 1)
        .unwrap();
    sys.update_all();
    assert_eq!(sys.palette_usage().usage_count(1), 2);
    assert_eq!(sys.palette_usage().usage_count(2), 0);

    // Rebuilding a tile with a different code moves its count over.
    specs.borrow_mut()[0].code = 2;
    sys.tilemap_mut(id).mark_tile_dirty(0);
    sys.update_all();
    assert_eq!(sys.palette_usage().usage_count(1), 1);
    assert_eq!(sys.palette_usage().usage_count(2), 1);

    sys.dispose(id);
    assert_eq!(sys.palette_usage().usage_count(1), 0);
    assert_eq!(sys.palette_usage().usage_count(2), 0);
}

#[test]
fn palette_recalc_triggers_repaint() {
    let mut sys = system(16, 8);
    let specs = specs_with_codes([1, 2]);
    let source = GridSource::new(solid_bank(3, 8), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 2, 1)
        .unwrap();
    sys.update_all();
    sys.render_all();
    assert!(!sys.recalc_palette());
    assert_eq!(draw_fresh(&mut sys, id, DrawOp::default()).pixel(0, 0), 1);

    sys.colortable_mut().set_entry(1, 77);
    assert!(sys.recalc_palette());
    sys.render_all();
    assert_eq!(draw_fresh(&mut sys, id, DrawOp::default()).pixel(0, 0), 77);
}

// ---- the six blitter instantiations --------------------------------------

fn check_instantiation<P: Pixel>(tile: TileSize) {
    let t = tile.pixels();
    let side = 4 * t as u32;
    let mut sys: TilemapSystem<P> =
        TilemapSystem::new(ScreenConfig::plain(side, side), Colortable::identity(256));
    let specs = specs_with_codes((0..16).map(|i| i as u8));
    let source = GridSource::new(solid_bank(16, t), t, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, tile, 4, 4)
        .unwrap();
    sys.update_all();
    sys.render_all();

    let mut dest = Bitmap::new(side as usize, side as usize);
    sys.draw(&mut dest, id, DrawOp::default());
    for y in 0..side as usize {
        for x in 0..side as usize {
            let code = (y / t) * 4 + x / t;
            assert_eq!(
                dest.pixel(x, y),
                P::from_entry(code as u16),
                "{t}px tile, pixel ({x},{y})"
            );
        }
    }
}

#[test]
fn all_six_blitter_instantiations_agree() {
    check_instantiation::<u8>(TileSize::S8);
    check_instantiation::<u8>(TileSize::S16);
    check_instantiation::<u8>(TileSize::S32);
    check_instantiation::<u16>(TileSize::S8);
    check_instantiation::<u16>(TileSize::S16);
    check_instantiation::<u16>(TileSize::S32);
}

// ---- rotation ------------------------------------------------------------

#[test]
fn swapped_screen_transposes_tile_positions() {
    // Logical 4x2 grid of solid tiles on a rotated screen: cached space
    // is 2 columns by 4 rows, so the framebuffer is 16x32.
    let screen = ScreenConfig {
        width: 16,
        height: 32,
        visible_area: Rect::new(0, 0, 32, 16),
        orientation: Orientation::SWAP_XY,
    };
    let mut sys: TilemapSystem<u16> = TilemapSystem::new(screen, Colortable::identity(256));
    let specs = specs_with_codes((0..8).map(|i| i as u8));
    let source = GridSource::new(solid_bank(8, 8), 8, specs);
    let id = sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 4, 2)
        .unwrap();
    sys.update_all();
    sys.render_all();

    let mut dest = Bitmap::new(16, 32);
    sys.draw(&mut dest, id, DrawOp::default());
    for y in 0..32 {
        for x in 0..16 {
            // Cached (col, row) = logical (row, col).
            let (logical_col, logical_row) = (y / 8, x / 8);
            let code = (logical_row * 4 + logical_col) as u16;
            assert_eq!(dest.pixel(x, y), code, "pixel ({x},{y})");
        }
    }
}

// ---- creation errors -----------------------------------------------------

#[test]
fn creation_rejects_degenerate_grids() {
    let mut sys = system(64, 64);
    let specs = specs_with_codes([0]);
    let source = GridSource::new(solid_bank(1, 8), 8, specs.clone());
    assert!(sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 0, 4)
        .is_err());
    let source = GridSource::new(solid_bank(1, 8), 8, specs);
    assert!(sys
        .create(Box::new(source), TilemapKind::Opaque, TileSize::S8, 4096, 4096)
        .is_err());
}
