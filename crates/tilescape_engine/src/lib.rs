//! Software tilemap compositing.
//!
//! A [`system::TilemapSystem`] owns any number of scrolling tile layers.
//! Each layer pulls its tile definitions from a driver-supplied
//! [`tile::TileSource`], caches the decoded state per tile, and re-decodes
//! only tiles that have been marked dirty. Layers are rendered into a
//! private pixmap and composited onto a destination bitmap with per-row /
//! per-column scrolling, per-tile opacity masks, and a shared priority
//! buffer that later draw calls (sprites, other layers) can arbitrate
//! against.
//!
//! The per-frame pipeline is `update_all` (rebuild dirty tile caches),
//! `render_all` (repaint dirty pixels into the layer pixmaps), then any
//! number of `draw` calls in back-to-front order.

pub mod bitmap;
mod blit;
mod cache;
mod mapper;
pub mod mask;
pub mod palette;
pub mod system;
pub mod tile;
pub mod tilemap;

pub use bitmap::{Bitmap, Pixel, Rect};
pub use mask::TileClass;
pub use palette::{Colortable, PaletteUsage};
pub use system::{ScreenConfig, TilemapId, TilemapSystem};
pub use tile::{
    compute_pen_usage, scan_cols, scan_rows, Orientation, TileFlip, TileInfo, TileMaskData,
    TilePixels, TileSize, TileSource, TilemapKind,
};
pub use tilemap::{DrawOp, SplitPass, Tilemap, LINE_DISABLED};

#[cfg(test)]
mod tests;
