//! Lattice indexing primitives for sparse chemical field updates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by lattice index implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero-sized lattices).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The per-cell input did not match the lattice size.
    #[error("expected {expected} cell totals, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Neighbour pattern used when walking adjacent lattice cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Neighborhood {
    /// North, south, west, east.
    #[default]
    VonNeumann,
    /// The four orthogonal neighbours plus the four diagonals.
    Moore,
}

const VON_NEUMANN: [(i64, i64); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];
const MOORE: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

impl Neighborhood {
    /// Relative `(dx, dy)` offsets in a fixed visiting order.
    #[must_use]
    pub const fn offsets(self) -> &'static [(i64, i64)] {
        match self {
            Self::VonNeumann => &VON_NEUMANN,
            Self::Moore => &MOORE,
        }
    }
}

/// Visit the in-bounds neighbours of `(x, y)` on a `width × height` lattice.
///
/// Out-of-range neighbours are skipped; the lattice never wraps.
pub fn for_each_neighbor(
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    neighborhood: Neighborhood,
    visitor: &mut dyn FnMut(u32, u32),
) {
    for &(dx, dy) in neighborhood.offsets() {
        let nx = i64::from(x) + dx;
        let ny = i64::from(y) + dy;
        if nx < 0 || ny < 0 || nx >= i64::from(width) || ny >= i64::from(height) {
            continue;
        }
        visitor(nx as u32, ny as u32);
    }
}

/// Common behaviour exposed by lattice neighbourhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from per-cell totals.
    fn rebuild(&mut self, totals: &[f32], threshold: f32) -> Result<(), IndexError>;

    /// Visit the in-bounds neighbours of the cell at flat `offset`.
    fn neighbors_of(&self, offset: usize, neighborhood: Neighborhood, visitor: &mut dyn FnMut(usize));
}

/// Activity flags for every cell plus the one-cell halo surrounding active cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityMask {
    width: u32,
    height: u32,
    active: Vec<bool>,
    halo: Vec<bool>,
    active_count: usize,
    halo_count: usize,
}

impl ActivityMask {
    /// Create a mask with every cell inactive.
    pub fn new(width: u32, height: u32) -> Result<Self, IndexError> {
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig("lattice dimensions must be non-zero"));
        }
        let len = (width as usize) * (height as usize);
        Ok(Self {
            width,
            height,
            active: vec![false; len],
            halo: vec![false; len],
            active_count: 0,
            halo_count: 0,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Number of cells covered by the mask.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether the cell at `offset` met the activity threshold on the last rebuild.
    #[must_use]
    pub fn is_active(&self, offset: usize) -> bool {
        self.active.get(offset).copied().unwrap_or(false)
    }

    /// Per-cell activity flags, row-major.
    #[must_use]
    pub fn active(&self) -> &[bool] {
        &self.active
    }

    /// Active cells dilated by one cell in every direction (including diagonals).
    #[must_use]
    pub fn halo(&self) -> &[bool] {
        &self.halo
    }

    #[must_use]
    pub const fn active_count(&self) -> usize {
        self.active_count
    }

    #[must_use]
    pub const fn halo_count(&self) -> usize {
        self.halo_count
    }

    /// Returns true when the halo covers the whole lattice.
    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.halo_count == self.halo.len()
    }

    fn dilate(&mut self) {
        self.halo.fill(false);
        let width = self.width;
        let height = self.height;
        for y in 0..height {
            for x in 0..width {
                let idx = (y as usize) * (width as usize) + (x as usize);
                if !self.active[idx] {
                    continue;
                }
                self.halo[idx] = true;
                let halo = &mut self.halo;
                for_each_neighbor(width, height, x, y, Neighborhood::Moore, &mut |nx, ny| {
                    halo[(ny as usize) * (width as usize) + (nx as usize)] = true;
                });
            }
        }
        self.halo_count = self.halo.iter().filter(|flag| **flag).count();
    }
}

impl NeighborhoodIndex for ActivityMask {
    fn rebuild(&mut self, totals: &[f32], threshold: f32) -> Result<(), IndexError> {
        if totals.len() != self.active.len() {
            return Err(IndexError::LengthMismatch {
                expected: self.active.len(),
                actual: totals.len(),
            });
        }
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(IndexError::InvalidConfig(
                "activity threshold must be finite and non-negative",
            ));
        }
        let mut count = 0;
        for (flag, total) in self.active.iter_mut().zip(totals) {
            // NaN totals compare false and stay inactive.
            *flag = *total >= threshold;
            count += usize::from(*flag);
        }
        self.active_count = count;
        self.dilate();
        Ok(())
    }

    fn neighbors_of(&self, offset: usize, neighborhood: Neighborhood, visitor: &mut dyn FnMut(usize)) {
        if offset >= self.active.len() {
            return;
        }
        let width = self.width as usize;
        let x = (offset % width) as u32;
        let y = (offset / width) as u32;
        for_each_neighbor(self.width, self.height, x, y, neighborhood, &mut |nx, ny| {
            visitor((ny as usize) * width + nx as usize);
        });
    }
}

/// Axis-aligned block of lattice cells owned by one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRect {
    pub x0: u32,
    pub y0: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    /// Number of cells inside the tile.
    #[must_use]
    pub const fn len(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the global cell `(x, y)` lies inside the tile.
    #[must_use]
    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x0 && y >= self.y0 && x < self.x0 + self.width && y < self.y0 + self.height
    }

    /// Row-major offset of the global cell `(x, y)` inside this tile.
    #[must_use]
    pub const fn local_offset(&self, x: u32, y: u32) -> Option<usize> {
        if self.contains(x, y) {
            Some(((y - self.y0) as usize) * (self.width as usize) + (x - self.x0) as usize)
        } else {
            None
        }
    }

    /// Global coordinates of the tile-local cell `local`.
    #[must_use]
    pub const fn global_coords(&self, local: usize) -> (u32, u32) {
        let w = self.width as usize;
        (self.x0 + (local % w) as u32, self.y0 + (local / w) as u32)
    }

    /// Global row-major offsets of every cell in the tile, in tile-local order.
    pub fn offsets(&self, grid_width: u32) -> impl Iterator<Item = usize> + '_ {
        let grid_width = grid_width as usize;
        (0..self.len()).map(move |local| {
            let (x, y) = self.global_coords(local);
            (y as usize) * grid_width + x as usize
        })
    }
}

/// Square tiling of a lattice used for spatially decomposed simulation.
///
/// Serializes as its dimensions; tiles and the locator are rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "LayoutShape", into = "LayoutShape")]
pub struct TileLayout {
    width: u32,
    height: u32,
    tile_size: u32,
    tiles: Vec<TileRect>,
    locator: Vec<(u32, u32)>,
}

#[derive(Serialize, Deserialize)]
struct LayoutShape {
    width: u32,
    height: u32,
    tile_size: u32,
}

impl From<TileLayout> for LayoutShape {
    fn from(layout: TileLayout) -> Self {
        Self {
            width: layout.width,
            height: layout.height,
            tile_size: layout.tile_size,
        }
    }
}

impl TryFrom<LayoutShape> for TileLayout {
    type Error = IndexError;

    fn try_from(shape: LayoutShape) -> Result<Self, Self::Error> {
        Self::new(shape.width, shape.height, Some(shape.tile_size))
    }
}

impl TileLayout {
    /// Split a `width × height` lattice into tiles of `tile_size` cells per edge.
    ///
    /// `None` yields one tile covering the whole lattice. Edge tiles are truncated
    /// when the dimensions are not multiples of the tile size.
    pub fn new(width: u32, height: u32, tile_size: Option<u32>) -> Result<Self, IndexError> {
        if width == 0 || height == 0 {
            return Err(IndexError::InvalidConfig("lattice dimensions must be non-zero"));
        }
        let tile_size = match tile_size {
            Some(0) => return Err(IndexError::InvalidConfig("tile size must be non-zero")),
            Some(size) => size,
            None => width.max(height),
        };

        let mut tiles = Vec::new();
        let mut y0 = 0;
        while y0 < height {
            let tile_h = tile_size.min(height - y0);
            let mut x0 = 0;
            while x0 < width {
                let tile_w = tile_size.min(width - x0);
                tiles.push(TileRect {
                    x0,
                    y0,
                    width: tile_w,
                    height: tile_h,
                });
                x0 += tile_w;
            }
            y0 += tile_h;
        }

        let mut locator = vec![(0, 0); (width as usize) * (height as usize)];
        for (tile_idx, tile) in tiles.iter().enumerate() {
            for (local, offset) in tile.offsets(width).enumerate() {
                locator[offset] = (tile_idx as u32, local as u32);
            }
        }

        Ok(Self {
            width,
            height,
            tile_size,
            tiles,
            locator,
        })
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Tiles in row-major order of their origins.
    #[must_use]
    pub fn tiles(&self) -> &[TileRect] {
        &self.tiles
    }

    /// Number of tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Map a global flat offset to `(tile index, tile-local offset)`.
    #[must_use]
    pub fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        self.locator
            .get(offset)
            .map(|&(tile, local)| (tile as usize, local as usize))
    }
}
