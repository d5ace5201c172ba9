//! Spatial cell cache driving sparse reaction iteration.

use chemfield_index::{ActivityMask, NeighborhoodIndex, TileLayout, TileRect};
use serde::{Deserialize, Serialize};

use crate::{CellCoord, ChemistryError, ConcentrationGrid, ReactionNetwork};

/// Cached reaction state of one lattice cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialCell {
    pub position: CellCoord,
    pub active: bool,
    /// Simulated time of the last propensity recomputation.
    pub last_propensity_update: f64,
    /// Sum of the cell's reaction propensities.
    pub total_propensity: f64,
}

/// Cells of one partition with local copies of their concentrations and propensities.
#[derive(Debug, Clone)]
pub struct CellTile {
    rect: TileRect,
    species_count: usize,
    reaction_count: usize,
    cells: Vec<SpatialCell>,
    /// `local * species_count + species`; widened to `f64` for the reaction window.
    concentrations: Vec<f64>,
    /// `local * reaction_count + reaction`.
    propensities: Vec<f64>,
}

impl CellTile {
    fn new(rect: TileRect, species_count: usize, reaction_count: usize) -> Self {
        let cells = (0..rect.len())
            .map(|local| {
                let (x, y) = rect.global_coords(local);
                SpatialCell {
                    position: CellCoord::new(x, y),
                    active: false,
                    last_propensity_update: 0.0,
                    total_propensity: 0.0,
                }
            })
            .collect();
        Self {
            rect,
            species_count,
            reaction_count,
            cells,
            concentrations: vec![0.0; rect.len() * species_count],
            propensities: vec![0.0; rect.len() * reaction_count],
        }
    }

    #[must_use]
    pub const fn rect(&self) -> TileRect {
        self.rect
    }

    #[must_use]
    pub fn cells(&self) -> &[SpatialCell] {
        &self.cells
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Concentration view of one cell, indexed by species.
    #[must_use]
    pub fn concentrations(&self, local: usize) -> &[f64] {
        let start = local * self.species_count;
        &self.concentrations[start..start + self.species_count]
    }

    /// Propensity of every reaction in one cell, in registration order.
    #[must_use]
    pub fn propensities(&self, local: usize) -> &[f64] {
        let start = local * self.reaction_count;
        &self.propensities[start..start + self.reaction_count]
    }

    #[must_use]
    pub fn cell_total(&self, local: usize) -> f32 {
        self.concentrations(local).iter().sum::<f64>() as f32
    }

    /// Sum of propensities over the tile.
    #[must_use]
    pub fn total_propensity(&self) -> f64 {
        self.cells.iter().map(|cell| cell.total_propensity).sum()
    }

    pub(crate) fn concentrations_mut(&mut self, local: usize) -> &mut [f64] {
        let start = local * self.species_count;
        &mut self.concentrations[start..start + self.species_count]
    }

    /// Copy the tile's cells out of the grid and flag activity.
    fn load(&mut self, grid: &ConcentrationGrid, mask: &ActivityMask) {
        let fields = grid.fields();
        for (local, offset) in self.rect.offsets(grid.width()).enumerate() {
            let start = local * self.species_count;
            for (species, field) in fields.iter().enumerate() {
                self.concentrations[start + species] = f64::from(field[offset]);
            }
            let cell = &mut self.cells[local];
            cell.active = mask.is_active(offset);
            cell.total_propensity = 0.0;
        }
        self.propensities.fill(0.0);
    }

    /// Write the tile's concentrations back into the grid. Returns clamped writes.
    pub(crate) fn store(&self, grid: &mut ConcentrationGrid) -> usize {
        let width = grid.width();
        let mut clamps = 0;
        for (local, offset) in self.rect.offsets(width).enumerate() {
            for species in 0..self.species_count {
                let value = self.concentrations[local * self.species_count + species];
                clamps += usize::from(grid.store(species, offset, value as f32));
            }
        }
        clamps
    }

    /// Recompute one cell's propensities. Cells below `epsilon` are deactivated.
    pub(crate) fn recompute(
        &mut self,
        local: usize,
        network: &ReactionNetwork,
        coupling: f64,
        epsilon: f32,
        time: f64,
    ) -> f64 {
        let total = self.cell_total(local);
        let start = local * self.reaction_count;
        let active = self.cells[local].active && total >= epsilon;
        let mut sum = 0.0;
        for reaction in 0..self.reaction_count {
            let propensity = if active {
                let start_c = local * self.species_count;
                network.propensity_at(
                    reaction,
                    &self.concentrations[start_c..start_c + self.species_count],
                    coupling,
                )
            } else {
                0.0
            };
            self.propensities[start + reaction] = propensity;
            sum += propensity;
        }
        let cell = &mut self.cells[local];
        cell.active = active;
        cell.total_propensity = sum;
        cell.last_propensity_update = time;
        sum
    }

    /// Pick the `(local cell, reaction)` pair where the running propensity sum first exceeds `target`.
    ///
    /// Falls back to the last positive pair when rounding leaves the walk short.
    pub(crate) fn select(&self, target: f64) -> Option<(usize, usize)> {
        let mut running = 0.0;
        let mut last_positive = None;
        for (local, cell) in self.cells.iter().enumerate() {
            if cell.total_propensity <= 0.0 {
                continue;
            }
            if running + cell.total_propensity <= target {
                running += cell.total_propensity;
                last_positive = self
                    .propensities(local)
                    .iter()
                    .rposition(|p| *p > 0.0)
                    .map(|reaction| (local, reaction))
                    .or(last_positive);
                continue;
            }
            for (reaction, propensity) in self.propensities(local).iter().enumerate() {
                if *propensity <= 0.0 {
                    continue;
                }
                running += propensity;
                last_positive = Some((local, reaction));
                if running > target {
                    return Some((local, reaction));
                }
            }
        }
        last_positive
    }
}

/// Lattice-wide cell cache: tiles, activity mask and per-cell totals.
#[derive(Debug, Clone)]
pub struct SpatialCellIndex {
    layout: TileLayout,
    mask: ActivityMask,
    tiles: Vec<CellTile>,
    totals: Vec<f32>,
    epsilon: f32,
}

impl SpatialCellIndex {
    pub fn new(
        width: u32,
        height: u32,
        partition_size: Option<u32>,
        species_count: usize,
        reaction_count: usize,
        epsilon: f32,
    ) -> Result<Self, ChemistryError> {
        let layout = TileLayout::new(width, height, partition_size)?;
        let mask = ActivityMask::new(width, height)?;
        let tiles = layout
            .tiles()
            .iter()
            .map(|rect| CellTile::new(*rect, species_count, reaction_count))
            .collect();
        Ok(Self {
            layout,
            mask,
            tiles,
            totals: Vec::with_capacity(width as usize * height as usize),
            epsilon,
        })
    }

    #[must_use]
    pub const fn epsilon(&self) -> f32 {
        self.epsilon
    }

    #[must_use]
    pub fn layout(&self) -> &TileLayout {
        &self.layout
    }

    #[must_use]
    pub fn mask(&self) -> &ActivityMask {
        &self.mask
    }

    #[must_use]
    pub fn tiles(&self) -> &[CellTile] {
        &self.tiles
    }

    pub(crate) fn tiles_mut(&mut self) -> &mut [CellTile] {
        &mut self.tiles
    }

    /// Per-cell concentration totals captured on the last refresh.
    #[must_use]
    pub fn totals(&self) -> &[f32] {
        &self.totals
    }

    /// Split borrow used by the reaction engine.
    pub(crate) fn tiles_and_totals(&mut self) -> (&mut [CellTile], &[f32], &ActivityMask) {
        (&mut self.tiles, &self.totals, &self.mask)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.mask.active_count()
    }

    /// Diffusion update mask: active cells plus their one-cell halo, `None` when it covers everything.
    #[must_use]
    pub fn update_mask(&self) -> Option<&[bool]> {
        if self.mask.is_dense() {
            None
        } else {
            Some(self.mask.halo())
        }
    }

    /// Recompute totals, the activity mask and every tile's cached concentrations from `grid`.
    pub fn refresh(&mut self, grid: &ConcentrationGrid) -> Result<(), ChemistryError> {
        grid.cell_totals(&mut self.totals);
        self.mask.rebuild(&self.totals, self.epsilon)?;
        for tile in &mut self.tiles {
            tile.load(grid, &self.mask);
        }
        Ok(())
    }

    /// Cached cell at `coord`.
    #[must_use]
    pub fn cell(&self, coord: CellCoord) -> Option<&SpatialCell> {
        let (tile, local) = self.locate(coord)?;
        self.tiles[tile].cells.get(local)
    }

    /// Cached propensities at `coord`.
    #[must_use]
    pub fn propensities(&self, coord: CellCoord) -> Option<&[f64]> {
        let (tile, local) = self.locate(coord)?;
        Some(self.tiles[tile].propensities(local))
    }

    fn locate(&self, coord: CellCoord) -> Option<(usize, usize)> {
        if coord.x >= self.layout.width() || coord.y >= self.layout.height() {
            return None;
        }
        let offset = coord.y as usize * self.layout.width() as usize + coord.x as usize;
        self.layout.locate(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReactionSpec, SpeciesId, SpeciesRegistry, SpeciesSpec};

    fn network() -> ReactionNetwork {
        let mut species = SpeciesRegistry::new();
        species
            .register(SpeciesSpec::new("a", 0.1, 0.0))
            .expect("a");
        let decay = ReactionSpec::new("decay", 1.0).reactant(SpeciesId(0), 1);
        let burst = ReactionSpec::new("burst", 0.5).reactant(SpeciesId(0), 1);
        ReactionNetwork::new(&[decay, burst], &species, None, 1.0).expect("network")
    }

    #[test]
    fn refresh_flags_activity_and_halo() {
        let mut grid = ConcentrationGrid::new(6, 6, 1.0, 1).expect("grid");
        grid.set(SpeciesId(0), 2, 2, 3.0).expect("set");
        let mut index = SpatialCellIndex::new(6, 6, Some(3), 1, 2, 0.5).expect("index");
        index.refresh(&grid).expect("refresh");
        assert_eq!(index.tiles().len(), 4);
        assert_eq!(index.active_count(), 1);
        assert!(index.cell(CellCoord::new(2, 2)).expect("cell").active);
        assert!(!index.cell(CellCoord::new(3, 3)).expect("cell").active);
        let mask = index.update_mask().expect("sparse");
        assert!(mask[3 * 6 + 3]);
        assert!(!mask[5 * 6 + 5]);
        assert!(index.cell(CellCoord::new(6, 0)).is_none());
    }

    #[test]
    fn recompute_and_select_follow_registration_order() {
        let network = network();
        let mut grid = ConcentrationGrid::new(3, 1, 1.0, 1).expect("grid");
        grid.set(SpeciesId(0), 0, 0, 2.0).expect("set");
        grid.set(SpeciesId(0), 2, 0, 4.0).expect("set");
        let mut index = SpatialCellIndex::new(3, 1, None, 1, 2, 1e-6).expect("index");
        index.refresh(&grid).expect("refresh");
        let tile = &mut index.tiles_mut()[0];
        for local in 0..3 {
            tile.recompute(local, &network, 1.0, 1e-6, 0.5);
        }
        assert_eq!(tile.propensities(0), &[2.0, 1.0]);
        assert_eq!(tile.propensities(1), &[0.0, 0.0]);
        assert!((tile.total_propensity() - 9.0).abs() < 1e-12);
        assert_eq!(tile.cells()[0].last_propensity_update, 0.5);

        assert_eq!(tile.select(0.0), Some((0, 0)));
        assert_eq!(tile.select(2.5), Some((0, 1)));
        assert_eq!(tile.select(3.0), Some((2, 0)));
        assert_eq!(tile.select(8.9), Some((2, 1)));
        assert_eq!(tile.select(9.0), Some((2, 1)));
    }

    #[test]
    fn store_round_trips_tile_contents() {
        let network = network();
        let mut grid = ConcentrationGrid::new(4, 4, 1.0, 1).expect("grid");
        grid.fill(SpeciesId(0), 1.0).expect("fill");
        let mut index = SpatialCellIndex::new(4, 4, Some(2), 1, network.len(), 0.0).expect("index");
        index.refresh(&grid).expect("refresh");
        let tile = &mut index.tiles_mut()[3];
        tile.concentrations_mut(0)[0] = 5.0;
        tile.store(&mut grid);
        assert_eq!(grid.get(SpeciesId(0), 2, 2), Some(5.0));
        assert!(index.update_mask().is_none());
    }
}
