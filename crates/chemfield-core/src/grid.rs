//! Per-species concentration storage and read-only snapshots.

use serde::{Deserialize, Serialize};

use crate::{ChemistryError, SpeciesId, Tick};

/// Clamp a written concentration to the non-negative range.
///
/// Returns the stored value and whether a clamp happened. NaN is stored as zero.
#[inline]
pub(crate) fn clamp_non_negative(value: f32) -> (f32, bool) {
    if value >= 0.0 {
        (value, false)
    } else {
        (0.0, true)
    }
}

/// 2D concentration fields, one row-major array per registered species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationGrid {
    width: u32,
    height: u32,
    cell_size: f32,
    fields: Vec<Vec<f32>>,
}

impl ConcentrationGrid {
    /// Allocate `species_count` zeroed fields of `width * height` cells.
    pub fn new(
        width: u32,
        height: u32,
        cell_size: f32,
        species_count: usize,
    ) -> Result<Self, ChemistryError> {
        if width == 0 || height == 0 {
            return Err(ChemistryError::InvalidConfiguration(
                "grid dimensions must be non-zero".to_string(),
            ));
        }
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(ChemistryError::InvalidConfiguration(
                "cell_size must be positive".to_string(),
            ));
        }
        let len = (width as usize) * (height as usize);
        Ok(Self {
            width,
            height,
            cell_size,
            fields: vec![vec![0.0; len]; species_count],
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
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    #[must_use]
    pub fn species_count(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    /// Returns the flat index for `(x, y)` without bounds checks.
    #[inline]
    #[must_use]
    pub fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Inverse of [`offset`](Self::offset).
    #[inline]
    #[must_use]
    pub fn coords(&self, offset: usize) -> (u32, u32) {
        let width = self.width as usize;
        ((offset % width) as u32, (offset / width) as u32)
    }

    /// Convert world coordinates to a cell via `floor(coord / cell_size)`.
    ///
    /// Negative, non-finite or out-of-range coordinates map to `None`.
    #[must_use]
    pub fn world_to_cell(&self, world_x: f32, world_y: f32) -> Option<(u32, u32)> {
        if !(world_x.is_finite() && world_y.is_finite()) || world_x < 0.0 || world_y < 0.0 {
            return None;
        }
        let cx = (world_x / self.cell_size).floor();
        let cy = (world_y / self.cell_size).floor();
        if cx >= self.width as f32 || cy >= self.height as f32 {
            return None;
        }
        Some((cx as u32, cy as u32))
    }

    /// Immutable access to one species field.
    pub fn field(&self, species: SpeciesId) -> Result<&[f32], ChemistryError> {
        self.fields
            .get(species.index())
            .map(Vec::as_slice)
            .ok_or(ChemistryError::UnknownSpecies(species))
    }

    pub(crate) fn fields(&self) -> &[Vec<f32>] {
        &self.fields
    }

    /// Swap a species field with `buffer`, completing a double-buffered update.
    pub(crate) fn swap_field(&mut self, species: usize, buffer: &mut Vec<f32>) {
        debug_assert_eq!(self.fields[species].len(), buffer.len());
        std::mem::swap(&mut self.fields[species], buffer);
    }

    /// Store a raw value at a flat offset, clamping negatives. Returns whether a clamp happened.
    pub(crate) fn store(&mut self, species: usize, offset: usize, value: f32) -> bool {
        let (value, clamped) = clamp_non_negative(value);
        self.fields[species][offset] = value;
        clamped
    }

    /// Concentration of `species` at `(x, y)`, `None` when out of bounds.
    #[must_use]
    pub fn get(&self, species: SpeciesId, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = self.offset(x, y);
        self.fields
            .get(species.index())
            .map(|field| field[offset])
    }

    /// Add `amount` (possibly negative) at `(x, y)`.
    ///
    /// Returns whether the result had to be clamped to zero.
    pub fn add(
        &mut self,
        species: SpeciesId,
        x: u32,
        y: u32,
        amount: f32,
    ) -> Result<bool, ChemistryError> {
        let offset = self.offset(x, y);
        let field = self
            .fields
            .get_mut(species.index())
            .ok_or(ChemistryError::UnknownSpecies(species))?;
        if x >= self.width || y >= self.height {
            return Ok(false);
        }
        let (value, clamped) = clamp_non_negative(field[offset] + amount);
        field[offset] = value;
        Ok(clamped)
    }

    /// Overwrite the value at `(x, y)`, clamping negatives.
    pub fn set(
        &mut self,
        species: SpeciesId,
        x: u32,
        y: u32,
        value: f32,
    ) -> Result<bool, ChemistryError> {
        let current = self
            .get(species, x, y)
            .or_else(|| self.fields.get(species.index()).map(|_| 0.0))
            .ok_or(ChemistryError::UnknownSpecies(species))?;
        self.add(species, x, y, value - current)
    }

    /// Replace a whole species field, returning how many values were clamped.
    pub fn load_field(&mut self, species: SpeciesId, values: &[f32]) -> Result<usize, ChemistryError> {
        let expected = self.cell_count();
        let field = self
            .fields
            .get_mut(species.index())
            .ok_or(ChemistryError::UnknownSpecies(species))?;
        if values.len() != expected {
            return Err(ChemistryError::FieldLength {
                expected,
                actual: values.len(),
            });
        }
        let mut clamps = 0;
        for (slot, value) in field.iter_mut().zip(values) {
            let (value, clamped) = clamp_non_negative(*value);
            *slot = value;
            clamps += usize::from(clamped);
        }
        Ok(clamps)
    }

    /// Fill one species field with a constant value.
    pub fn fill(&mut self, species: SpeciesId, value: f32) -> Result<(), ChemistryError> {
        let field = self
            .fields
            .get_mut(species.index())
            .ok_or(ChemistryError::UnknownSpecies(species))?;
        field.fill(clamp_non_negative(value).0);
        Ok(())
    }

    /// Sum of a species over all cells.
    pub fn total_mass(&self, species: SpeciesId) -> Result<f64, ChemistryError> {
        Ok(self.field(species)?.iter().map(|v| f64::from(*v)).sum())
    }

    /// Sum of all species at a flat offset.
    #[must_use]
    pub fn cell_total(&self, offset: usize) -> f32 {
        self.fields.iter().map(|field| field[offset]).sum()
    }

    /// Write per-cell totals across species into `out`.
    pub fn cell_totals(&self, out: &mut Vec<f32>) {
        out.clear();
        out.resize(self.cell_count(), 0.0);
        for field in &self.fields {
            for (total, value) in out.iter_mut().zip(field) {
                *total += *value;
            }
        }
    }
}

/// Read-only copy of every species field taken once per tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridSnapshot {
    pub tick: Tick,
    pub time: f64,
    pub width: u32,
    pub height: u32,
    pub cell_size: f32,
    fields: Vec<Vec<f32>>,
}

impl GridSnapshot {
    /// Copy the grid's current contents.
    #[must_use]
    pub fn capture(grid: &ConcentrationGrid, tick: Tick, time: f64) -> Self {
        Self {
            tick,
            time,
            width: grid.width,
            height: grid.height,
            cell_size: grid.cell_size,
            fields: grid.fields.clone(),
        }
    }

    #[must_use]
    pub fn species_count(&self) -> usize {
        self.fields.len()
    }

    /// Row-major field of one species.
    #[must_use]
    pub fn field(&self, species: SpeciesId) -> Option<&[f32]> {
        self.fields.get(species.index()).map(Vec::as_slice)
    }

    #[must_use]
    pub fn get(&self, species: SpeciesId, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize) * (self.width as usize) + x as usize;
        self.field(species).map(|field| field[offset])
    }

    /// Sum of a species over all cells; zero for unknown species.
    #[must_use]
    pub fn total_mass(&self, species: SpeciesId) -> f64 {
        self.field(species)
            .map_or(0.0, |field| field.iter().map(|v| f64::from(*v)).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_accessors_and_clamping() {
        let mut grid = ConcentrationGrid::new(4, 2, 1.0, 2).expect("grid");
        assert_eq!(grid.width(), 4);
        assert_eq!(grid.height(), 2);
        assert_eq!(grid.get(SpeciesId(1), 1, 1), Some(0.0));
        assert!(!grid.add(SpeciesId(0), 2, 0, 3.0).expect("add"));
        assert_eq!(grid.get(SpeciesId(0), 2, 0), Some(3.0));
        assert!(grid.add(SpeciesId(0), 2, 0, -5.0).expect("add"));
        assert_eq!(grid.get(SpeciesId(0), 2, 0), Some(0.0));
        assert!(grid.get(SpeciesId(0), 5, 0).is_none());
        assert!(!grid.add(SpeciesId(0), 9, 9, 1.0).expect("out of bounds is tolerated"));
        assert!(matches!(
            grid.add(SpeciesId(3), 0, 0, 1.0),
            Err(ChemistryError::UnknownSpecies(SpeciesId(3)))
        ));
    }

    #[test]
    fn world_coordinates_floor_into_cells() {
        let grid = ConcentrationGrid::new(10, 5, 2.0, 1).expect("grid");
        assert_eq!(grid.world_to_cell(0.0, 0.0), Some((0, 0)));
        assert_eq!(grid.world_to_cell(3.99, 9.5), Some((1, 4)));
        assert_eq!(grid.world_to_cell(20.0, 1.0), None);
        assert_eq!(grid.world_to_cell(-0.1, 1.0), None);
        assert_eq!(grid.world_to_cell(f32::NAN, 1.0), None);
    }

    #[test]
    fn load_field_checks_length_and_clamps() {
        let mut grid = ConcentrationGrid::new(2, 2, 1.0, 1).expect("grid");
        assert!(matches!(
            grid.load_field(SpeciesId(0), &[1.0; 3]),
            Err(ChemistryError::FieldLength {
                expected: 4,
                actual: 3
            })
        ));
        let clamps = grid
            .load_field(SpeciesId(0), &[1.0, -2.0, 0.5, f32::NAN])
            .expect("load");
        assert_eq!(clamps, 2);
        assert_eq!(grid.field(SpeciesId(0)).expect("field"), &[1.0, 0.0, 0.5, 0.0]);
        assert!((grid.total_mass(SpeciesId(0)).expect("mass") - 1.5).abs() < 1e-9);
    }

    #[test]
    fn snapshot_is_detached_from_grid() {
        let mut grid = ConcentrationGrid::new(3, 3, 1.0, 1).expect("grid");
        grid.set(SpeciesId(0), 1, 1, 4.0).expect("set");
        let snapshot = GridSnapshot::capture(&grid, Tick(3), 0.3);
        grid.set(SpeciesId(0), 1, 1, 1.0).expect("set");
        assert_eq!(snapshot.get(SpeciesId(0), 1, 1), Some(4.0));
        assert_eq!(snapshot.tick, Tick(3));
        assert!((snapshot.total_mass(SpeciesId(0)) - 4.0).abs() < 1e-9);
        assert_eq!(snapshot.total_mass(SpeciesId(7)), 0.0);
    }
}
