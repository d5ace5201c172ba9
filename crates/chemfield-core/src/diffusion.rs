//! Explicit diffusion-decay integration over the concentration lattice.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::grid::clamp_non_negative;
use crate::{ChemistryConfig, ChemistryError, ConcentrationGrid, SpeciesId, SpeciesRegistry};

/// Largest admissible `dt * D / h²`.
pub const STABILITY_LIMIT: f64 = 0.25;

const FOUR_NEIGHBOR: [(i64, i64, f64); 4] = [(0, -1, 1.0), (0, 1, 1.0), (-1, 0, 1.0), (1, 0, 1.0)];

const ORTHO: f64 = 2.0 / 3.0;
const DIAG: f64 = 1.0 / 6.0;
const EIGHT_NEIGHBOR: [(i64, i64, f64); 8] = [
    (-1, -1, DIAG),
    (0, -1, ORTHO),
    (1, -1, DIAG),
    (-1, 0, ORTHO),
    (1, 0, ORTHO),
    (-1, 1, DIAG),
    (0, 1, ORTHO),
    (1, 1, DIAG),
];

/// Discrete Laplacian stencil.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StencilKind {
    /// Classic 5-point stencil.
    #[default]
    FourNeighbor,
    /// Isotropic 9-point stencil (orthogonal 2/3, diagonal 1/6).
    EightNeighbor,
}

impl StencilKind {
    /// `(dx, dy, weight)` entries.
    #[must_use]
    pub const fn weights(self) -> &'static [(i64, i64, f64)] {
        match self {
            Self::FourNeighbor => &FOUR_NEIGHBOR,
            Self::EightNeighbor => &EIGHT_NEIGHBOR,
        }
    }
}

/// Execution strategy for a diffusion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffusionBackend {
    /// Row-parallel convolution over the lattice.
    #[default]
    Parallel,
    /// Single-threaded neighbour flux accumulation.
    Sequential,
}

/// Per-cell rate terms shared by both backends.
#[derive(Debug, Clone, Copy)]
struct PassParams<'a> {
    width: usize,
    height: usize,
    weights: &'static [(i64, i64, f64)],
    /// `dt * D / h²`.
    diffusion: f64,
    /// `dt * decay`.
    decay: f64,
    mask: Option<&'a [bool]>,
}

impl PassParams<'_> {
    #[inline]
    fn updates(&self, offset: usize) -> bool {
        self.mask.is_none_or(|mask| mask[offset])
    }

    #[inline]
    fn neighbor(&self, x: usize, y: usize, dx: i64, dy: i64) -> Option<usize> {
        let nx = x as i64 + dx;
        let ny = y as i64 + dy;
        if nx < 0 || ny < 0 || nx >= self.width as i64 || ny >= self.height as i64 {
            return None;
        }
        let offset = ny as usize * self.width + nx as usize;
        self.updates(offset).then_some(offset)
    }
}

impl DiffusionBackend {
    /// Read `input`, write every cell of `output`; returns the clamp count.
    fn apply(self, input: &[f32], output: &mut [f32], params: &PassParams<'_>) -> usize {
        match self {
            Self::Sequential => sequential_pass(input, output, params),
            Self::Parallel => output
                .par_chunks_mut(params.width)
                .enumerate()
                .map(|(y, row)| convolve_row(input, row, y, params))
                .sum(),
        }
    }
}

fn sequential_pass(input: &[f32], output: &mut [f32], params: &PassParams<'_>) -> usize {
    let mut clamps = 0;
    for y in 0..params.height {
        for x in 0..params.width {
            let offset = y * params.width + x;
            if !params.updates(offset) {
                output[offset] = input[offset];
                continue;
            }
            let center = f64::from(input[offset]);
            let mut flux = 0.0;
            for &(dx, dy, weight) in params.weights {
                if let Some(neighbor) = params.neighbor(x, y, dx, dy) {
                    flux += weight * (f64::from(input[neighbor]) - center);
                }
            }
            let next = center + params.diffusion * flux - params.decay * center;
            let (value, clamped) = clamp_non_negative(next as f32);
            output[offset] = value;
            clamps += usize::from(clamped);
        }
    }
    clamps
}

fn convolve_row(input: &[f32], row: &mut [f32], y: usize, params: &PassParams<'_>) -> usize {
    let mut clamps = 0;
    for (x, slot) in row.iter_mut().enumerate() {
        let offset = y * params.width + x;
        if !params.updates(offset) {
            *slot = input[offset];
            continue;
        }
        let center = f64::from(input[offset]);
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for &(dx, dy, weight) in params.weights {
            if let Some(neighbor) = params.neighbor(x, y, dx, dy) {
                weighted += weight * f64::from(input[neighbor]);
                weight_sum += weight;
            }
        }
        let next = center * (1.0 - params.decay) + params.diffusion * (weighted - weight_sum * center);
        let (value, clamped) = clamp_non_negative(next as f32);
        *slot = value;
        clamps += usize::from(clamped);
    }
    clamps
}

/// Outcome of a diffusion step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffusionReport {
    /// Writes clamped to zero.
    pub clamps: usize,
    /// Cells recomputed, summed over species.
    pub updated_cells: usize,
}

impl DiffusionReport {
    fn merge(&mut self, other: Self) {
        self.clamps += other.clamps;
        self.updated_cells += other.updated_cells;
    }
}

/// Double-buffered explicit integrator for `∂c/∂t = D∇²c − decay·c` under no-flux boundaries.
#[derive(Debug, Clone)]
pub struct DiffusionSolver {
    stencil: StencilKind,
    backend: DiffusionBackend,
    cell_size: f64,
    max_time_step: f64,
    /// `(diffusion_rate, decay_rate)` per species.
    rates: Vec<(f64, f64)>,
    scratch: Vec<f32>,
}

impl DiffusionSolver {
    /// Validate stability for every species at `max_time_step` and build the solver.
    pub fn new(config: &ChemistryConfig, species: &SpeciesRegistry) -> Result<Self, ChemistryError> {
        config.grid_dimensions()?;
        let cell_size = f64::from(config.cell_size);
        let dt = config.max_time_step;
        let mut rates = Vec::with_capacity(species.len());
        for entry in species.iter() {
            let number = entry.diffusion_number(dt, cell_size);
            if number > STABILITY_LIMIT {
                return Err(ChemistryError::InvalidConfiguration(format!(
                    "species {:?} is unstable: dt * D / h² = {number:.4} exceeds {STABILITY_LIMIT}",
                    entry.name
                )));
            }
            if dt * entry.decay_rate > 1.0 {
                return Err(ChemistryError::InvalidConfiguration(format!(
                    "species {:?} decays more than its mass per step (dt * decay = {:.4})",
                    entry.name,
                    dt * entry.decay_rate
                )));
            }
            rates.push((entry.diffusion_rate, entry.decay_rate));
        }
        Ok(Self {
            stencil: config.stencil,
            backend: config.backend,
            cell_size,
            max_time_step: dt,
            rates,
            scratch: Vec::new(),
        })
    }

    #[must_use]
    pub const fn stencil(&self) -> StencilKind {
        self.stencil
    }

    #[must_use]
    pub const fn backend(&self) -> DiffusionBackend {
        self.backend
    }

    /// Swap the execution backend; stability does not depend on it.
    pub fn set_backend(&mut self, backend: DiffusionBackend) {
        self.backend = backend;
    }

    #[must_use]
    pub const fn max_time_step(&self) -> f64 {
        self.max_time_step
    }

    /// Check a requested step against the validated range.
    pub fn check_time_step(&self, dt: f64) -> Result<(), ChemistryError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ChemistryError::InvalidTimeStep(dt));
        }
        if dt > self.max_time_step {
            return Err(ChemistryError::TimeStepTooLarge {
                requested: dt,
                max: self.max_time_step,
            });
        }
        Ok(())
    }

    /// Advance one species by `dt`.
    ///
    /// With a `mask`, only flagged cells are recomputed and edges to unflagged cells
    /// behave like the lattice boundary.
    pub fn step(
        &mut self,
        species: SpeciesId,
        grid: &mut ConcentrationGrid,
        dt: f64,
        mask: Option<&[bool]>,
    ) -> Result<DiffusionReport, ChemistryError> {
        self.check_time_step(dt)?;
        let &(diffusion_rate, decay_rate) = self
            .rates
            .get(species.index())
            .ok_or(ChemistryError::UnknownSpecies(species))?;
        let input = grid.field(species)?;
        if let Some(mask) = mask
            && mask.len() != input.len()
        {
            return Err(ChemistryError::FieldLength {
                expected: input.len(),
                actual: mask.len(),
            });
        }
        if dt == 0.0 || (diffusion_rate == 0.0 && decay_rate == 0.0) {
            return Ok(DiffusionReport::default());
        }

        let params = PassParams {
            width: grid.width() as usize,
            height: grid.height() as usize,
            weights: self.stencil.weights(),
            diffusion: dt * diffusion_rate / (self.cell_size * self.cell_size),
            decay: dt * decay_rate,
            mask,
        };
        self.scratch.clear();
        self.scratch.resize(input.len(), 0.0);
        let clamps = self.backend.apply(input, &mut self.scratch, &params);
        let updated_cells = mask.map_or(input.len(), |mask| mask.iter().filter(|f| **f).count());
        grid.swap_field(species.index(), &mut self.scratch);
        trace!(%species, clamps, updated_cells, "diffusion pass");
        Ok(DiffusionReport {
            clamps,
            updated_cells,
        })
    }

    /// Advance every registered species by `dt`.
    pub fn step_all(
        &mut self,
        grid: &mut ConcentrationGrid,
        dt: f64,
        mask: Option<&[bool]>,
    ) -> Result<DiffusionReport, ChemistryError> {
        let mut report = DiffusionReport::default();
        for idx in 0..self.rates.len() {
            let species = SpeciesId(idx as u16);
            report.merge(self.step(species, grid, dt, mask)?);
        }
        Ok(report)
    }
}
