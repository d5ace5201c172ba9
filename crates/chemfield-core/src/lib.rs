//! Core types shared across the chemfield workspace.
//!
//! A [`ChemicalSystem`] couples an explicit diffusion-decay stencil with an exact
//! Gillespie reaction engine over a shared 2D concentration lattice.

pub mod cells;
pub mod diffusion;
pub mod gillespie;
pub mod grid;
pub mod reaction;
pub mod species;
pub mod system;
pub mod telemetry;

use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cells::{CellTile, SpatialCell, SpatialCellIndex};
pub use chemfield_index::IndexError;
pub use diffusion::{DiffusionBackend, DiffusionReport, DiffusionSolver, StencilKind};
pub use gillespie::{EngineState, GillespieEngine, ReactionEvent, StepOutcome};
pub use grid::{ConcentrationGrid, GridSnapshot};
pub use reaction::{
    ActivityCoupling, CouplingConfig, GAS_CONSTANT, NeighborCoupling, Participant, ReactionDefinition,
    ReactionId, ReactionNetwork, ReactionSpec, Uncoupled, effective_count,
};
pub use species::{ChemicalSpecies, SpeciesId, SpeciesRegistry, SpeciesSpec};
pub use system::{ChemicalSystem, ChemistryBuilder, ClampDiagnostics, TickReport, TickSummary};
pub use telemetry::{
    EVENT_RECORD_VERSION, JsonLinesObserver, NullObserver, ReactionEventRecord, RecordError,
    SubscriberId, TickObserver,
};

/// Errors raised while configuring or advancing a chemical system.
#[derive(Debug, Error)]
pub enum ChemistryError {
    /// The species id was never registered.
    #[error("unknown species {0}")]
    UnknownSpecies(SpeciesId),
    /// No species is registered under this name.
    #[error("unknown species name {0:?}")]
    UnknownSpeciesName(String),
    /// The reaction id was never registered.
    #[error("unknown reaction {0}")]
    UnknownReaction(ReactionId),
    #[error("species {0:?} is already registered")]
    DuplicateSpecies(String),
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("time step must be finite and non-negative, got {0}")]
    InvalidTimeStep(f64),
    #[error("time step {requested} exceeds the configured maximum {max}")]
    TimeStepTooLarge { requested: f64, max: f64 },
    #[error("field has {actual} values but the grid has {expected} cells")]
    FieldLength { expected: usize, actual: usize },
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Orchestrator tick counter.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the zero tick.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Monotonic simulated time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SimulationClock {
    time: f64,
}

impl SimulationClock {
    #[must_use]
    pub const fn new(time: f64) -> Self {
        Self { time }
    }

    #[must_use]
    pub const fn now(&self) -> f64 {
        self.time
    }

    /// Advance by a non-negative increment.
    pub fn advance(&mut self, dt: f64) {
        debug_assert!(dt >= 0.0);
        self.time += dt.max(0.0);
    }

    /// Move to `time` if it lies ahead of the current reading.
    pub fn advance_to(&mut self, time: f64) {
        if time > self.time {
            self.time = time;
        }
    }
}

/// Integer lattice coordinate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    pub x: u32,
    pub y: u32,
}

impl CellCoord {
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Static configuration for a chemical system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChemistryConfig {
    /// Lattice width in cells.
    pub grid_width: u32,
    /// Lattice height in cells.
    pub grid_height: u32,
    /// Edge length of one cell in world units.
    pub cell_size: f32,
    /// Largest tick accepted; diffusion stability is validated against it.
    pub max_time_step: f64,
    pub stencil: StencilKind,
    pub backend: DiffusionBackend,
    /// Cells whose summed concentration falls below this are inactive. Zero disables pruning.
    pub activity_epsilon: f32,
    /// Discrete molecules represented by one unit of concentration.
    pub molecules_per_unit: f64,
    /// Ambient temperature in kelvin; `None` uses each reaction's reference temperature.
    pub temperature: Option<f64>,
    pub coupling: CouplingConfig,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Reaction events fired per partition before a step returns early.
    pub max_events_per_step: usize,
    /// Edge length of a reaction partition in cells; `None` runs one partition.
    pub partition_size: Option<u32>,
    pub event_log_capacity: usize,
    /// Events older than this much simulated time are dropped from the log.
    pub event_retention_time: f64,
    /// Consecutive clamping ticks before a warning is logged; 0 disables the warning.
    pub clamp_warning_ticks: u32,
    /// Number of tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for ChemistryConfig {
    fn default() -> Self {
        Self {
            grid_width: 128,
            grid_height: 128,
            cell_size: 1.0,
            max_time_step: 1.0,
            stencil: StencilKind::default(),
            backend: DiffusionBackend::default(),
            activity_epsilon: 1e-6,
            molecules_per_unit: 100.0,
            temperature: None,
            coupling: CouplingConfig::default(),
            rng_seed: None,
            max_events_per_step: 100_000,
            partition_size: None,
            event_log_capacity: 4096,
            event_retention_time: 100.0,
            clamp_warning_ticks: 8,
            history_capacity: 256,
        }
    }
}

impl ChemistryConfig {
    /// Validate scalar settings and return the lattice dimensions.
    pub(crate) fn grid_dimensions(&self) -> Result<(u32, u32), ChemistryError> {
        let invalid = |message: &str| Err(ChemistryError::InvalidConfiguration(message.to_string()));
        if self.grid_width == 0 || self.grid_height == 0 {
            return invalid("grid dimensions must be non-zero");
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return invalid("cell_size must be positive");
        }
        if !(self.max_time_step.is_finite() && self.max_time_step > 0.0) {
            return invalid("max_time_step must be positive");
        }
        if !(self.activity_epsilon.is_finite() && self.activity_epsilon >= 0.0) {
            return invalid("activity_epsilon must be finite and non-negative");
        }
        if !(self.molecules_per_unit.is_finite() && self.molecules_per_unit > 0.0) {
            return invalid("molecules_per_unit must be positive");
        }
        if let Some(temperature) = self.temperature
            && !(temperature.is_finite() && temperature > 0.0)
        {
            return invalid("temperature must be positive kelvin");
        }
        if self.max_events_per_step == 0 {
            return invalid("max_events_per_step must be non-zero");
        }
        if self.partition_size == Some(0) {
            return invalid("partition_size must be non-zero");
        }
        if !(self.event_retention_time.is_finite() && self.event_retention_time >= 0.0) {
            return invalid("event_retention_time must be finite and non-negative");
        }
        Ok((self.grid_width, self.grid_height))
    }

    /// Returns a generator seeded from `rng_seed`, or from OS entropy when unset.
    #[must_use]
    pub fn seeded_rng<R: SeedableRng>(&self) -> R {
        match self.rng_seed {
            Some(seed) => R::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                R::seed_from_u64(seed)
            }
        }
    }
}
