//! Exact stochastic simulation (Gillespie direct method) over spatial partitions.

use chemfield_index::{ActivityMask, Neighborhood, NeighborhoodIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::debug;

use crate::cells::CellTile;
use crate::{
    CellCoord, ChemistryError, ConcentrationGrid, NeighborCoupling, Participant, ReactionId,
    ReactionNetwork, SpatialCellIndex,
};

/// Phases of one reaction window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    #[default]
    Idle,
    ComputingPropensities,
    AwaitingNextEvent,
    Firing,
    StepComplete,
}

/// One fired reaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub reaction: ReactionId,
    pub time: f64,
    pub cell: CellCoord,
    pub reactants_consumed: SmallVec<[Participant; 4]>,
    pub products_produced: SmallVec<[Participant; 4]>,
    /// Propensity of the fired `(cell, reaction)` pair just before firing.
    pub propensity: f64,
}

/// Result of advancing the engine toward a target time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Fired events ordered by time, ties broken by partition.
    pub events: Vec<ReactionEvent>,
    pub target_time: f64,
    /// Earliest partition clock after the step; equals `target_time` when completed.
    pub time_reached: f64,
    /// False when a partition hit the per-step event cap.
    pub completed: bool,
    /// Concentration writes clamped to zero.
    pub clamps: usize,
}

struct PartitionStream<R> {
    rng: R,
    clock: f64,
}

#[derive(Default)]
struct PartitionOutcome {
    events: Vec<ReactionEvent>,
    clamps: usize,
    completed: bool,
}

struct StepContext<'a> {
    network: &'a ReactionNetwork,
    coupling: &'a dyn NeighborCoupling,
    /// Cell totals frozen at window start; read for neighbours outside the partition.
    frozen_totals: &'a [f32],
    lattice: &'a ActivityMask,
    epsilon: f32,
    max_events: usize,
    target: f64,
}

impl StepContext<'_> {
    fn coupling_factor(&self, tile: &CellTile, local: usize) -> f64 {
        if !self.coupling.depends_on_neighbors() {
            return self.coupling.factor(&[]);
        }
        let mut totals: SmallVec<[f32; 4]> = SmallVec::new();
        self.visit_neighbors(tile, local, &mut |offset, in_tile| {
            totals.push(match in_tile {
                Some(neighbor) => tile.cell_total(neighbor),
                None => self.frozen_totals[offset],
            });
        });
        self.coupling.factor(&totals)
    }

    /// Visit the 4-neighbours of a tile cell as `(global offset, tile-local index if inside)`.
    fn visit_neighbors(
        &self,
        tile: &CellTile,
        local: usize,
        visitor: &mut dyn FnMut(usize, Option<usize>),
    ) {
        let rect = tile.rect();
        let width = self.lattice.width() as usize;
        let (x, y) = rect.global_coords(local);
        self.lattice.neighbors_of(
            y as usize * width + x as usize,
            Neighborhood::VonNeumann,
            &mut |offset| {
                let (nx, ny) = ((offset % width) as u32, (offset / width) as u32);
                visitor(offset, rect.local_offset(nx, ny));
            },
        );
    }

    fn recompute(&self, tile: &mut CellTile, local: usize, time: f64) {
        let factor = self.coupling_factor(tile, local);
        tile.recompute(local, self.network, factor, self.epsilon, time);
    }

    /// Refresh the fired cell and, for neighbour-dependent couplings, its in-partition neighbours.
    fn recompute_after_firing(&self, tile: &mut CellTile, local: usize, time: f64) {
        self.recompute(tile, local, time);
        if !self.coupling.depends_on_neighbors() {
            return;
        }
        let mut neighbors: SmallVec<[usize; 4]> = SmallVec::new();
        self.visit_neighbors(tile, local, &mut |_, in_tile| neighbors.extend(in_tile));
        for neighbor in neighbors {
            self.recompute(tile, neighbor, time);
        }
    }
}

fn run_partition<R: Rng>(
    tile: &mut CellTile,
    stream: &mut PartitionStream<R>,
    ctx: &StepContext<'_>,
) -> PartitionOutcome {
    let mut outcome = PartitionOutcome::default();
    if stream.clock >= ctx.target {
        outcome.completed = true;
        return outcome;
    }
    for local in 0..tile.len() {
        ctx.recompute(tile, local, stream.clock);
    }

    let mut state = EngineState::ComputingPropensities;
    let mut lambda = 0.0;
    let mut tau = 0.0;
    loop {
        state = match state {
            EngineState::ComputingPropensities => {
                lambda = tile.total_propensity();
                if lambda > 0.0 {
                    EngineState::AwaitingNextEvent
                } else {
                    stream.clock = ctx.target;
                    EngineState::StepComplete
                }
            }
            EngineState::AwaitingNextEvent => {
                if outcome.events.len() >= ctx.max_events {
                    break;
                }
                // r1 in (0, 1].
                let r1 = 1.0 - stream.rng.random::<f64>();
                tau = -r1.ln() / lambda;
                if stream.clock + tau > ctx.target {
                    stream.clock = ctx.target;
                    EngineState::StepComplete
                } else {
                    EngineState::Firing
                }
            }
            EngineState::Firing => {
                let r2 = stream.rng.random::<f64>() * lambda;
                match tile.select(r2) {
                    Some((local, reaction)) => {
                        let propensity = tile.propensities(local)[reaction];
                        outcome.clamps += ctx.network.fire(reaction, tile.concentrations_mut(local));
                        stream.clock += tau;
                        let definition = ctx.network.definition_at(reaction);
                        outcome.events.push(ReactionEvent {
                            reaction: definition.id,
                            time: stream.clock,
                            cell: tile.cells()[local].position,
                            reactants_consumed: definition.reactants.clone(),
                            products_produced: definition.products.clone(),
                            propensity,
                        });
                        ctx.recompute_after_firing(tile, local, stream.clock);
                        EngineState::ComputingPropensities
                    }
                    None => {
                        stream.clock = ctx.target;
                        EngineState::StepComplete
                    }
                }
            }
            EngineState::StepComplete => {
                outcome.completed = true;
                break;
            }
            EngineState::Idle => EngineState::ComputingPropensities,
        };
    }
    outcome
}

/// Gillespie engine with one PRNG stream and clock per spatial partition.
pub struct GillespieEngine<R = SmallRng> {
    streams: Vec<PartitionStream<R>>,
    state: EngineState,
    max_events_per_step: usize,
}

impl<R> std::fmt::Debug for GillespieEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GillespieEngine")
            .field("partitions", &self.streams.len())
            .field("state", &self.state)
            .field("max_events_per_step", &self.max_events_per_step)
            .finish()
    }
}

impl<R> GillespieEngine<R> {
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub const fn max_events_per_step(&self) -> usize {
        self.max_events_per_step
    }

    /// Reaction time reached by every partition.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.streams
            .iter()
            .map(|stream| stream.clock)
            .fold(f64::INFINITY, f64::min)
    }
}

impl<R: Rng + SeedableRng + Send> GillespieEngine<R> {
    /// Split `rng` into `partitions` independent streams, all starting at time zero.
    pub fn new(mut rng: R, partitions: usize, max_events_per_step: usize) -> Self {
        let streams = (0..partitions.max(1))
            .map(|_| PartitionStream {
                rng: R::from_rng(&mut rng),
                clock: 0.0,
            })
            .collect();
        Self {
            streams,
            state: EngineState::Idle,
            max_events_per_step: max_events_per_step.max(1),
        }
    }

    /// Advance the reaction window by `dt` from the engine's current time.
    pub fn simulate_step(
        &mut self,
        dt: f64,
        grid: &mut ConcentrationGrid,
        cells: &mut SpatialCellIndex,
        network: &ReactionNetwork,
        coupling: &dyn NeighborCoupling,
    ) -> Result<StepOutcome, ChemistryError> {
        if !dt.is_finite() || dt < 0.0 {
            return Err(ChemistryError::InvalidTimeStep(dt));
        }
        let target = self.time() + dt;
        self.run_until(target, grid, cells, network, coupling)
    }

    /// Fire events in every partition until its clock reaches `target` or the event cap is hit.
    pub fn run_until(
        &mut self,
        target: f64,
        grid: &mut ConcentrationGrid,
        cells: &mut SpatialCellIndex,
        network: &ReactionNetwork,
        coupling: &dyn NeighborCoupling,
    ) -> Result<StepOutcome, ChemistryError> {
        if !target.is_finite() {
            return Err(ChemistryError::InvalidTimeStep(target));
        }
        if cells.tiles().len() != self.streams.len() {
            return Err(ChemistryError::InvalidConfiguration(format!(
                "engine has {} partitions but the cell index has {} tiles",
                self.streams.len(),
                cells.tiles().len()
            )));
        }
        cells.refresh(grid)?;
        let epsilon = cells.epsilon();
        let (tiles, frozen_totals, lattice) = cells.tiles_and_totals();
        let ctx = StepContext {
            network,
            coupling,
            frozen_totals,
            lattice,
            epsilon,
            max_events: self.max_events_per_step,
            target,
        };
        let outcomes: Vec<PartitionOutcome> = tiles
            .par_iter_mut()
            .zip(self.streams.par_iter_mut())
            .map(|(tile, stream)| run_partition(tile, stream, &ctx))
            .collect();

        let mut clamps = 0;
        for tile in cells.tiles() {
            clamps += tile.store(grid);
        }
        let mut completed = true;
        let mut events = Vec::with_capacity(outcomes.iter().map(|o| o.events.len()).sum());
        for outcome in outcomes {
            clamps += outcome.clamps;
            completed &= outcome.completed;
            events.extend(outcome.events);
        }
        // Stable sort keeps partition order for equal times.
        events.sort_by_key(|event| OrderedFloat(event.time));

        self.state = if completed {
            EngineState::StepComplete
        } else {
            EngineState::AwaitingNextEvent
        };
        let time_reached = self.time();
        if !completed {
            debug!(
                target_time = target,
                time_reached,
                fired = events.len(),
                "reaction window stopped at the event cap"
            );
        }
        Ok(StepOutcome {
            events,
            target_time: target,
            time_reached,
            completed,
            clamps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActivityCoupling, ReactionSpec, SpeciesId, SpeciesRegistry, SpeciesSpec, Uncoupled};

    struct Fixture {
        grid: ConcentrationGrid,
        cells: SpatialCellIndex,
        network: ReactionNetwork,
    }

    fn single_cell_decay(count: f32) -> Fixture {
        let mut species = SpeciesRegistry::new();
        species
            .register(SpeciesSpec::new("a", 0.0, 0.0))
            .expect("a");
        let decay = ReactionSpec::new("decay", 1.0).reactant(SpeciesId(0), 1);
        let network = ReactionNetwork::new(&[decay], &species, None, 1.0).expect("network");
        let mut grid = ConcentrationGrid::new(1, 1, 1.0, 1).expect("grid");
        grid.set(SpeciesId(0), 0, 0, count).expect("set");
        let cells = SpatialCellIndex::new(1, 1, None, 1, 1, 1e-6).expect("cells");
        Fixture {
            grid,
            cells,
            network,
        }
    }

    #[test]
    fn decay_run_is_reproducible_and_consistent() {
        let mut results = Vec::new();
        for _ in 0..2 {
            let mut fx = single_cell_decay(100.0);
            let mut engine = GillespieEngine::new(SmallRng::seed_from_u64(42), 1, 10_000);
            let outcome = engine
                .simulate_step(5.0, &mut fx.grid, &mut fx.cells, &fx.network, &Uncoupled)
                .expect("step");
            assert!(outcome.completed);
            assert_eq!(outcome.time_reached, 5.0);
            assert_eq!(engine.state(), EngineState::StepComplete);
            let remaining = fx.grid.get(SpeciesId(0), 0, 0).expect("cell");
            assert_eq!(remaining + outcome.events.len() as f32, 100.0);
            assert!(outcome.events.windows(2).all(|w| w[0].time <= w[1].time));
            results.push((remaining, outcome.events));
        }
        assert_eq!(results[0], results[1]);
    }

    #[test]
    fn zero_propensity_jumps_to_window_end() {
        let mut fx = single_cell_decay(0.0);
        let mut engine: GillespieEngine = GillespieEngine::new(SmallRng::seed_from_u64(1), 1, 10);
        let outcome = engine
            .simulate_step(2.5, &mut fx.grid, &mut fx.cells, &fx.network, &Uncoupled)
            .expect("step");
        assert!(outcome.events.is_empty());
        assert!(outcome.completed);
        assert_eq!(engine.time(), 2.5);
    }

    #[test]
    fn event_cap_returns_partial_progress_then_resumes() {
        let mut fx = single_cell_decay(100.0);
        let mut engine = GillespieEngine::new(SmallRng::seed_from_u64(9), 1, 5);
        let first = engine
            .run_until(50.0, &mut fx.grid, &mut fx.cells, &fx.network, &Uncoupled)
            .expect("step");
        assert!(!first.completed);
        assert_eq!(first.events.len(), 5);
        assert_eq!(first.time_reached, first.events[4].time);
        assert!(first.time_reached < 50.0);
        assert_eq!(engine.state(), EngineState::AwaitingNextEvent);

        let mut fired = first.events.len();
        let mut last_time = first.time_reached;
        for _ in 0..100 {
            let next = engine
                .run_until(50.0, &mut fx.grid, &mut fx.cells, &fx.network, &Uncoupled)
                .expect("resume");
            fired += next.events.len();
            if let Some(event) = next.events.first() {
                assert!(event.time >= last_time);
            }
            last_time = next.time_reached;
            if next.completed {
                break;
            }
        }
        assert_eq!(engine.time(), 50.0);
        assert_eq!(fx.grid.get(SpeciesId(0), 0, 0), Some(100.0 - fired as f32));
    }

    #[test]
    fn partitions_are_independent_streams() {
        let mut species = SpeciesRegistry::new();
        species
            .register(SpeciesSpec::new("a", 0.0, 0.0))
            .expect("a");
        let decay = ReactionSpec::new("decay", 0.5).reactant(SpeciesId(0), 1);
        let network = ReactionNetwork::new(&[decay], &species, None, 1.0).expect("network");
        let run = || {
            let mut grid = ConcentrationGrid::new(8, 8, 1.0, 1).expect("grid");
            grid.fill(SpeciesId(0), 3.0).expect("fill");
            let mut cells = SpatialCellIndex::new(8, 8, Some(4), 1, 1, 1e-6).expect("cells");
            let mut engine = GillespieEngine::new(SmallRng::seed_from_u64(5), 4, 10_000);
            let outcome = engine
                .simulate_step(1.0, &mut grid, &mut cells, &network, &Uncoupled)
                .expect("step");
            (grid.field(SpeciesId(0)).expect("field").to_vec(), outcome)
        };
        let (field_a, outcome_a) = run();
        let (field_b, outcome_b) = run();
        assert_eq!(field_a, field_b);
        assert_eq!(outcome_a.events, outcome_b.events);
        assert!(outcome_a.events.windows(2).all(|w| w[0].time <= w[1].time));
        let remaining: f32 = field_a.iter().sum();
        assert_eq!(remaining + outcome_a.events.len() as f32, 192.0);
    }

    #[test]
    fn coupling_reads_frozen_totals_across_partitions() {
        let mut species = SpeciesRegistry::new();
        species
            .register(SpeciesSpec::new("s", 0.0, 0.0))
            .expect("s");
        let catalytic = ReactionSpec::new("catalytic", 1.0)
            .reactant(SpeciesId(0), 1)
            .product(SpeciesId(0), 1);
        let network = ReactionNetwork::new(&[catalytic], &species, None, 1.0).expect("network");
        let mut grid = ConcentrationGrid::new(2, 1, 1.0, 1).expect("grid");
        grid.set(SpeciesId(0), 0, 0, 3.0).expect("set");
        grid.set(SpeciesId(0), 1, 0, 1.0).expect("set");
        let mut cells = SpatialCellIndex::new(2, 1, Some(1), 1, 1, 1e-6).expect("cells");
        let coupling = ActivityCoupling {
            strength: 1.0,
            half_saturation: 1.0,
        };
        let mut engine = GillespieEngine::new(SmallRng::seed_from_u64(3), 2, 10_000);
        engine
            .simulate_step(0.5, &mut grid, &mut cells, &network, &coupling)
            .expect("step");
        let left = cells.propensities(CellCoord::new(0, 0)).expect("left")[0];
        let right = cells.propensities(CellCoord::new(1, 0)).expect("right")[0];
        assert!((left - 4.5).abs() < 1e-12, "{left}");
        assert!((right - 1.75).abs() < 1e-12, "{right}");
    }

    #[test]
    fn mismatched_partition_count_is_rejected() {
        let mut fx = single_cell_decay(1.0);
        let mut engine = GillespieEngine::new(SmallRng::seed_from_u64(0), 3, 10);
        assert!(matches!(
            engine.simulate_step(1.0, &mut fx.grid, &mut fx.cells, &fx.network, &Uncoupled),
            Err(ChemistryError::InvalidConfiguration(_))
        ));
    }
}
