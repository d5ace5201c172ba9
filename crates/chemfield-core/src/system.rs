//! Operator-split orchestration of diffusion and reactions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use rand::{Rng, SeedableRng, rngs::SmallRng};
use slotmap::SlotMap;
use tracing::{debug, info, trace, warn};

use crate::telemetry::ChannelObserver;
use crate::{
    ChemistryConfig, ChemistryError, ConcentrationGrid, DiffusionReport, DiffusionSolver,
    EngineState, GillespieEngine, GridSnapshot, NeighborCoupling, ReactionEvent,
    ReactionEventRecord, ReactionId, ReactionNetwork, ReactionSpec, SimulationClock,
    SpatialCellIndex, SpeciesId, SpeciesRegistry, SpeciesSpec, StepOutcome, SubscriberId, Tick,
    TickObserver,
};

/// Output of one orchestrator tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: Tick,
    /// System clock after the tick.
    pub time: f64,
    /// Time reached by the reaction engine; trails `time` when the event cap was hit.
    pub reaction_time: f64,
    pub completed: bool,
    pub events: Vec<ReactionEvent>,
    pub snapshot: Arc<GridSnapshot>,
    pub clamps: usize,
    pub diffusion: DiffusionReport,
}

impl TickReport {
    /// Versioned records for this tick's events.
    #[must_use]
    pub fn event_records(&self) -> Vec<ReactionEventRecord> {
        self.events
            .iter()
            .cloned()
            .map(|event| ReactionEventRecord::new(self.tick, event))
            .collect()
    }
}

/// Summary retained in the bounded tick history.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    pub time: f64,
    pub reaction_time: f64,
    pub events: usize,
    pub active_cells: usize,
    /// Indexed by species id.
    pub total_mass: Vec<f64>,
    pub clamps: usize,
    pub completed: bool,
}

/// Tracks consecutive ticks that clamped negative concentrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClampDiagnostics {
    /// Consecutive ticks with at least one clamp.
    pub streak: u32,
    pub total_clamps: u64,
    pub last_clamp_tick: Option<Tick>,
    warned: bool,
}

impl ClampDiagnostics {
    /// Record a tick's clamp count. Returns true when this tick triggered the streak warning.
    pub fn observe(&mut self, tick: Tick, clamps: usize, warn_after: u32) -> bool {
        if clamps == 0 {
            self.streak = 0;
            self.warned = false;
            return false;
        }
        self.streak += 1;
        self.total_clamps += clamps as u64;
        self.last_clamp_tick = Some(tick);
        if warn_after > 0 && self.streak >= warn_after && !self.warned {
            self.warned = true;
            return true;
        }
        false
    }

    /// Whether the current streak has already been reported.
    #[must_use]
    pub const fn warned(&self) -> bool {
        self.warned
    }
}

/// Registration stage of a chemical system.
pub struct ChemistryBuilder<R = SmallRng> {
    config: ChemistryConfig,
    species: SpeciesRegistry,
    reactions: Vec<ReactionSpec>,
    coupling: Option<Box<dyn NeighborCoupling>>,
    rng: Option<R>,
}

impl ChemistryBuilder {
    #[must_use]
    pub fn new(config: ChemistryConfig) -> Self {
        Self {
            config,
            species: SpeciesRegistry::new(),
            reactions: Vec::new(),
            coupling: None,
            rng: None,
        }
    }
}

impl<R: Rng + SeedableRng + Send> ChemistryBuilder<R> {
    /// Replace the generator the reaction engine splits its partition streams from.
    #[must_use]
    pub fn with_rng<S: Rng + SeedableRng + Send>(self, rng: S) -> ChemistryBuilder<S> {
        ChemistryBuilder {
            config: self.config,
            species: self.species,
            reactions: self.reactions,
            coupling: self.coupling,
            rng: Some(rng),
        }
    }

    /// Override the configured neighbour coupling.
    #[must_use]
    pub fn with_coupling(mut self, coupling: Box<dyn NeighborCoupling>) -> Self {
        self.coupling = Some(coupling);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ChemistryConfig {
        &self.config
    }

    pub fn register_species(&mut self, spec: SpeciesSpec) -> Result<SpeciesId, ChemistryError> {
        self.species.register(spec)
    }

    /// Register a reaction. Species references are resolved by [`build`](Self::build).
    pub fn register_reaction(&mut self, spec: ReactionSpec) -> Result<ReactionId, ChemistryError> {
        spec.validate_shape()?;
        let id = u32::try_from(self.reactions.len()).map_err(|_| {
            ChemistryError::InvalidConfiguration("too many reactions registered".to_string())
        })?;
        self.reactions.push(spec);
        Ok(ReactionId(id))
    }

    pub fn species_id(&self, name: &str) -> Result<SpeciesId, ChemistryError> {
        self.species
            .id_of(name)
            .ok_or_else(|| ChemistryError::UnknownSpeciesName(name.to_string()))
    }

    /// Validate everything and allocate grids, caches and the reaction engine.
    pub fn build(self) -> Result<ChemicalSystem<R>, ChemistryError> {
        let config = self.config;
        let (width, height) = config.grid_dimensions()?;
        let coupling = match self.coupling {
            Some(coupling) => coupling,
            None => config.coupling.build()?,
        };
        let network = ReactionNetwork::new(
            &self.reactions,
            &self.species,
            config.temperature,
            config.molecules_per_unit,
        )?;
        let solver = DiffusionSolver::new(&config, &self.species)?;
        let grid = ConcentrationGrid::new(width, height, config.cell_size, self.species.len())?;
        let cells = SpatialCellIndex::new(
            width,
            height,
            config.partition_size,
            self.species.len(),
            network.len(),
            config.activity_epsilon,
        )?;
        let rng = self.rng.unwrap_or_else(|| config.seeded_rng());
        let engine = GillespieEngine::new(rng, cells.tiles().len(), config.max_events_per_step);

        info!(
            width,
            height,
            species = self.species.len(),
            reactions = network.len(),
            partitions = engine.partition_count(),
            stencil = ?config.stencil,
            backend = ?config.backend,
            "chemical system allocated"
        );

        Ok(ChemicalSystem {
            history: VecDeque::with_capacity(config.history_capacity.min(1024)),
            config,
            species: self.species,
            network,
            coupling,
            grid,
            solver,
            cells,
            engine,
            clock: SimulationClock::default(),
            tick: Tick::zero(),
            event_log: VecDeque::new(),
            observers: SlotMap::with_key(),
            clamp_diagnostics: ClampDiagnostics::default(),
            pending_clamps: 0,
        })
    }
}

/// Allocated chemical system: owns the grid, the event log and both integrators.
pub struct ChemicalSystem<R = SmallRng> {
    config: ChemistryConfig,
    species: SpeciesRegistry,
    network: ReactionNetwork,
    coupling: Box<dyn NeighborCoupling>,
    grid: ConcentrationGrid,
    solver: DiffusionSolver,
    cells: SpatialCellIndex,
    engine: GillespieEngine<R>,
    clock: SimulationClock,
    tick: Tick,
    event_log: VecDeque<ReactionEvent>,
    history: VecDeque<TickSummary>,
    observers: SlotMap<SubscriberId, Box<dyn TickObserver>>,
    clamp_diagnostics: ClampDiagnostics,
    /// Clamps from deposits and loads since the last tick.
    pending_clamps: usize,
}

impl<R> std::fmt::Debug for ChemicalSystem<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChemicalSystem")
            .field("tick", &self.tick)
            .field("time", &self.clock.now())
            .field("species", &self.species.len())
            .field("reactions", &self.network.len())
            .field("subscribers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl<R: Rng + SeedableRng + Send> ChemicalSystem<R> {
    /// Drop the grids and return to the registration stage with the same catalog and config.
    ///
    /// The coupling carries over; the engine generator is reseeded from the config.
    #[must_use]
    pub fn reallocate(self) -> ChemistryBuilder<R> {
        ChemistryBuilder {
            reactions: self.network.specs(),
            species: self.species,
            coupling: Some(self.coupling),
            rng: None,
            config: self.config,
        }
    }

    /// Advance by `dt`: diffusion first, then reactions up to the new system time.
    pub fn simulate_tick(&mut self, dt: f64) -> Result<TickReport, ChemistryError> {
        self.solver.check_time_step(dt)?;
        if dt == 0.0 {
            return Ok(self.idle_report());
        }
        let tick = self.tick.next();

        self.cells.refresh(&self.grid)?;
        let diffusion = self
            .solver
            .step_all(&mut self.grid, dt, self.cells.update_mask())?;
        self.clock.advance(dt);

        let outcome = self.engine.run_until(
            self.clock.now(),
            &mut self.grid,
            &mut self.cells,
            &self.network,
            self.coupling.as_ref(),
        )?;
        self.tick = tick;
        let clamps = diffusion.clamps + outcome.clamps + std::mem::take(&mut self.pending_clamps);
        let report = self.finish_step(outcome, diffusion, clamps);

        debug!(
            tick = tick.0,
            time = report.time,
            reaction_time = report.reaction_time,
            events = report.events.len(),
            active_cells = self.cells.active_count(),
            diffused_cells = diffusion.updated_cells,
            clamps,
            "tick complete"
        );
        if !report.completed {
            warn!(
                tick = tick.0,
                time = report.time,
                reaction_time = report.reaction_time,
                max_events = self.config.max_events_per_step,
                "reaction window hit the event cap; backlog carries into the next tick"
            );
        }
        if self
            .clamp_diagnostics
            .observe(tick, clamps, self.config.clamp_warning_ticks)
        {
            warn!(
                tick = tick.0,
                streak = self.clamp_diagnostics.streak,
                total_clamps = self.clamp_diagnostics.total_clamps,
                "negative concentrations clamped on consecutive ticks"
            );
        }
        self.push_history(&report);
        self.notify(&report);
        Ok(report)
    }

    /// Run the reaction engine up to the system clock without diffusing.
    ///
    /// The returned report keeps the current tick number and is delivered to subscribers.
    pub fn resume_reactions(&mut self) -> Result<TickReport, ChemistryError> {
        if self.engine.time() >= self.clock.now() {
            return Ok(self.idle_report());
        }
        let outcome = self.engine.run_until(
            self.clock.now(),
            &mut self.grid,
            &mut self.cells,
            &self.network,
            self.coupling.as_ref(),
        )?;
        let clamps = outcome.clamps + std::mem::take(&mut self.pending_clamps);
        let report = self.finish_step(outcome, DiffusionReport::default(), clamps);
        trace!(
            tick = self.tick.0,
            events = report.events.len(),
            completed = report.completed,
            "reaction backlog resumed"
        );
        self.notify(&report);
        Ok(report)
    }

    fn finish_step(
        &mut self,
        outcome: StepOutcome,
        diffusion: DiffusionReport,
        clamps: usize,
    ) -> TickReport {
        let now = self.clock.now();
        self.record_events(&outcome.events, now);
        TickReport {
            tick: self.tick,
            time: now,
            reaction_time: outcome.time_reached,
            completed: outcome.completed,
            events: outcome.events,
            snapshot: Arc::new(self.snapshot()),
            clamps,
            diffusion,
        }
    }

    fn idle_report(&self) -> TickReport {
        TickReport {
            tick: self.tick,
            time: self.clock.now(),
            reaction_time: self.engine.time(),
            completed: self.engine.time() >= self.clock.now(),
            events: Vec::new(),
            snapshot: Arc::new(self.snapshot()),
            clamps: 0,
            diffusion: DiffusionReport::default(),
        }
    }
}

impl<R> ChemicalSystem<R> {
    #[must_use]
    pub fn config(&self) -> &ChemistryConfig {
        &self.config
    }

    #[must_use]
    pub fn species(&self) -> &SpeciesRegistry {
        &self.species
    }

    #[must_use]
    pub fn network(&self) -> &ReactionNetwork {
        &self.network
    }

    #[must_use]
    pub fn grid(&self) -> &ConcentrationGrid {
        &self.grid
    }

    #[must_use]
    pub fn cells(&self) -> &SpatialCellIndex {
        &self.cells
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// System clock, advanced by every tick.
    #[must_use]
    pub const fn time(&self) -> f64 {
        self.clock.now()
    }

    #[must_use]
    pub const fn engine_state(&self) -> EngineState {
        self.engine.state()
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<TickSummary> {
        &self.history
    }

    #[must_use]
    pub const fn clamp_diagnostics(&self) -> ClampDiagnostics {
        self.clamp_diagnostics
    }

    /// Retained events, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &ReactionEvent> {
        self.event_log.iter()
    }

    pub fn species_id(&self, name: &str) -> Result<SpeciesId, ChemistryError> {
        self.species
            .id_of(name)
            .ok_or_else(|| ChemistryError::UnknownSpeciesName(name.to_string()))
    }

    /// Add `amount` of `species` to the cell containing the world point. Out-of-bounds points are ignored.
    pub fn deposit(
        &mut self,
        species: SpeciesId,
        world_x: f32,
        world_y: f32,
        amount: f32,
    ) -> Result<(), ChemistryError> {
        self.species.get(species)?;
        if !amount.is_finite() {
            trace!(%species, amount, "ignoring non-finite deposit");
            return Ok(());
        }
        let Some((x, y)) = self.grid.world_to_cell(world_x, world_y) else {
            return Ok(());
        };
        if self.grid.add(species, x, y, amount)? {
            self.pending_clamps += 1;
        }
        Ok(())
    }

    /// Concentration at the world point, zero out of bounds.
    pub fn sample_concentration(
        &self,
        species: SpeciesId,
        world_x: f32,
        world_y: f32,
    ) -> Result<f32, ChemistryError> {
        self.species.get(species)?;
        Ok(self
            .grid
            .world_to_cell(world_x, world_y)
            .and_then(|(x, y)| self.grid.get(species, x, y))
            .unwrap_or(0.0))
    }

    /// Central-difference gradient in concentration per world unit; `(0, 0)` on or beyond the edge.
    pub fn sample_gradient(
        &self,
        species: SpeciesId,
        world_x: f32,
        world_y: f32,
    ) -> Result<(f32, f32), ChemistryError> {
        self.species.get(species)?;
        let Some((x, y)) = self.grid.world_to_cell(world_x, world_y) else {
            return Ok((0.0, 0.0));
        };
        let (width, height) = (self.grid.width(), self.grid.height());
        if x == 0 || y == 0 || x + 1 >= width || y + 1 >= height {
            return Ok((0.0, 0.0));
        }
        let at = |cx: u32, cy: u32| self.grid.get(species, cx, cy).unwrap_or(0.0);
        let span = 2.0 * self.grid.cell_size();
        Ok((
            (at(x + 1, y) - at(x - 1, y)) / span,
            (at(x, y + 1) - at(x, y - 1)) / span,
        ))
    }

    /// Overwrite a whole species field (row-major). Negative values are clamped.
    pub fn load_field(&mut self, species: SpeciesId, values: &[f32]) -> Result<(), ChemistryError> {
        self.pending_clamps += self.grid.load_field(species, values)?;
        Ok(())
    }

    pub fn total_mass(&self, species: SpeciesId) -> Result<f64, ChemistryError> {
        self.grid.total_mass(species)
    }

    /// Copy of the current grid.
    #[must_use]
    pub fn snapshot(&self) -> GridSnapshot {
        GridSnapshot::capture(&self.grid, self.tick, self.clock.now())
    }

    pub fn subscribe(&mut self, observer: Box<dyn TickObserver>) -> SubscriberId {
        self.observers.insert(observer)
    }

    /// Bounded channel of tick reports; batches are dropped while the channel is full.
    pub fn subscribe_channel(&mut self, capacity: usize) -> (SubscriberId, Receiver<TickReport>) {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let id = self.subscribe(Box::new(ChannelObserver::new(sender)));
        (id, receiver)
    }

    /// Remove an observer, returning it when it was still registered.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> Option<Box<dyn TickObserver>> {
        self.observers.remove(id)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.observers.len()
    }

    fn notify(&mut self, report: &TickReport) {
        for (_, observer) in &mut self.observers {
            observer.on_tick(report);
        }
        let before = self.observers.len();
        self.observers.retain(|_, observer| observer.is_connected());
        let pruned = before - self.observers.len();
        if pruned > 0 {
            debug!(pruned, "removed disconnected subscribers");
        }
    }

    fn record_events(&mut self, events: &[ReactionEvent], now: f64) {
        self.event_log.extend(events.iter().cloned());
        let capacity = self.config.event_log_capacity;
        while self.event_log.len() > capacity {
            self.event_log.pop_front();
        }
        let horizon = now - self.config.event_retention_time;
        while self
            .event_log
            .front()
            .is_some_and(|event| event.time < horizon)
        {
            self.event_log.pop_front();
        }
    }

    fn push_history(&mut self, report: &TickReport) {
        if self.config.history_capacity == 0 {
            return;
        }
        let total_mass = (0..self.species.len())
            .map(|idx| report.snapshot.total_mass(SpeciesId(idx as u16)))
            .collect();
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(TickSummary {
            tick: report.tick,
            time: report.time,
            reaction_time: report.reaction_time,
            events: report.events.len(),
            active_cells: self.cells.active_count(),
            total_mass,
            clamps: report.clamps,
            completed: report.completed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DiffusionBackend, StencilKind};

    fn small_config() -> ChemistryConfig {
        ChemistryConfig {
            grid_width: 10,
            grid_height: 10,
            rng_seed: Some(42),
            ..ChemistryConfig::default()
        }
    }

    #[test]
    fn builder_allocates_and_resolves_names() {
        let mut builder = ChemistryBuilder::new(small_config());
        let trail = builder
            .register_species(SpeciesSpec::new("trail", 0.15, 0.002))
            .expect("trail");
        assert_eq!(builder.species_id("trail").expect("id"), trail);
        let system = builder.build().expect("system");
        assert_eq!(system.species_id("trail").expect("id"), trail);
        assert!(matches!(
            system.species_id("missing"),
            Err(ChemistryError::UnknownSpeciesName(_))
        ));
        assert_eq!(system.grid().width(), 10);
        assert_eq!(system.tick(), Tick::zero());
        assert_eq!(system.engine_state(), EngineState::Idle);
    }

    #[test]
    fn build_rejects_reaction_with_unknown_species() {
        let mut builder = ChemistryBuilder::new(small_config());
        builder
            .register_reaction(ReactionSpec::new("ghost", 1.0).reactant(SpeciesId(0), 1))
            .expect("shape is fine");
        assert!(matches!(
            builder.build(),
            Err(ChemistryError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn clamp_diagnostics_warn_once_per_streak() {
        let mut diagnostics = ClampDiagnostics::default();
        assert!(!diagnostics.observe(Tick(1), 2, 3));
        assert!(!diagnostics.observe(Tick(2), 1, 3));
        assert!(diagnostics.observe(Tick(3), 1, 3));
        assert!(!diagnostics.observe(Tick(4), 5, 3));
        assert_eq!(diagnostics.streak, 4);
        assert_eq!(diagnostics.total_clamps, 9);
        assert!(!diagnostics.observe(Tick(5), 0, 3));
        assert_eq!(diagnostics.streak, 0);
        assert!(!diagnostics.warned());
        assert_eq!(diagnostics.last_clamp_tick, Some(Tick(4)));
    }

    #[test]
    fn history_is_bounded() {
        let config = ChemistryConfig {
            history_capacity: 3,
            stencil: StencilKind::EightNeighbor,
            backend: DiffusionBackend::Sequential,
            ..small_config()
        };
        let mut builder = ChemistryBuilder::new(config);
        let trail = builder
            .register_species(SpeciesSpec::new("trail", 0.1, 0.0))
            .expect("trail");
        let mut system = builder.build().expect("system");
        system.deposit(trail, 5.0, 5.0, 1.0).expect("deposit");
        for _ in 0..5 {
            system.simulate_tick(0.5).expect("tick");
        }
        let history = system.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.front().expect("oldest").tick, Tick(3));
        assert_eq!(history.back().expect("newest").tick, Tick(5));
        assert!((history.back().expect("newest").total_mass[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn event_log_respects_capacity_and_retention() {
        let config = ChemistryConfig {
            grid_width: 1,
            grid_height: 1,
            molecules_per_unit: 1.0,
            event_log_capacity: 10,
            event_retention_time: 0.5,
            ..small_config()
        };
        let mut builder = ChemistryBuilder::new(config);
        let a = builder
            .register_species(SpeciesSpec::new("a", 0.0, 0.0))
            .expect("a");
        builder
            .register_reaction(ReactionSpec::new("cycle", 50.0).reactant(a, 1).product(a, 1))
            .expect("cycle");
        let mut system = builder.build().expect("system");
        system.deposit(a, 0.5, 0.5, 1.0).expect("deposit");
        system.simulate_tick(1.0).expect("tick");
        let retained: Vec<_> = system.recent_events().collect();
        assert!(retained.len() <= 10);
        assert!(retained.iter().all(|event| event.time >= 0.5));
        assert!(retained.windows(2).all(|w| w[0].time <= w[1].time));
    }
}
