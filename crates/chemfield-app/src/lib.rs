//! Scenario files, presets and the tick loop behind the `chemfield` binary.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chemfield_core::{
    ChemicalSystem, ChemistryBuilder, ChemistryConfig, JsonLinesObserver, ReactionSpec, SpeciesSpec,
};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    /// 10x10 lattice, one trail deposit at the centre.
    Trail,
    /// Single cell with 100 molecules decaying at rate 1.
    Decay,
    /// Two-species colony: trail deposits convert into a slower alarm signal.
    Colony,
}

/// Reaction entry whose participants are given by species name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub name: String,
    #[serde(default)]
    pub reactants: Vec<(String, u32)>,
    #[serde(default)]
    pub products: Vec<(String, u32)>,
    pub rate_constant: f64,
    #[serde(default)]
    pub activation_energy: f64,
    #[serde(default = "default_reference_temperature")]
    pub reference_temperature: f64,
}

fn default_reference_temperature() -> f64 {
    298.15
}

/// Initial mass placed at a world position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub species: String,
    pub x: f32,
    pub y: f32,
    pub amount: f32,
}

/// Complete description of a run, loadable from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub chemistry: ChemistryConfig,
    pub species: Vec<SpeciesSpec>,
    #[serde(default)]
    pub reactions: Vec<ReactionEntry>,
    #[serde(default)]
    pub deposits: Vec<Deposit>,
}

impl Scenario {
    #[must_use]
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Trail => Self {
                chemistry: ChemistryConfig {
                    grid_width: 10,
                    grid_height: 10,
                    rng_seed: Some(42),
                    ..ChemistryConfig::default()
                },
                species: vec![SpeciesSpec::new("trail", 0.15, 0.002)],
                reactions: Vec::new(),
                deposits: vec![Deposit {
                    species: "trail".into(),
                    x: 5.5,
                    y: 5.5,
                    amount: 10.0,
                }],
            },
            Preset::Decay => Self {
                chemistry: ChemistryConfig {
                    grid_width: 1,
                    grid_height: 1,
                    molecules_per_unit: 1.0,
                    rng_seed: Some(42),
                    ..ChemistryConfig::default()
                },
                species: vec![SpeciesSpec::new("a", 0.0, 0.0)],
                reactions: vec![ReactionEntry {
                    name: "a-decay".into(),
                    reactants: vec![("a".into(), 1)],
                    products: Vec::new(),
                    rate_constant: 1.0,
                    activation_energy: 0.0,
                    reference_temperature: default_reference_temperature(),
                }],
                deposits: vec![Deposit {
                    species: "a".into(),
                    x: 0.5,
                    y: 0.5,
                    amount: 100.0,
                }],
            },
            Preset::Colony => Self {
                chemistry: ChemistryConfig {
                    grid_width: 64,
                    grid_height: 64,
                    max_time_step: 0.5,
                    partition_size: Some(16),
                    rng_seed: Some(7),
                    ..ChemistryConfig::default()
                },
                species: vec![
                    SpeciesSpec::new("trail", 0.2, 0.01),
                    SpeciesSpec::new("alarm", 0.05, 0.05).with_volatility(0.4),
                ],
                reactions: vec![ReactionEntry {
                    name: "alarm-release".into(),
                    reactants: vec![("trail".into(), 2)],
                    products: vec![("alarm".into(), 1)],
                    rate_constant: 1e-4,
                    activation_energy: 0.0,
                    reference_temperature: default_reference_temperature(),
                }],
                deposits: (0..8)
                    .map(|i| Deposit {
                        species: "trail".into(),
                        x: 8.0 + 6.0 * i as f32,
                        y: 32.0,
                        amount: 5.0,
                    })
                    .collect(),
            },
        }
    }

    /// Read a scenario from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open scenario {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    /// Register everything, allocate the system and apply the initial deposits.
    pub fn build(&self) -> Result<ChemicalSystem> {
        let mut builder = ChemistryBuilder::new(self.chemistry.clone());
        for species in &self.species {
            builder
                .register_species(species.clone())
                .with_context(|| format!("registering species {:?}", species.name))?;
        }
        for entry in &self.reactions {
            let mut spec = ReactionSpec::new(entry.name.clone(), entry.rate_constant)
                .with_activation_energy(entry.activation_energy, entry.reference_temperature);
            for (name, stoichiometry) in &entry.reactants {
                spec = spec.reactant(builder.species_id(name)?, *stoichiometry);
            }
            for (name, stoichiometry) in &entry.products {
                spec = spec.product(builder.species_id(name)?, *stoichiometry);
            }
            builder
                .register_reaction(spec)
                .with_context(|| format!("registering reaction {:?}", entry.name))?;
        }
        let mut system = builder.build().context("allocating chemical system")?;
        for deposit in &self.deposits {
            let species = system.species_id(&deposit.species)?;
            system.deposit(species, deposit.x, deposit.y, deposit.amount)?;
        }
        Ok(system)
    }
}

/// Knobs for one CLI run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub ticks: u64,
    /// Defaults to the scenario's `max_time_step`.
    pub dt: Option<f64>,
    /// Overrides the scenario seed.
    pub seed: Option<u64>,
    /// JSON-lines file receiving every reaction event.
    pub events_path: Option<PathBuf>,
    /// Log a summary every N ticks; 0 logs only the final one.
    pub summary_every: u64,
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub time: f64,
    pub reaction_time: f64,
    pub events: usize,
    pub clamps: usize,
    /// `(species name, total mass)` in registration order.
    pub mass: Vec<(String, f64)>,
}

/// Drive a scenario for `options.ticks` ticks.
pub fn run(mut scenario: Scenario, options: &RunOptions) -> Result<RunSummary> {
    if options.seed.is_some() {
        scenario.chemistry.rng_seed = options.seed;
    }
    let dt = options.dt.unwrap_or(scenario.chemistry.max_time_step);
    if !(dt.is_finite() && dt > 0.0) {
        bail!("dt must be positive, got {dt}");
    }
    let mut system = scenario.build()?;
    if let Some(path) = &options.events_path {
        let file = File::create(path)
            .with_context(|| format!("failed to create event log {}", path.display()))?;
        system.subscribe(Box::new(JsonLinesObserver::new(BufWriter::new(file))));
    }

    let mut events = 0;
    let mut clamps = 0;
    let mut reaction_time = system.time();
    for _ in 0..options.ticks {
        let report = system.simulate_tick(dt)?;
        events += report.events.len();
        clamps += report.clamps;
        reaction_time = report.reaction_time;
        if options.summary_every > 0 && report.tick.0.is_multiple_of(options.summary_every) {
            info!(
                tick = report.tick.0,
                time = report.time,
                events = report.events.len(),
                active_cells = system.cells().active_count(),
                "progress"
            );
        }
    }

    let mass = system
        .species()
        .iter()
        .map(|species| {
            let total = system.total_mass(species.id)?;
            Ok((species.name.clone(), total))
        })
        .collect::<Result<Vec<_>>>()?;
    let summary = RunSummary {
        ticks: system.tick().0,
        time: system.time(),
        reaction_time,
        events,
        clamps,
        mass,
    };
    info!(
        ticks = summary.ticks,
        time = summary.time,
        events = summary.events,
        clamps = summary.clamps,
        "run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_build() {
        for preset in [Preset::Trail, Preset::Decay, Preset::Colony] {
            let scenario = Scenario::preset(preset);
            let system = scenario.build().expect("preset builds");
            assert_eq!(system.species().len(), scenario.species.len());
        }
    }

    #[test]
    fn unknown_species_in_reaction_fails() {
        let mut scenario = Scenario::preset(Preset::Decay);
        scenario.reactions[0].reactants = vec![("missing".into(), 1)];
        assert!(scenario.build().is_err());
    }

    #[test]
    fn decay_preset_is_reproducible() {
        let options = RunOptions {
            ticks: 5,
            ..RunOptions::default()
        };
        let first = run(Scenario::preset(Preset::Decay), &options).expect("run");
        let second = run(Scenario::preset(Preset::Decay), &options).expect("run");
        assert_eq!(first, second);
        assert_eq!(first.ticks, 5);
        assert!((first.mass[0].1 + first.events as f64 - 100.0).abs() < 1e-9);
    }
}
