//! Reaction catalog, propensity evaluation and neighbour coupling.

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ChemistryError, SpeciesId, SpeciesRegistry};

/// Molar gas constant in J/(mol·K).
pub const GAS_CONSTANT: f64 = 8.314_462_618;

/// Tolerance added before flooring so stored integer counts survive rounding.
const COUNT_TOLERANCE: f64 = 1e-3;

/// Relative slack covering `f32` storage of large counts.
const STORAGE_SLACK: f64 = 8.0 * f32::EPSILON as f64;

/// Dense index of a registered reaction.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ReactionId(pub u32);

impl ReactionId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ReactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reaction#{}", self.0)
    }
}

/// Scale a concentration into a discrete molecule count.
#[inline]
#[must_use]
pub fn effective_count(concentration: f64, molecules_per_unit: f64) -> f64 {
    let molecules = concentration * molecules_per_unit;
    (molecules + COUNT_TOLERANCE.max(molecules.abs() * STORAGE_SLACK))
        .floor()
        .max(0.0)
}

/// One side entry of a reaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub species: SpeciesId,
    pub stoichiometry: u32,
}

/// Registration payload for a reaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionSpec {
    pub name: String,
    pub reactants: Vec<Participant>,
    pub products: Vec<Participant>,
    pub rate_constant: f64,
    /// Activation energy in J/mol.
    pub activation_energy: f64,
    /// Kelvin.
    pub reference_temperature: f64,
}

impl ReactionSpec {
    /// Reaction without participants, zero activation energy and a 298.15 K reference.
    #[must_use]
    pub fn new(name: impl Into<String>, rate_constant: f64) -> Self {
        Self {
            name: name.into(),
            reactants: Vec::new(),
            products: Vec::new(),
            rate_constant,
            activation_energy: 0.0,
            reference_temperature: 298.15,
        }
    }

    #[must_use]
    pub fn reactant(mut self, species: SpeciesId, stoichiometry: u32) -> Self {
        self.reactants.push(Participant {
            species,
            stoichiometry,
        });
        self
    }

    #[must_use]
    pub fn product(mut self, species: SpeciesId, stoichiometry: u32) -> Self {
        self.products.push(Participant {
            species,
            stoichiometry,
        });
        self
    }

    #[must_use]
    pub fn with_activation_energy(mut self, activation_energy: f64, reference_temperature: f64) -> Self {
        self.activation_energy = activation_energy;
        self.reference_temperature = reference_temperature;
        self
    }

    /// Checks that do not depend on the species catalog.
    pub(crate) fn validate_shape(&self) -> Result<(), ChemistryError> {
        let invalid = |detail: &str| {
            Err(ChemistryError::InvalidConfiguration(format!(
                "reaction {:?}: {detail}",
                self.name
            )))
        };
        if !(self.rate_constant.is_finite() && self.rate_constant >= 0.0) {
            return invalid("rate constant must be finite and non-negative");
        }
        if !(self.activation_energy.is_finite() && self.activation_energy >= 0.0) {
            return invalid("activation energy must be finite and non-negative");
        }
        if !(self.reference_temperature.is_finite() && self.reference_temperature > 0.0) {
            return invalid("reference temperature must be positive kelvin");
        }
        for side in [&self.reactants, &self.products] {
            for (idx, participant) in side.iter().enumerate() {
                if participant.stoichiometry == 0 {
                    return invalid("stoichiometry must be at least 1");
                }
                if side[..idx]
                    .iter()
                    .any(|other| other.species == participant.species)
                {
                    return invalid("a species may appear once per side");
                }
            }
        }
        Ok(())
    }
}

/// Immutable reaction resolved against the species catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionDefinition {
    pub id: ReactionId,
    pub name: String,
    pub reactants: SmallVec<[Participant; 4]>,
    pub products: SmallVec<[Participant; 4]>,
    pub rate_constant: f64,
    pub activation_energy: f64,
    pub reference_temperature: f64,
}

impl ReactionDefinition {
    /// Arrhenius factor `exp(-Ea / (R T))`.
    #[must_use]
    pub fn arrhenius(&self, temperature: f64) -> f64 {
        if self.activation_energy == 0.0 {
            return 1.0;
        }
        (-self.activation_energy / (GAS_CONSTANT * temperature)).exp()
    }
}

/// Frozen catalog of reactions with precomputed kinetic rates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionNetwork {
    reactions: Vec<ReactionDefinition>,
    kinetic_rates: Vec<f64>,
    molecules_per_unit: f64,
}

impl ReactionNetwork {
    /// Resolve reaction payloads against `species`.
    ///
    /// `temperature` overrides every reaction's reference temperature when set.
    pub fn new(
        specs: &[ReactionSpec],
        species: &SpeciesRegistry,
        temperature: Option<f64>,
        molecules_per_unit: f64,
    ) -> Result<Self, ChemistryError> {
        if !(molecules_per_unit.is_finite() && molecules_per_unit > 0.0) {
            return Err(ChemistryError::InvalidConfiguration(
                "molecules_per_unit must be positive".to_string(),
            ));
        }
        let mut reactions = Vec::with_capacity(specs.len());
        let mut kinetic_rates = Vec::with_capacity(specs.len());
        for (idx, spec) in specs.iter().enumerate() {
            spec.validate_shape()?;
            for participant in spec.reactants.iter().chain(&spec.products) {
                if !species.contains(participant.species) {
                    return Err(ChemistryError::InvalidConfiguration(format!(
                        "reaction {:?} references unregistered {}",
                        spec.name, participant.species
                    )));
                }
            }
            let id = u32::try_from(idx).map(ReactionId).map_err(|_| {
                ChemistryError::InvalidConfiguration("too many reactions registered".to_string())
            })?;
            let definition = ReactionDefinition {
                id,
                name: spec.name.clone(),
                reactants: spec.reactants.iter().copied().collect(),
                products: spec.products.iter().copied().collect(),
                rate_constant: spec.rate_constant,
                activation_energy: spec.activation_energy,
                reference_temperature: spec.reference_temperature,
            };
            let kelvin = temperature.unwrap_or(definition.reference_temperature);
            kinetic_rates.push(definition.rate_constant * definition.arrhenius(kelvin));
            reactions.push(definition);
        }
        Ok(Self {
            reactions,
            kinetic_rates,
            molecules_per_unit,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reactions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reactions.is_empty()
    }

    #[must_use]
    pub const fn molecules_per_unit(&self) -> f64 {
        self.molecules_per_unit
    }

    pub fn get(&self, id: ReactionId) -> Result<&ReactionDefinition, ChemistryError> {
        self.reactions
            .get(id.index())
            .ok_or(ChemistryError::UnknownReaction(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReactionDefinition> {
        self.reactions.iter()
    }

    pub(crate) fn definition_at(&self, index: usize) -> &ReactionDefinition {
        &self.reactions[index]
    }

    /// Rate constant times the Arrhenius factor.
    pub fn kinetic_rate(&self, id: ReactionId) -> Result<f64, ChemistryError> {
        self.kinetic_rates
            .get(id.index())
            .copied()
            .ok_or(ChemistryError::UnknownReaction(id))
    }

    /// Propensity of reaction `index` for a cell holding `concentrations` (one entry per species).
    ///
    /// Exactly zero whenever a reactant's effective count is zero.
    #[must_use]
    pub(crate) fn propensity_at(&self, index: usize, concentrations: &[f64], coupling: f64) -> f64 {
        let mut propensity = self.kinetic_rates[index];
        for reactant in &self.reactions[index].reactants {
            let count = effective_count(
                concentrations[reactant.species.index()],
                self.molecules_per_unit,
            );
            if count == 0.0 {
                return 0.0;
            }
            propensity *= count.powi(reactant.stoichiometry as i32);
        }
        propensity * coupling
    }

    /// Checked variant of the propensity formula.
    pub fn propensity(
        &self,
        id: ReactionId,
        concentrations: &[f64],
        coupling: f64,
    ) -> Result<f64, ChemistryError> {
        let reaction = self.get(id)?;
        if let Some(missing) = reaction
            .reactants
            .iter()
            .find(|reactant| reactant.species.index() >= concentrations.len())
        {
            return Err(ChemistryError::UnknownSpecies(missing.species));
        }
        Ok(self.propensity_at(id.index(), concentrations, coupling))
    }

    /// Apply one firing to a cell.
    ///
    /// Returns the number of reactants that held fewer molecules than the firing consumed;
    /// those are clamped to zero.
    pub(crate) fn fire(&self, index: usize, concentrations: &mut [f64]) -> usize {
        let reaction = &self.reactions[index];
        let mut clamps = 0;
        for reactant in &reaction.reactants {
            let slot = &mut concentrations[reactant.species.index()];
            let stoichiometry = f64::from(reactant.stoichiometry);
            if effective_count(*slot, self.molecules_per_unit) < stoichiometry {
                clamps += 1;
            }
            let next = *slot - stoichiometry / self.molecules_per_unit;
            // Residue below the count tolerance is rounding left by the last molecule.
            *slot = if next * self.molecules_per_unit < COUNT_TOLERANCE {
                0.0
            } else {
                next
            };
        }
        for product in &reaction.products {
            concentrations[product.species.index()] +=
                f64::from(product.stoichiometry) / self.molecules_per_unit;
        }
        clamps
    }

    pub(crate) fn specs(&self) -> Vec<ReactionSpec> {
        self.reactions
            .iter()
            .map(|reaction| ReactionSpec {
                name: reaction.name.clone(),
                reactants: reaction.reactants.to_vec(),
                products: reaction.products.to_vec(),
                rate_constant: reaction.rate_constant,
                activation_energy: reaction.activation_energy,
                reference_temperature: reaction.reference_temperature,
            })
            .collect()
    }
}

/// Multiplicative propensity factor derived from adjacent cells.
pub trait NeighborCoupling: Send + Sync + fmt::Debug {
    /// Factor for a cell given the summed concentrations of its in-bounds orthogonal neighbours.
    fn factor(&self, neighbor_totals: &[f32]) -> f64;

    /// Whether [`factor`](Self::factor) reads its input. Uniform couplings skip neighbour refreshes.
    fn depends_on_neighbors(&self) -> bool {
        true
    }
}

/// Coupling that leaves propensities untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uncoupled;

impl NeighborCoupling for Uncoupled {
    fn factor(&self, _neighbor_totals: &[f32]) -> f64 {
        1.0
    }

    fn depends_on_neighbors(&self) -> bool {
        false
    }
}

/// Saturating boost `1 + strength * m / (half_saturation + m)` from the mean neighbour total `m`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivityCoupling {
    pub strength: f64,
    pub half_saturation: f64,
}

impl NeighborCoupling for ActivityCoupling {
    fn factor(&self, neighbor_totals: &[f32]) -> f64 {
        if neighbor_totals.is_empty() {
            return 1.0;
        }
        let mean = neighbor_totals
            .iter()
            .map(|total| f64::from(*total))
            .sum::<f64>()
            / neighbor_totals.len() as f64;
        let denominator = self.half_saturation + mean;
        if denominator <= 0.0 {
            return 1.0;
        }
        1.0 + self.strength * mean / denominator
    }
}

/// Serializable coupling selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouplingConfig {
    #[default]
    None,
    Activity { strength: f64, half_saturation: f64 },
}

impl CouplingConfig {
    /// Instantiate the configured coupling.
    pub fn build(&self) -> Result<Box<dyn NeighborCoupling>, ChemistryError> {
        match *self {
            Self::None => Ok(Box::new(Uncoupled)),
            Self::Activity {
                strength,
                half_saturation,
            } => {
                if !(strength.is_finite() && strength >= 0.0)
                    || !(half_saturation.is_finite() && half_saturation >= 0.0)
                {
                    return Err(ChemistryError::InvalidConfiguration(
                        "activity coupling parameters must be finite and non-negative".to_string(),
                    ));
                }
                Ok(Box::new(ActivityCoupling {
                    strength,
                    half_saturation,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpeciesSpec;

    fn registry() -> SpeciesRegistry {
        let mut registry = SpeciesRegistry::new();
        registry
            .register(SpeciesSpec::new("a", 0.1, 0.0))
            .expect("a");
        registry
            .register(SpeciesSpec::new("b", 0.1, 0.0))
            .expect("b");
        registry
    }

    #[test]
    fn effective_count_tolerates_f32_noise() {
        assert_eq!(effective_count(1.0, 100.0), 100.0);
        assert_eq!(effective_count(0.99, 100.0), 99.0);
        assert_eq!(effective_count(0.0, 100.0), 0.0);
        assert_eq!(effective_count(0.009, 100.0), 0.0);
        assert_eq!(effective_count(0.999_999_9, 100.0), 100.0);
    }

    #[test]
    fn propensity_is_exactly_zero_without_reactant() {
        let species = registry();
        let spec = ReactionSpec::new("bind", 2.0)
            .reactant(SpeciesId(0), 1)
            .reactant(SpeciesId(1), 2)
            .product(SpeciesId(0), 1);
        let network = ReactionNetwork::new(&[spec], &species, None, 10.0).expect("network");
        let id = ReactionId(0);
        assert_eq!(network.propensity(id, &[0.0, 5.0], 1.0).expect("a"), 0.0);
        assert_eq!(network.propensity(id, &[5.0, 0.0], 1.0).expect("a"), 0.0);
        // 2 * 10 * 3^2
        let propensity = network.propensity(id, &[1.0, 0.3], 1.0).expect("a");
        assert!((propensity - 180.0).abs() < 1e-9, "{propensity}");
        assert!((network.propensity(id, &[1.0, 0.3], 1.5).expect("a") - 270.0).abs() < 1e-9);
    }

    #[test]
    fn arrhenius_uses_override_temperature() {
        let species = registry();
        let spec = ReactionSpec::new("hot", 1.0)
            .reactant(SpeciesId(0), 1)
            .with_activation_energy(10_000.0, 300.0);
        let reference = ReactionNetwork::new(std::slice::from_ref(&spec), &species, None, 1.0)
            .expect("network");
        let warm = ReactionNetwork::new(&[spec], &species, Some(600.0), 1.0).expect("network");
        let expected = (-10_000.0 / (GAS_CONSTANT * 300.0_f64)).exp();
        assert!((reference.kinetic_rate(ReactionId(0)).expect("k") - expected).abs() < 1e-12);
        assert!(
            warm.kinetic_rate(ReactionId(0)).expect("k")
                > reference.kinetic_rate(ReactionId(0)).expect("k")
        );
    }

    #[test]
    fn network_rejects_unknown_species_and_bad_shapes() {
        let species = registry();
        let dangling = ReactionSpec::new("dangling", 1.0).reactant(SpeciesId(5), 1);
        assert!(matches!(
            ReactionNetwork::new(&[dangling], &species, None, 1.0),
            Err(ChemistryError::InvalidConfiguration(_))
        ));
        let zero = ReactionSpec::new("zero", 1.0).reactant(SpeciesId(0), 0);
        assert!(zero.validate_shape().is_err());
        let repeated = ReactionSpec::new("twice", 1.0)
            .product(SpeciesId(1), 1)
            .product(SpeciesId(1), 2);
        assert!(repeated.validate_shape().is_err());
        let network = ReactionNetwork::new(&[], &species, None, 1.0).expect("empty");
        assert!(matches!(
            network.get(ReactionId(0)),
            Err(ChemistryError::UnknownReaction(ReactionId(0)))
        ));
    }

    #[test]
    fn firing_moves_stoichiometric_mass_and_clamps() {
        let species = registry();
        let spec = ReactionSpec::new("convert", 1.0)
            .reactant(SpeciesId(0), 2)
            .product(SpeciesId(1), 1);
        let network = ReactionNetwork::new(&[spec], &species, None, 1.0).expect("network");
        let mut cell = [3.0, 0.0];
        assert_eq!(network.fire(0, &mut cell), 0);
        assert_eq!(cell, [1.0, 1.0]);
        assert_eq!(network.fire(0, &mut cell), 1);
        assert_eq!(cell, [0.0, 2.0]);
    }

    #[test]
    fn draining_the_last_molecule_is_not_a_clamp() {
        let species = registry();
        let spec = ReactionSpec::new("decay", 1.0).reactant(SpeciesId(0), 1);
        let network = ReactionNetwork::new(&[spec], &species, None, 100.0).expect("network");
        // One molecule as read back from f32 storage.
        let mut cell = [f64::from(0.01_f32), 0.0];
        assert!(cell[0] < 0.01);
        assert_eq!(network.fire(0, &mut cell), 0);
        assert_eq!(cell[0], 0.0);

        let mut cell = [f64::from(0.03_f32), 0.0];
        for _ in 0..3 {
            assert_eq!(network.fire(0, &mut cell), 0);
        }
        assert_eq!(cell[0], 0.0);
    }

    #[test]
    fn large_counts_survive_f32_storage() {
        for count in [10_000_u32, 55_026, 99_999, 1_000_000] {
            let stored = (f64::from(count) / 100.0) as f32;
            assert_eq!(effective_count(f64::from(stored), 100.0), f64::from(count));
        }
        assert_eq!(effective_count(550.255, 100.0), 55_025.0);
    }

    #[test]
    fn activity_coupling_saturates() {
        let coupling = CouplingConfig::Activity {
            strength: 2.0,
            half_saturation: 1.0,
        }
        .build()
        .expect("coupling");
        assert_eq!(coupling.factor(&[]), 1.0);
        assert_eq!(coupling.factor(&[0.0, 0.0]), 1.0);
        assert!((coupling.factor(&[1.0, 1.0]) - 2.0).abs() < 1e-12);
        assert!(coupling.factor(&[1e6]) < 3.0);
        assert!(coupling.depends_on_neighbors());
        assert!(!Uncoupled.depends_on_neighbors());
        assert!(
            CouplingConfig::Activity {
                strength: -1.0,
                half_saturation: 1.0
            }
            .build()
            .is_err()
        );
    }
}
