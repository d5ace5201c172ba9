//! Species catalog resolved once at initialization.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ChemistryError;

/// Dense index of a registered species.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct SpeciesId(pub u16);

impl SpeciesId {
    /// Position of the species inside per-species arrays.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SpeciesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "species#{}", self.0)
    }
}

/// Registration payload for a species; the registry assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpeciesSpec {
    pub name: String,
    /// Diffusion coefficient in world units² per unit time.
    pub diffusion_rate: f64,
    /// First-order decay rate per unit time.
    pub decay_rate: f64,
    #[serde(default)]
    pub volatility: f64,
    #[serde(default = "unit_weight")]
    pub molecular_weight: f64,
}

fn unit_weight() -> f64 {
    1.0
}

impl SpeciesSpec {
    /// Species with neutral volatility and unit molecular weight.
    #[must_use]
    pub fn new(name: impl Into<String>, diffusion_rate: f64, decay_rate: f64) -> Self {
        Self {
            name: name.into(),
            diffusion_rate,
            decay_rate,
            volatility: 0.0,
            molecular_weight: 1.0,
        }
    }

    #[must_use]
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }

    #[must_use]
    pub fn with_molecular_weight(mut self, molecular_weight: f64) -> Self {
        self.molecular_weight = molecular_weight;
        self
    }
}

/// Immutable description of a registered species.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChemicalSpecies {
    pub id: SpeciesId,
    pub name: String,
    pub diffusion_rate: f64,
    pub decay_rate: f64,
    pub volatility: f64,
    pub molecular_weight: f64,
}

impl ChemicalSpecies {
    /// Dimensionless diffusion number `dt * D / h²` for the given step and cell size.
    #[must_use]
    pub fn diffusion_number(&self, dt: f64, cell_size: f64) -> f64 {
        dt * self.diffusion_rate / (cell_size * cell_size)
    }
}

/// Fixed-size species catalog indexed by [`SpeciesId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeciesRegistry {
    species: Vec<ChemicalSpecies>,
}

impl SpeciesRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a species, returning its dense id.
    pub fn register(&mut self, spec: SpeciesSpec) -> Result<SpeciesId, ChemistryError> {
        if spec.name.trim().is_empty() {
            return Err(ChemistryError::InvalidConfiguration(
                "species name must not be empty".to_string(),
            ));
        }
        if self.id_of(&spec.name).is_some() {
            return Err(ChemistryError::DuplicateSpecies(spec.name));
        }
        let rates_valid = [spec.diffusion_rate, spec.decay_rate, spec.volatility]
            .iter()
            .all(|rate| rate.is_finite() && *rate >= 0.0);
        if !rates_valid {
            return Err(ChemistryError::InvalidConfiguration(format!(
                "species {:?}: diffusion, decay and volatility must be finite and non-negative",
                spec.name
            )));
        }
        if !(spec.molecular_weight.is_finite() && spec.molecular_weight > 0.0) {
            return Err(ChemistryError::InvalidConfiguration(format!(
                "species {:?}: molecular weight must be positive",
                spec.name
            )));
        }
        let id = u16::try_from(self.species.len())
            .map(SpeciesId)
            .map_err(|_| {
                ChemistryError::InvalidConfiguration("too many species registered".to_string())
            })?;
        self.species.push(ChemicalSpecies {
            id,
            name: spec.name,
            diffusion_rate: spec.diffusion_rate,
            decay_rate: spec.decay_rate,
            volatility: spec.volatility,
            molecular_weight: spec.molecular_weight,
        });
        Ok(id)
    }

    /// Look up a species by id.
    pub fn get(&self, id: SpeciesId) -> Result<&ChemicalSpecies, ChemistryError> {
        self.species
            .get(id.index())
            .ok_or(ChemistryError::UnknownSpecies(id))
    }

    /// Resolve a species name to its id.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<SpeciesId> {
        self.species
            .iter()
            .find(|species| species.name == name)
            .map(|species| species.id)
    }

    #[must_use]
    pub fn contains(&self, id: SpeciesId) -> bool {
        id.index() < self.species.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.species.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.species.is_empty()
    }

    /// Iterate species in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ChemicalSpecies> {
        self.species.iter()
    }

    /// Registration payloads in order, used when reallocating a system.
    pub(crate) fn specs(&self) -> Vec<SpeciesSpec> {
        self.species
            .iter()
            .map(|species| SpeciesSpec {
                name: species.name.clone(),
                diffusion_rate: species.diffusion_rate,
                decay_rate: species.decay_rate,
                volatility: species.volatility,
                molecular_weight: species.molecular_weight,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_assigns_dense_ids_in_order() {
        let mut registry = SpeciesRegistry::new();
        let trail = registry
            .register(SpeciesSpec::new("trail", 0.15, 0.002))
            .expect("trail");
        let alarm = registry
            .register(SpeciesSpec::new("alarm", 0.2, 0.05).with_volatility(0.3))
            .expect("alarm");
        assert_eq!(trail, SpeciesId(0));
        assert_eq!(alarm, SpeciesId(1));
        assert_eq!(registry.id_of("alarm"), Some(alarm));
        assert_eq!(registry.get(alarm).expect("alarm").volatility, 0.3);
        assert!(registry.contains(trail));
        assert!(!registry.contains(SpeciesId(2)));
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_rates() {
        let mut registry = SpeciesRegistry::new();
        registry
            .register(SpeciesSpec::new("trail", 0.15, 0.002))
            .expect("trail");
        assert!(matches!(
            registry.register(SpeciesSpec::new("trail", 0.1, 0.0)),
            Err(ChemistryError::DuplicateSpecies(name)) if name == "trail"
        ));
        assert!(matches!(
            registry.register(SpeciesSpec::new("bad", -1.0, 0.0)),
            Err(ChemistryError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            registry.register(SpeciesSpec::new("heavy", 0.1, 0.0).with_molecular_weight(0.0)),
            Err(ChemistryError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            registry.get(SpeciesId(9)),
            Err(ChemistryError::UnknownSpecies(SpeciesId(9)))
        ));
    }

    #[test]
    fn diffusion_number_scales_with_cell_area() {
        let species = ChemicalSpecies {
            id: SpeciesId(0),
            name: "trail".into(),
            diffusion_rate: 0.2,
            decay_rate: 0.0,
            volatility: 0.0,
            molecular_weight: 1.0,
        };
        assert!((species.diffusion_number(1.0, 1.0) - 0.2).abs() < 1e-12);
        assert!((species.diffusion_number(1.0, 2.0) - 0.05).abs() < 1e-12);
    }
}
