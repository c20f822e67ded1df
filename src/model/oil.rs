use serde::{Deserialize, Serialize};

use super::{FieldBounds, FluidModel, PhaseProperties, RockProperties, PRESSURE};
use crate::autodiff::Scalar;

/// Single-phase flow of a slightly compressible oil.
///
/// The only field is pressure.
/// Porosity and density are linear in pressure and viscosity is constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OilModel {
    /// The porous medium.
    pub rock: RockProperties,
    /// The oil phase.
    pub oil: PhaseProperties,
    /// Pressure every cell starts at.
    pub initial_pressure: f64,
}

impl Default for OilModel {
    fn default() -> Self {
        Self::new(RockProperties::default(), PhaseProperties::default())
    }
}

impl OilModel {
    /// An oil model starting at the rock's reference pressure.
    pub fn new(rock: RockProperties, oil: PhaseProperties) -> Self {
        Self {
            initial_pressure: rock.reference_pressure,
            rock,
            oil,
        }
    }
}

impl FluidModel for OilModel {
    fn var_count(&self) -> usize {
        1
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["pressure"]
    }

    fn initial_state(&self) -> Vec<f64> {
        vec![self.initial_pressure]
    }

    fn rock(&self) -> &RockProperties {
        &self.rock
    }

    fn density<S: Scalar>(&self, _phase: usize, p: S) -> S {
        self.oil.density(p, self.rock.reference_pressure)
    }

    fn mobility<S: Scalar>(&self, _phase: usize, _x: &[S]) -> S {
        S::constant(1.0 / self.oil.viscosity)
    }

    fn accumulation<S: Scalar>(&self, phase: usize, x: &[S]) -> S {
        let p = x[PRESSURE];
        self.rock.porosity(p) * self.density(phase, p)
    }

    fn injection_fraction(&self, _phase: usize) -> f64 {
        1.0
    }

    fn bounds(&self, _field: usize) -> FieldBounds {
        FieldBounds::NONNEGATIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{seed, Scalar};
    use approx::assert_relative_eq;

    #[test]
    fn accumulation_derivative() {
        let model = OilModel::new(
            RockProperties {
                porosity: 0.2,
                compressibility: 0.1,
                reference_pressure: 1.0,
                ..Default::default()
            },
            PhaseProperties {
                density: 800.0,
                compressibility: 0.01,
                viscosity: 2.0,
            },
        );
        assert_eq!(model.initial_state(), vec![1.0]);

        // φρ = 0.2(1 + 0.1(p-1)) 800(1 + 0.01(p-1)), d/dp at p = 1 is 0.2·800·0.11
        let acc = model.accumulation(0, &[seed(1.0)]);
        assert_relative_eq!(acc.value(), 160.0);
        assert_relative_eq!(acc.eps, 17.6, epsilon = 1e-12);

        assert_relative_eq!(model.mobility::<f64>(0, &[1.0]), 0.5);
        assert_relative_eq!(model.mobility_fraction::<f64>(0, &[1.0]), 1.0);
    }
}
