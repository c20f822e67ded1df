use serde::{Deserialize, Serialize};

use super::{FieldBounds, FluidModel, PhaseProperties, RockProperties, PRESSURE};
use crate::{autodiff::Scalar, table::Table};

/// Index of the water saturation field.
pub const WATER_SATURATION: usize = 1;

const WATER: usize = 0;
const OIL: usize = 1;

/// Two-phase flow of water and oil.
///
/// Fields are pressure and water saturation,
/// oil saturation being its complement.
/// Equation 0 is the water balance and equation 1 the oil balance.
/// Relative permeabilities come from tables,
/// water's keyed by water saturation and oil's by oil saturation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaterOilModel {
    /// The porous medium.
    pub rock: RockProperties,
    /// The water phase.
    pub water: PhaseProperties,
    /// The oil phase.
    pub oil: PhaseProperties,
    /// Relative permeability of water as a function of water saturation.
    pub kr_water: Table,
    /// Relative permeability of oil as a function of oil saturation.
    pub kr_oil: Table,
    /// Pressure every cell starts at.
    pub initial_pressure: f64,
    /// Water saturation every cell starts at.
    pub initial_water_saturation: f64,
}

/// Quadratic relative permeability sampled on a coarse grid.
fn quadratic_kr() -> Table {
    Table::new((0..=4).map(|i| i as f64 / 4.0).map(|s| (s, s * s)).collect())
        .unwrap_or_else(|_| Table::unit_linear())
}

impl Default for WaterOilModel {
    fn default() -> Self {
        let rock = RockProperties::default();
        Self {
            initial_pressure: rock.reference_pressure,
            rock,
            water: PhaseProperties::default(),
            oil: PhaseProperties {
                density: 0.8,
                viscosity: 5.0,
                ..Default::default()
            },
            kr_water: quadratic_kr(),
            kr_oil: quadratic_kr(),
            initial_water_saturation: 0.2,
        }
    }
}

impl WaterOilModel {
    fn phase(&self, phase: usize) -> &PhaseProperties {
        if phase == WATER {
            &self.water
        } else {
            &self.oil
        }
    }

    /// Saturation of a phase in state `x`.
    fn saturation<S: Scalar>(phase: usize, x: &[S]) -> S {
        let sw = x[WATER_SATURATION];
        if phase == WATER {
            sw
        } else {
            -sw + 1.0
        }
    }
}

impl FluidModel for WaterOilModel {
    fn var_count(&self) -> usize {
        2
    }

    fn field_names(&self) -> &'static [&'static str] {
        &["pressure", "water saturation"]
    }

    fn initial_state(&self) -> Vec<f64> {
        vec![self.initial_pressure, self.initial_water_saturation]
    }

    fn rock(&self) -> &RockProperties {
        &self.rock
    }

    fn density<S: Scalar>(&self, phase: usize, p: S) -> S {
        self.phase(phase).density(p, self.rock.reference_pressure)
    }

    fn mobility<S: Scalar>(&self, phase: usize, x: &[S]) -> S {
        let s = Self::saturation(phase, x);
        let kr = match phase {
            WATER => self.kr_water.eval(s),
            _ => self.kr_oil.eval(s),
        };
        kr / self.phase(phase).viscosity
    }

    fn accumulation<S: Scalar>(&self, phase: usize, x: &[S]) -> S {
        let p = x[PRESSURE];
        self.rock.porosity(p) * self.density(phase, p) * Self::saturation(phase, x)
    }

    fn injection_fraction(&self, phase: usize) -> f64 {
        match phase {
            WATER => 1.0,
            OIL => 0.0,
            _ => 0.0,
        }
    }

    fn bounds(&self, field: usize) -> FieldBounds {
        match field {
            PRESSURE => FieldBounds::NONNEGATIVE,
            _ => FieldBounds::UNIT,
        }
    }
}
