//! Fluid models: the property callbacks residual assembly is generic over.
//!
//! A model fixes the number of fields per cell (pressure first),
//! one mass balance equation per phase,
//! and pure property functions of the local state
//! that can be evaluated on plain numbers and on [`Dual64`][crate::autodiff::Dual64]s alike.
//! All values are assumed to be in consistent non-dimensional units.

mod oil;
pub use oil::OilModel;
mod water_oil;
pub use water_oil::{WaterOilModel, WATER_SATURATION};

//

use serde::{Deserialize, Serialize};

use crate::{autodiff::Scalar, mesh::CellType};

/// Index of the pressure field in every model's state vector.
pub const PRESSURE: usize = 0;

/// Properties of the porous medium shared by all fluid models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RockProperties {
    /// Porosity at the reference pressure.
    pub porosity: f64,
    /// Rock compressibility, the relative porosity change per unit pressure.
    pub compressibility: f64,
    /// Pressure at which `porosity` is measured.
    pub reference_pressure: f64,
    /// Permeability of interior and border cells.
    pub permeability: f64,
    /// Permeability of fracture and well cells.
    pub fracture_permeability: f64,
}

impl Default for RockProperties {
    fn default() -> Self {
        Self {
            porosity: 0.2,
            compressibility: 0.0,
            reference_pressure: 1.0,
            permeability: 1.0,
            fracture_permeability: 1000.0,
        }
    }
}

impl RockProperties {
    /// Porosity at pressure `p`, linear in pressure.
    #[inline]
    pub fn porosity<S: Scalar>(&self, p: S) -> S {
        (p - self.reference_pressure) * (self.porosity * self.compressibility) + self.porosity
    }

    /// Permeability of a cell of the given type.
    #[inline]
    pub fn permeability(&self, cell_type: CellType) -> f64 {
        match cell_type {
            CellType::Interior | CellType::Border => self.permeability,
            CellType::Fracture | CellType::Well => self.fracture_permeability,
        }
    }
}

/// Properties of a slightly compressible fluid phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseProperties {
    /// Density at the reference pressure.
    pub density: f64,
    /// Fluid compressibility, the relative density change per unit pressure.
    pub compressibility: f64,
    /// Dynamic viscosity, taken as constant.
    pub viscosity: f64,
}

impl Default for PhaseProperties {
    fn default() -> Self {
        Self {
            density: 1.0,
            compressibility: 0.0,
            viscosity: 1.0,
        }
    }
}

impl PhaseProperties {
    /// Density at pressure `p` given the reference pressure, linear in pressure.
    #[inline]
    pub fn density<S: Scalar>(&self, p: S, reference_pressure: f64) -> S {
        (p - reference_pressure) * (self.density * self.compressibility) + self.density
    }
}

/// Allowed range of a state field.
/// Values outside are clamped back in and the clamp is reported.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FieldBounds {
    /// Lower bound, if any.
    pub min: Option<f64>,
    /// Upper bound, if any.
    pub max: Option<f64>,
}

impl FieldBounds {
    /// No bounds.
    pub const UNBOUNDED: Self = Self {
        min: None,
        max: None,
    };
    /// Nonnegative values.
    pub const NONNEGATIVE: Self = Self {
        min: Some(0.0),
        max: None,
    };
    /// Values in `[0, 1]`, e.g. saturations.
    pub const UNIT: Self = Self {
        min: Some(0.0),
        max: Some(1.0),
    };

    /// Clamp a value into the bounds,
    /// returning the clamped value and whether it was changed.
    #[inline]
    pub fn clamp(&self, v: f64) -> (f64, bool) {
        match (self.min, self.max) {
            (Some(lo), _) if v < lo => (lo, true),
            (_, Some(hi)) if v > hi => (hi, true),
            _ => (v, false),
        }
    }
}

/// A fluid model variant.
///
/// The Newton driver, assemblers and time step controller
/// only depend on this interface.
/// Phase `e` has its mass balance as equation `e`;
/// the number of equations equals the number of fields.
pub trait FluidModel: Send + Sync {
    /// Number of fields (and equations) per cell.
    fn var_count(&self) -> usize;

    /// Human-readable names of the fields, used in diagnostics.
    fn field_names(&self) -> &'static [&'static str];

    /// The state every cell starts from.
    fn initial_state(&self) -> Vec<f64>;

    /// The porous medium.
    fn rock(&self) -> &RockProperties;

    /// Permeability of a cell of the given type.
    fn permeability(&self, cell_type: CellType) -> f64 {
        self.rock().permeability(cell_type)
    }

    /// Density of a phase at pressure `p`.
    fn density<S: Scalar>(&self, phase: usize, p: S) -> S;

    /// Mobility (relative permeability over viscosity) of a phase in state `x`.
    fn mobility<S: Scalar>(&self, phase: usize, x: &[S]) -> S;

    /// Mass of a phase per unit volume of rock in state `x`.
    fn accumulation<S: Scalar>(&self, phase: usize, x: &[S]) -> S;

    /// Fraction of an injected volume made up of the given phase.
    fn injection_fraction(&self, phase: usize) -> f64;

    /// Allowed range of a field.
    fn bounds(&self, field: usize) -> FieldBounds;

    /// Fraction of the total mobility carried by a phase,
    /// i.e. the share of a produced volume made up of the phase.
    fn mobility_fraction<S: Scalar>(&self, phase: usize, x: &[S]) -> S {
        let total = (1..self.var_count()).fold(self.mobility(0, x), |acc, e| {
            acc + self.mobility(e, x)
        });
        self.mobility(phase, x) / total
    }
}
