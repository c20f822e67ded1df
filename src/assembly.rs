//! Residual and Jacobian assembly.
//!
//! The [`LocalAssembler`] evaluates each cell's residual over its stencil
//! with automatic differentiation, producing a dense [`LocalBlock`] per cell.
//! The [`GlobalAssembler`] scatters those blocks into a sparse matrix
//! with a sparsity pattern fixed once per mesh.

mod local;
pub use local::{FlowSystem, LocalAssembler};
mod global;
pub use global::{GlobalAssembler, LinearSystem};

//

use nalgebra as na;

use crate::{autodiff::Scalar, config::BorderCondition};

/// Residual and exact Jacobian of one cell's equations.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalBlock {
    /// Id of the cell whose equations these are.
    pub row: usize,
    /// Ids of the cells the equations depend on, in column block order.
    /// May contain duplicates, whose columns are summed on assembly.
    pub stencil: Vec<usize>,
    /// One entry per equation.
    pub residual: na::DVector<f64>,
    /// `var_count` rows and `stencil.len() * var_count` columns.
    pub jacobian: na::DMatrix<f64>,
}

/// How the well is driven during a time step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WellTarget<'a> {
    /// A total volumetric rate split over the well links.
    /// Positive rates produce, negative rates inject.
    Rate {
        /// Rate assigned to each well link.
        link_rates: &'a [f64],
    },
    /// A fixed bottom-hole pressure.
    Bhp {
        /// The well pressure.
        pressure: f64,
    },
}

impl WellTarget<'_> {
    /// Total rate in rate mode, `None` in pressure mode.
    pub fn total_rate(&self) -> Option<f64> {
        match self {
            WellTarget::Rate { link_rates } => Some(link_rates.iter().sum()),
            WellTarget::Bhp { .. } => None,
        }
    }
}

/// Everything about the current time step that residuals depend on
/// besides the mesh, model and state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepContext<'a> {
    /// Time step size.
    pub ht: f64,
    /// Well control.
    pub well: WellTarget<'a>,
    /// Condition applied at every border cell.
    pub border: BorderCondition,
    /// Gravitational acceleration.
    pub gravity: f64,
}

/// Two-point transmissibility of a face between two cells,
/// the harmonic combination of each side's permeability over its distance to the face:
/// `height * length * k1 * k2 / (k1 * d2 + k2 * d1)`.
#[inline]
pub fn transmissibility(height: f64, length: f64, k1: f64, d1: f64, k2: f64, d2: f64) -> f64 {
    height * length * k1 * k2 / (k1 * d2 + k2 * d1)
}

/// Distance-weighted average of a quantity on both sides of a face,
/// weighting each side by the other side's distance so the closer value dominates.
#[inline]
pub fn face_average<S: Scalar>(a1: S, d1: f64, a2: S, d2: f64) -> S {
    let total = d1 + d2;
    if total > 0.0 {
        (a1 * d2 + a2 * d1) / total
    } else {
        (a1 + a2) * 0.5
    }
}
