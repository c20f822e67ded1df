//! Solver configuration.
//!
//! Parameters controlling the nonlinear and linear solves,
//! time stepping and boundary conditions.
//! Every struct deserializes from partial documents,
//! missing fields taking their default values.

use serde::{Deserialize, Serialize};

use crate::linear::Preconditioner;

/// Quantity compared against the Newton tolerance after every iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvergenceMetric {
    /// Largest absolute residual entry at the updated state.
    #[default]
    MaxResidual,
    /// Change between iterations in the mean of one field over all non-border cells.
    FieldMeanChange {
        /// Index of the field.
        field: usize,
    },
}

/// Condition applied at every border cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BorderCondition {
    /// Fixed external pressure.
    /// Other fields are held at the model's initial state.
    Fixed {
        /// The external pressure.
        pressure: f64,
    },
    /// No flow across the border.
    /// The border cell copies the state of its neighboring cell.
    #[default]
    NoFlow,
}

/// Configuration of the Newton-Raphson iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    /// Convergence tolerance for the metric.
    pub tolerance: f64,
    /// Iterations allowed before giving up on a time step.
    pub max_iterations: usize,
    /// Factor in `(0, 1]` the increment is scaled by before it's applied.
    pub damping: f64,
    /// Consecutive iterations a field of one cell may be clamped
    /// before the solve is considered failed.
    pub max_repeated_clamps: usize,
    /// What is compared against `tolerance`.
    pub metric: ConvergenceMetric,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-4,
            max_iterations: 20,
            damping: 1.0,
            max_repeated_clamps: 3,
            metric: ConvergenceMetric::MaxResidual,
        }
    }
}

impl NewtonConfig {
    /// A tighter tolerance with more iterations allowed.
    pub fn strict() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 50,
            ..Default::default()
        }
    }
}

/// Configuration of adaptive time stepping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeStepConfig {
    /// Smallest step, also the step every period starts with.
    pub ht_min: f64,
    /// Largest step.
    pub ht_max: f64,
    /// Factor the step grows or shrinks by.
    pub growth_factor: f64,
    /// Newton iteration count separating fast solves, which grow the step,
    /// from slow ones, which shrink it.
    pub iteration_threshold: usize,
}

impl Default for TimeStepConfig {
    fn default() -> Self {
        Self {
            ht_min: 1e-4,
            ht_max: 1.0,
            growth_factor: 1.5,
            iteration_threshold: 6,
        }
    }
}

/// Configuration of the iterative linear solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearSolverConfig {
    /// Maximum iterations per solve.
    pub max_iterations: usize,
    /// Absolute residual norm tolerance.
    pub absolute_tolerance: f64,
    /// Residual norm tolerance relative to the initial residual.
    pub relative_tolerance: f64,
    /// Preconditioner tried first.
    pub preconditioner: Preconditioner,
    /// Preconditioner tried if the first solve fails.
    pub fallback: Option<Preconditioner>,
    /// Systems with at most this many unknowns are solved with a dense LU
    /// factorization when the iteration breaks down or runs out of iterations.
    /// Zero disables the direct solve.
    pub direct_fallback_size: usize,
}

impl Default for LinearSolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            absolute_tolerance: 1e-15,
            relative_tolerance: 1e-10,
            preconditioner: Preconditioner::Ilu0,
            fallback: Some(Preconditioner::Jacobi),
            direct_fallback_size: 2000,
        }
    }
}

/// Complete configuration of a simulation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Newton iteration.
    pub newton: NewtonConfig,
    /// Time stepping.
    pub time: TimeStepConfig,
    /// Linear solver.
    pub linear: LinearSolverConfig,
    /// Border condition.
    pub border: BorderCondition,
    /// Gravitational acceleration, zero to disable gravity.
    pub gravity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: SimulationConfig = serde_json::from_str(
            r#"{
                "newton": { "tolerance": 1e-6 },
                "time": { "ht_max": 10.0 },
                "border": { "type": "fixed", "pressure": 2.0 },
                "linear": { "preconditioner": "jacobi", "fallback": null }
            }"#,
        )
        .unwrap();

        assert_eq!(config.newton.tolerance, 1e-6);
        assert_eq!(config.newton.max_iterations, 20);
        assert_eq!(config.time.ht_max, 10.0);
        assert_eq!(config.time.growth_factor, 1.5);
        assert_eq!(config.border, BorderCondition::Fixed { pressure: 2.0 });
        assert_eq!(config.linear.preconditioner, Preconditioner::Jacobi);
        assert_eq!(config.linear.fallback, None);
        assert_eq!(config.linear.direct_fallback_size, 2000);
        assert_eq!(config.gravity, 0.0);

        let empty: SimulationConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, SimulationConfig::default());
    }

    #[test]
    fn round_trip_through_json() {
        let config = SimulationConfig {
            newton: NewtonConfig {
                metric: ConvergenceMetric::FieldMeanChange { field: 0 },
                ..NewtonConfig::strict()
            },
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SimulationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
