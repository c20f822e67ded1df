//! Newton-Raphson iteration for the nonlinear system of one time step.
//!
//! The driver is independent of the physics:
//! anything implementing [`NonlinearSystem`] can be solved,
//! the flow equations of [`FlowSystem`][crate::assembly::FlowSystem] being one such system.

use nalgebra as na;
use std::collections::HashMap;

use crate::{
    assembly::LinearSystem,
    config::{ConvergenceMetric, NewtonConfig},
    linear::{LinearSolveError, LinearSolver, Preconditioner},
    model::FieldBounds,
    state::StateStore,
};

/// A nonlinear system `R(x) = 0` over the candidate buffer of a [`StateStore`].
pub trait NonlinearSystem {
    /// Number of unknowns per cell.
    fn var_count(&self) -> usize;
    /// Assemble the Jacobian of the residual at the candidate state
    /// with the negated residual as the right-hand side.
    fn linearize(&mut self, state: &StateStore) -> LinearSystem;
    /// Evaluate the residual at the candidate state.
    fn residual(&self, state: &StateStore) -> na::DVector<f64>;
    /// Bounds a field is clamped into after every update.
    fn bounds(&self, _field: usize) -> FieldBounds {
        FieldBounds::UNBOUNDED
    }
    /// Aggregate observable used by [`ConvergenceMetric::FieldMeanChange`].
    /// Defaults to the mean over all cells.
    fn field_mean(&self, state: &StateStore, field: usize) -> f64 {
        let count = state.cell_count();
        let sum: f64 = (0..count).map(|c| state.next(c)[field]).sum();
        sum / count.max(1) as f64
    }
}

/// Where the driver is in its state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NewtonPhase {
    /// No solve has been started.
    #[default]
    Idle,
    /// A solve is in progress.
    Iterating {
        /// 1-based index of the current iteration.
        iteration: usize,
    },
    /// The last solve converged.
    Converged {
        /// Iterations it took.
        iterations: usize,
    },
    /// The last solve failed.
    Exhausted,
}

/// Reason a Newton solve failed.
/// All of these are recoverable by retrying with a shorter time step.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum NewtonFailure {
    /// The iteration cap was reached.
    #[error("No convergence in {iterations} iterations (metric {metric:e})")]
    Exhausted {
        /// Iterations run.
        iterations: usize,
        /// Last value of the convergence metric.
        metric: f64,
        /// Cell with the largest residual or update in the last iteration.
        cell: Option<usize>,
    },
    /// The linear solver failed with every preconditioner tried.
    #[error("Linear solve failed: {0}")]
    LinearSolve(#[from] LinearSolveError),
    /// A field of a cell was clamped into its bounds too many iterations in a row.
    #[error("Field {field} of cell {cell} was repeatedly out of bounds")]
    RepeatedClamp {
        /// The cell.
        cell: usize,
        /// The field.
        field: usize,
    },
    /// The update or residual contained NaN or infinite values.
    #[error("Non-finite values at cell {cell}")]
    NonFinite {
        /// The first offending cell.
        cell: usize,
    },
}

impl NewtonFailure {
    /// The cell the failure is attributed to, if any.
    pub fn cell(&self) -> Option<usize> {
        match self {
            Self::Exhausted { cell, .. } => *cell,
            Self::LinearSolve(_) => None,
            Self::RepeatedClamp { cell, .. } | Self::NonFinite { cell } => Some(*cell),
        }
    }
}

/// Summary of a converged solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NewtonReport {
    /// Iterations it took.
    pub iterations: usize,
    /// Final value of the convergence metric.
    pub metric: f64,
    /// Total number of values clamped into bounds.
    pub clamps: usize,
}

/// Newton-Raphson solver with step damping, clamping of bounded fields
/// and preconditioner fallback for the linear solves.
#[derive(Clone, Debug)]
pub struct NewtonDriver {
    config: NewtonConfig,
    preconditioner: Preconditioner,
    fallback: Option<Preconditioner>,
    phase: NewtonPhase,
}

impl NewtonDriver {
    /// Create a driver using ILU(0) preconditioning with a Jacobi fallback.
    pub fn new(config: NewtonConfig) -> Self {
        Self {
            config,
            preconditioner: Preconditioner::Ilu0,
            fallback: Some(Preconditioner::Jacobi),
            phase: NewtonPhase::Idle,
        }
    }

    /// Set the preconditioner tried first and the one tried if it fails.
    pub fn with_preconditioners(
        mut self,
        primary: Preconditioner,
        fallback: Option<Preconditioner>,
    ) -> Self {
        self.preconditioner = primary;
        self.fallback = fallback;
        self
    }

    /// The driver's configuration.
    #[inline]
    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    /// State of the last or ongoing solve.
    #[inline]
    pub fn phase(&self) -> NewtonPhase {
        self.phase
    }

    /// Iterate until the convergence metric drops below the tolerance.
    ///
    /// On success the converged values are in the candidate buffer of `state`;
    /// committing them is up to the caller.
    /// On failure the candidate buffer holds the last iterate
    /// and should be rolled back.
    pub fn solve<S, L>(
        &mut self,
        system: &mut S,
        state: &mut StateStore,
        solver: &mut L,
    ) -> Result<NewtonReport, NewtonFailure>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let result = self.iterate(system, state, solver);
        self.phase = match &result {
            Ok(report) => NewtonPhase::Converged {
                iterations: report.iterations,
            },
            Err(_) => NewtonPhase::Exhausted,
        };
        result
    }

    fn iterate<S, L>(
        &mut self,
        system: &mut S,
        state: &mut StateStore,
        solver: &mut L,
    ) -> Result<NewtonReport, NewtonFailure>
    where
        S: NonlinearSystem + ?Sized,
        L: LinearSolver + ?Sized,
    {
        let nv = system.var_count();
        let mut previous_mean = match self.config.metric {
            ConvergenceMetric::FieldMeanChange { field } => system.field_mean(state, field),
            ConvergenceMetric::MaxResidual => 0.0,
        };
        // consecutive iterations each (cell, field) has been clamped
        let mut clamp_streaks: HashMap<(usize, usize), usize> = HashMap::new();
        let mut total_clamps = 0;
        let mut metric = f64::INFINITY;
        let mut worst_cell = None;

        for iteration in 1..=self.config.max_iterations {
            self.phase = NewtonPhase::Iterating { iteration };
            state.begin_iteration();

            let linear = system.linearize(state);
            let increment = self.solve_linear(&linear, solver)?;
            if let Some(idx) = increment.iter().position(|v| !v.is_finite()) {
                return Err(NewtonFailure::NonFinite { cell: idx / nv });
            }

            let clamps = state.apply_increment(&increment, self.config.damping, |field| {
                system.bounds(field)
            });
            if !clamps.is_empty() {
                log::warn!(
                    "Newton iteration {iteration}: {} values clamped, first at cell {} field {}",
                    clamps.len(),
                    clamps[0].cell,
                    clamps[0].field,
                );
            }
            total_clamps += clamps.len();
            clamp_streaks = clamps
                .iter()
                .map(|c| {
                    let key = (c.cell, c.field);
                    (key, clamp_streaks.get(&key).copied().unwrap_or(0) + 1)
                })
                .collect();
            if let Some((&(cell, field), _)) = clamp_streaks
                .iter()
                .filter(|(_, &streak)| streak >= self.config.max_repeated_clamps)
                .min_by_key(|(key, _)| **key)
            {
                return Err(NewtonFailure::RepeatedClamp { cell, field });
            }

            match self.config.metric {
                ConvergenceMetric::MaxResidual => {
                    let residual = system.residual(state);
                    if let Some(idx) = residual.iter().position(|v| !v.is_finite()) {
                        return Err(NewtonFailure::NonFinite { cell: idx / nv });
                    }
                    metric = residual.amax();
                    worst_cell = (!residual.is_empty()).then(|| residual.iamax() / nv);
                }
                ConvergenceMetric::FieldMeanChange { field } => {
                    let mean = system.field_mean(state, field);
                    metric = (mean - previous_mean).abs();
                    previous_mean = mean;
                    worst_cell = (!increment.is_empty()).then(|| increment.iamax() / nv);
                }
            }
            log::debug!("Newton iteration {iteration}: metric {metric:e}");

            if metric < self.config.tolerance {
                return Ok(NewtonReport {
                    iterations: iteration,
                    metric,
                    clamps: total_clamps,
                });
            }
        }

        Err(NewtonFailure::Exhausted {
            iterations: self.config.max_iterations,
            metric,
            cell: worst_cell,
        })
    }

    /// Solve with the primary preconditioner,
    /// retrying once with the fallback if that fails.
    fn solve_linear<L: LinearSolver + ?Sized>(
        &self,
        system: &LinearSystem,
        solver: &mut L,
    ) -> Result<na::DVector<f64>, LinearSolveError> {
        match solver.solve(system, self.preconditioner) {
            Ok(x) => Ok(x),
            Err(err) => match self.fallback {
                Some(fallback) if fallback != self.preconditioner => {
                    log::warn!(
                        "Linear solve with {:?} failed ({err}), retrying with {fallback:?}",
                        self.preconditioner
                    );
                    solver.solve(system, fallback)
                }
                _ => Err(err),
            },
        }
    }
}
