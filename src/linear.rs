//! Linear solvers for the sparse system of each Newton iteration.
//!
//! A [`LinearSolver`] takes the assembled [`LinearSystem`]
//! and a [`Preconditioner`] choice and returns the increment vector.
//! Failures are reported as [`LinearSolveError`]s,
//! which the Newton driver treats as recoverable.

use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::{assembly::LinearSystem, config::LinearSolverConfig};

/// Error in solving a linear system.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LinearSolveError {
    /// The matrix is singular to working precision.
    #[error("Singular matrix")]
    Singular,
    /// The iteration broke down on a vanishing inner product.
    #[error("Iteration broke down after {iterations} iterations")]
    Breakdown {
        /// Iterations completed before the breakdown.
        iterations: usize,
    },
    /// The iteration limit was reached.
    #[error("No convergence in {iterations} iterations, residual norm {residual:e}")]
    NotConverged {
        /// Iterations run.
        iterations: usize,
        /// Final residual norm.
        residual: f64,
    },
    /// The matrix and right-hand side sizes disagree.
    #[error("Matrix has {rows} rows but right-hand side has {rhs} entries")]
    DimensionMismatch {
        /// Rows of the matrix.
        rows: usize,
        /// Length of the right-hand side.
        rhs: usize,
    },
    /// The solution contains NaN or infinite values.
    #[error("Solution is not finite")]
    NonFinite,
}

/// Preconditioner applied by iterative solvers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preconditioner {
    /// No preconditioning.
    None,
    /// Inverse of the diagonal.
    Jacobi,
    /// Incomplete LU factorization with the matrix's own sparsity pattern.
    #[default]
    Ilu0,
}

/// Something that solves `matrix * x = rhs`.
pub trait LinearSolver {
    /// Solve the system using the given preconditioner if applicable.
    fn solve(
        &mut self,
        system: &LinearSystem,
        preconditioner: Preconditioner,
    ) -> Result<na::DVector<f64>, LinearSolveError>;
}

fn check_dims(system: &LinearSystem) -> Result<usize, LinearSolveError> {
    let rows = system.matrix.nrows();
    if rows != system.rhs.len() || system.matrix.ncols() != rows {
        return Err(LinearSolveError::DimensionMismatch {
            rows,
            rhs: system.rhs.len(),
        });
    }
    Ok(rows)
}

fn finite(x: na::DVector<f64>) -> Result<na::DVector<f64>, LinearSolveError> {
    if x.iter().all(|v| v.is_finite()) {
        Ok(x)
    } else {
        Err(LinearSolveError::NonFinite)
    }
}

//
// dense
//

/// Direct solve by dense LU decomposition with partial pivoting.
/// Only suitable for small systems; ignores the preconditioner.
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn solve(
        &mut self,
        system: &LinearSystem,
        _preconditioner: Preconditioner,
    ) -> Result<na::DVector<f64>, LinearSolveError> {
        let n = check_dims(system)?;
        let mut dense = na::DMatrix::zeros(n, n);
        for (r, c, v) in system.triplets() {
            dense[(r, c)] += v;
        }
        let x = dense
            .lu()
            .solve(&system.rhs)
            .ok_or(LinearSolveError::Singular)?;
        finite(x)
    }
}

//
// preconditioners
//

trait Precondition {
    /// Compute `z = M⁻¹ r`.
    fn apply(&self, r: &[f64], z: &mut [f64]);
}

struct Identity;

impl Precondition for Identity {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        z.copy_from_slice(r);
    }
}

struct Jacobi {
    inv_diagonal: Vec<f64>,
}

impl Jacobi {
    fn new(matrix: &nalgebra_sparse::CsrMatrix<f64>) -> Self {
        let mut diagonal = vec![0.0; matrix.nrows()];
        for (r, c, v) in matrix.triplet_iter() {
            if r == c {
                diagonal[r] += *v;
            }
        }
        // zero diagonal entries are left unscaled
        let inv_diagonal = diagonal
            .into_iter()
            .map(|d| if d.abs() > f64::MIN_POSITIVE { 1.0 / d } else { 1.0 })
            .collect();
        Self { inv_diagonal }
    }
}

impl Precondition for Jacobi {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        for ((z, r), d) in z.iter_mut().zip(r).zip(&self.inv_diagonal) {
            *z = r * d;
        }
    }
}

/// ILU(0): L and U share the matrix's sparsity pattern and storage,
/// L with an implicit unit diagonal.
struct Ilu0 {
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    lu: Vec<f64>,
    diag: Vec<usize>,
}

impl Ilu0 {
    /// Pivots smaller than this are replaced by it, keeping the sign.
    const PIVOT_TOL: f64 = 1e-12;

    fn new(matrix: &nalgebra_sparse::CsrMatrix<f64>) -> Result<Self, LinearSolveError> {
        let n = matrix.nrows();
        let row_offsets = matrix.row_offsets().to_vec();
        let col_indices = matrix.col_indices().to_vec();
        let mut lu = matrix.values().to_vec();

        let mut diag = Vec::with_capacity(n);
        for i in 0..n {
            let row = &col_indices[row_offsets[i]..row_offsets[i + 1]];
            let pos = row
                .binary_search(&i)
                .map_err(|_| LinearSolveError::Singular)?;
            diag.push(row_offsets[i] + pos);
        }

        for i in 1..n {
            for k_idx in row_offsets[i]..diag[i] {
                let k = col_indices[k_idx];
                let mut pivot = lu[diag[k]];
                if pivot.abs() < Self::PIVOT_TOL {
                    pivot = Self::PIVOT_TOL.copysign(pivot);
                    lu[diag[k]] = pivot;
                }
                let factor = lu[k_idx] / pivot;
                lu[k_idx] = factor;

                // row i -= factor * row k, restricted to the pattern of row i
                let mut m_idx = diag[k] + 1;
                for j_idx in (k_idx + 1)..row_offsets[i + 1] {
                    let j = col_indices[j_idx];
                    while m_idx < row_offsets[k + 1] && col_indices[m_idx] < j {
                        m_idx += 1;
                    }
                    if m_idx < row_offsets[k + 1] && col_indices[m_idx] == j {
                        lu[j_idx] -= factor * lu[m_idx];
                    }
                }
            }
        }
        if let Some(&last) = diag.last() {
            if lu[last].abs() < Self::PIVOT_TOL {
                lu[last] = Self::PIVOT_TOL.copysign(lu[last]);
            }
        }

        Ok(Self {
            row_offsets,
            col_indices,
            lu,
            diag,
        })
    }
}

impl Precondition for Ilu0 {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        let n = r.len();
        // forward: L y = r
        for i in 0..n {
            let mut sum = r[i];
            for k in self.row_offsets[i]..self.diag[i] {
                sum -= self.lu[k] * z[self.col_indices[k]];
            }
            z[i] = sum;
        }
        // backward: U z = y
        for i in (0..n).rev() {
            let mut sum = z[i];
            for k in (self.diag[i] + 1)..self.row_offsets[i + 1] {
                sum -= self.lu[k] * z[self.col_indices[k]];
            }
            z[i] = sum / self.lu[self.diag[i]];
        }
    }
}

//
// BiCGStab
//

/// Preconditioned BiCGStab for general nonsymmetric sparse systems.
#[derive(Clone, Debug, Default)]
pub struct BiCgStab {
    config: LinearSolverConfig,
}

impl BiCgStab {
    /// Create a solver with the given iteration limit and tolerances.
    pub fn new(config: LinearSolverConfig) -> Self {
        Self { config }
    }

    /// The solver's configuration.
    pub fn config(&self) -> &LinearSolverConfig {
        &self.config
    }

    fn iterate<P: Precondition>(
        &self,
        system: &LinearSystem,
        precond: &P,
    ) -> Result<na::DVector<f64>, LinearSolveError> {
        let n = system.dim();
        let b = system.rhs.as_slice();
        let dot = |a: &[f64], b: &[f64]| -> f64 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        let norm = |a: &[f64]| dot(a, a).sqrt();
        const BREAKDOWN: f64 = 1e-300;
        // inner products this small relative to their factors count as orthogonal
        const ORTHOGONAL: f64 = 1e-12;
        const MAX_RESTARTS: usize = 10;

        let mut x = vec![0.0; n];
        let mut r = b.to_vec();
        let initial_norm = norm(&r);
        if initial_norm <= self.config.absolute_tolerance {
            return Ok(na::DVector::from_vec(x));
        }
        let mut r0 = r.clone();
        let (mut p, mut v) = (vec![0.0; n], vec![0.0; n]);
        let (mut s, mut t) = (vec![0.0; n], vec![0.0; n]);
        let (mut p_hat, mut s_hat) = (vec![0.0; n], vec![0.0; n]);
        let (mut rho_old, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut fresh = true;
        let mut restarts = 0;

        for iter in 0..self.config.max_iterations {
            let mut rho = dot(&r0, &r);
            if rho.abs() <= ORTHOGONAL * norm(&r0) * norm(&r) {
                // the shadow residual has lost the residual,
                // start over from the current iterate
                if restarts == MAX_RESTARTS {
                    return Err(LinearSolveError::Breakdown { iterations: iter });
                }
                restarts += 1;
                log::trace!("BiCGStab restarted at iteration {iter}");
                r0.copy_from_slice(&r);
                rho = dot(&r0, &r);
                fresh = true;
            }
            let beta = if fresh {
                0.0
            } else {
                (rho / rho_old) * (alpha / omega)
            };
            let started_fresh = fresh;
            fresh = false;
            rho_old = rho;
            for i in 0..n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
            }

            precond.apply(&p, &mut p_hat);
            system.mul_vec(&p_hat, &mut v);
            let r0v = dot(&r0, &v);
            if r0v.abs() <= ORTHOGONAL * norm(&r0) * norm(&v) {
                if started_fresh || restarts == MAX_RESTARTS {
                    return Err(LinearSolveError::Breakdown { iterations: iter });
                }
                restarts += 1;
                log::trace!("BiCGStab restarted at iteration {iter}");
                r0.copy_from_slice(&r);
                fresh = true;
                continue;
            }
            alpha = rho / r0v;
            for i in 0..n {
                s[i] = r[i] - alpha * v[i];
            }

            let s_norm = norm(&s);
            if s_norm <= self.config.absolute_tolerance
                || s_norm <= self.config.relative_tolerance * initial_norm
            {
                for i in 0..n {
                    x[i] += alpha * p_hat[i];
                }
                log::trace!("BiCGStab converged in {} iterations, residual {s_norm:e}", iter + 1);
                return finite(na::DVector::from_vec(x));
            }

            precond.apply(&s, &mut s_hat);
            system.mul_vec(&s_hat, &mut t);
            let tt = dot(&t, &t);
            if tt < BREAKDOWN {
                return Err(LinearSolveError::Breakdown { iterations: iter });
            }
            omega = dot(&t, &s) / tt;
            for i in 0..n {
                x[i] += alpha * p_hat[i] + omega * s_hat[i];
                r[i] = s[i] - omega * t[i];
            }

            let res_norm = norm(&r);
            log::trace!("BiCGStab iteration {}: residual {res_norm:e}", iter + 1);
            if res_norm <= self.config.absolute_tolerance
                || res_norm <= self.config.relative_tolerance * initial_norm
            {
                return finite(na::DVector::from_vec(x));
            }
            if omega.abs() < BREAKDOWN {
                if restarts == MAX_RESTARTS {
                    return Err(LinearSolveError::Breakdown { iterations: iter + 1 });
                }
                restarts += 1;
                log::trace!("BiCGStab restarted after iteration {}", iter + 1);
                r0.copy_from_slice(&r);
                fresh = true;
            }
        }

        Err(LinearSolveError::NotConverged {
            iterations: self.config.max_iterations,
            residual: norm(&r),
        })
    }
}

impl LinearSolver for BiCgStab {
    fn solve(
        &mut self,
        system: &LinearSystem,
        preconditioner: Preconditioner,
    ) -> Result<na::DVector<f64>, LinearSolveError> {
        let n = check_dims(system)?;
        let result = match preconditioner {
            Preconditioner::None => self.iterate(system, &Identity),
            Preconditioner::Jacobi => self.iterate(system, &Jacobi::new(&system.matrix)),
            Preconditioner::Ilu0 => self.iterate(system, &Ilu0::new(&system.matrix)?),
        };
        match result {
            Err(err @ (LinearSolveError::Breakdown { .. } | LinearSolveError::NotConverged { .. }))
                if n <= self.config.direct_fallback_size =>
            {
                log::warn!("BiCGStab with {preconditioner:?} failed ({err}), solving {n} unknowns directly");
                DenseLu.solve(system, preconditioner)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{GlobalAssembler, LocalBlock};
    use approx::assert_relative_eq;

    /// A nonsymmetric tridiagonal system with a known solution.
    fn tridiagonal(n: usize) -> (LinearSystem, na::DVector<f64>) {
        let asm = GlobalAssembler::new(
            (0..n).map(|i| (i.saturating_sub(1)..(i + 2).min(n)).collect::<Vec<usize>>()),
            1,
        );
        let expected = na::DVector::from_fn(n, |i, _| 1.0 + (i as f64 * 0.7).sin());
        let blocks: Vec<LocalBlock> = (0..n)
            .map(|i| {
                let stencil: Vec<usize> = (i.saturating_sub(1)..(i + 2).min(n)).collect();
                let coeffs: Vec<f64> = stencil
                    .iter()
                    .map(|&j| match j.cmp(&i) {
                        std::cmp::Ordering::Less => -1.0,
                        std::cmp::Ordering::Equal => 4.0,
                        std::cmp::Ordering::Greater => -2.0,
                    })
                    .collect();
                let ax: f64 = stencil.iter().zip(&coeffs).map(|(&j, c)| c * expected[j]).sum();
                LocalBlock {
                    row: i,
                    residual: na::DVector::from_element(1, -ax),
                    jacobian: na::DMatrix::from_row_slice(1, coeffs.len(), &coeffs),
                    stencil,
                }
            })
            .collect();
        (asm.assemble(&blocks), expected)
    }

    /// A system with every entry of `rows` stored, zeros included.
    fn dense_system(rows: &[&[f64]], rhs: &[f64]) -> LinearSystem {
        let n = rows.len();
        let asm = GlobalAssembler::new((0..n).map(|_| (0..n).collect::<Vec<usize>>()), 1);
        let blocks: Vec<LocalBlock> = rows
            .iter()
            .zip(rhs)
            .enumerate()
            .map(|(i, (row, &b))| LocalBlock {
                row: i,
                stencil: (0..n).collect(),
                residual: na::DVector::from_element(1, -b),
                jacobian: na::DMatrix::from_row_slice(1, n, row),
            })
            .collect();
        asm.assemble(&blocks)
    }

    #[test]
    fn bicgstab_solves_with_every_preconditioner() {
        let (system, expected) = tridiagonal(40);
        let mut solver = BiCgStab::default();
        for pre in [Preconditioner::None, Preconditioner::Jacobi, Preconditioner::Ilu0] {
            let x = solver.solve(&system, pre).unwrap();
            for (a, b) in x.iter().zip(expected.iter()) {
                assert_relative_eq!(a, b, epsilon = 1e-8);
            }
        }
    }

    /// ILU(0) of a tridiagonal matrix is its exact LU factorization.
    #[test]
    fn ilu0_is_exact_for_tridiagonal() {
        let (system, expected) = tridiagonal(10);
        let ilu = Ilu0::new(&system.matrix).unwrap();
        let mut z = vec![0.0; 10];
        ilu.apply(system.rhs.as_slice(), &mut z);
        for (a, b) in z.iter().zip(expected.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn dense_lu_matches_and_detects_singularity() {
        let (system, expected) = tridiagonal(8);
        let x = DenseLu.solve(&system, Preconditioner::None).unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-12);

        let asm = GlobalAssembler::new(vec![vec![0, 1], vec![0, 1]], 1);
        let singular = asm.assemble(&[
            LocalBlock {
                row: 0,
                stencil: vec![0, 1],
                residual: na::DVector::from_element(1, 1.0),
                jacobian: na::DMatrix::from_row_slice(1, 2, &[1.0, 2.0]),
            },
            LocalBlock {
                row: 1,
                stencil: vec![0, 1],
                residual: na::DVector::from_element(1, 1.0),
                jacobian: na::DMatrix::from_row_slice(1, 2, &[2.0, 4.0]),
            },
        ]);
        assert_eq!(
            DenseLu.solve(&singular, Preconditioner::None),
            Err(LinearSolveError::Singular)
        );
    }

    #[test]
    fn iteration_limit_is_reported() {
        let (system, expected) = tridiagonal(40);
        let mut solver = BiCgStab::new(LinearSolverConfig {
            max_iterations: 1,
            direct_fallback_size: 0,
            ..Default::default()
        });
        assert!(matches!(
            solver.solve(&system, Preconditioner::None),
            Err(LinearSolveError::NotConverged { iterations: 1, .. })
        ));

        // small enough to be solved directly instead
        let mut solver = BiCgStab::new(LinearSolverConfig {
            max_iterations: 1,
            ..Default::default()
        });
        let x = solver.solve(&system, Preconditioner::None).unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-12);
    }

    /// An identity row satisfied after the first iteration
    /// leaves the initial shadow residual orthogonal to every later residual.
    #[test]
    fn bicgstab_restarts_on_lost_shadow_residual() {
        let system = dense_system(
            &[&[1.0, 0.0, 0.0], &[-1.0, 2.0, -0.5], &[0.0, -1.0, 3.0]],
            &[1.0, 0.0, 0.0],
        );
        let expected = DenseLu.solve(&system, Preconditioner::None).unwrap();
        let mut solver = BiCgStab::new(LinearSolverConfig {
            direct_fallback_size: 0,
            ..Default::default()
        });
        for pre in [Preconditioner::Jacobi, Preconditioner::Ilu0] {
            let x = solver.solve(&system, pre).unwrap();
            assert_relative_eq!(x, expected, epsilon = 1e-8);
        }
    }
}
