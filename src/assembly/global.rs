use nalgebra as na;
use nalgebra_sparse as nas;

use super::LocalBlock;
use crate::mesh::Mesh;

/// A sparse linear system `matrix * dx = rhs` for one Newton iteration,
/// where `rhs` is the negated residual.
#[derive(Clone, Debug)]
pub struct LinearSystem {
    /// The Jacobian.
    pub matrix: nas::CsrMatrix<f64>,
    /// The negated residual.
    pub rhs: na::DVector<f64>,
}

impl LinearSystem {
    /// Number of unknowns.
    #[inline]
    pub fn dim(&self) -> usize {
        self.rhs.len()
    }

    /// Iterate over the nonzero coefficients as `(row, column, value)`.
    /// Every `(row, column)` pair appears at most once.
    pub fn triplets(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.matrix.triplet_iter().map(|(r, c, v)| (r, c, *v))
    }

    /// Compute `out = matrix * x`.
    pub fn mul_vec(&self, x: &[f64], out: &mut [f64]) {
        let offsets = self.matrix.row_offsets();
        let cols = self.matrix.col_indices();
        let vals = self.matrix.values();
        for (row, out_val) in out.iter_mut().enumerate() {
            *out_val = (offsets[row]..offsets[row + 1])
                .map(|k| vals[k] * x[cols[k]])
                .sum();
        }
    }

    /// Euclidean norm of `rhs - matrix * x`.
    pub fn residual_norm(&self, x: &[f64]) -> f64 {
        let mut ax = vec![0.0; self.dim()];
        self.mul_vec(x, &mut ax);
        ax.iter()
            .zip(self.rhs.iter())
            .map(|(a, b)| (b - a) * (b - a))
            .sum::<f64>()
            .sqrt()
    }
}

/// Scatters local blocks into a global sparse system.
///
/// The sparsity pattern is derived once from the cells' stencils
/// and reused for every Newton iteration; only the values change.
#[derive(Clone, Debug)]
pub struct GlobalAssembler {
    var_count: usize,
    pattern: nas::pattern::SparsityPattern,
}

impl GlobalAssembler {
    /// Build the pattern from the stencil of every cell, given in cell id order.
    pub fn new<I>(stencils: I, var_count: usize) -> Self
    where
        I: IntoIterator<Item = Vec<usize>>,
    {
        let mut offsets = vec![0];
        let mut indices = Vec::new();
        for mut stencil in stencils {
            stencil.sort_unstable();
            stencil.dedup();
            for _ in 0..var_count {
                for &col_cell in &stencil {
                    indices.extend((0..var_count).map(|b| col_cell * var_count + b));
                }
                offsets.push(indices.len());
            }
        }
        let dim = offsets.len() - 1;
        let pattern = nas::pattern::SparsityPattern::try_from_offsets_and_indices(
            dim, dim, offsets, indices,
        )
        .expect("Stencil columns are sorted and deduplicated");

        Self { var_count, pattern }
    }

    /// Build the pattern for every cell of a mesh.
    pub fn from_mesh(mesh: &Mesh, var_count: usize) -> Self {
        Self::new((0..mesh.len()).map(|id| mesh.stencil(id)), var_count)
    }

    /// Number of unknowns.
    #[inline]
    pub fn dim(&self) -> usize {
        self.pattern.major_dim()
    }

    /// Number of stored coefficients.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.pattern.nnz()
    }

    /// Scatter local blocks into a linear system.
    ///
    /// Every cell must contribute exactly one block
    /// whose stencil columns are contained in the pattern.
    /// Contributions to the same coefficient are summed.
    pub fn assemble(&self, blocks: &[LocalBlock]) -> LinearSystem {
        let nv = self.var_count;
        let offsets = self.pattern.major_offsets();
        let indices = self.pattern.minor_indices();
        let mut values = vec![0.0; self.nnz()];
        let mut rhs = na::DVector::zeros(self.dim());

        for block in blocks {
            for eq in 0..nv {
                let row = block.row * nv + eq;
                rhs[row] = -block.residual[eq];
                let lane = offsets[row]..offsets[row + 1];
                let lane_cols = &indices[lane.clone()];
                for (slot, &col_cell) in block.stencil.iter().enumerate() {
                    for field in 0..nv {
                        let pos = lane_cols
                            .binary_search(&(col_cell * nv + field))
                            .expect("Local stencil is part of the global pattern");
                        values[lane.start + pos] += block.jacobian[(eq, slot * nv + field)];
                    }
                }
            }
        }

        let matrix = nas::CsrMatrix::try_from_pattern_and_values(self.pattern.clone(), values)
            .expect("Values match the pattern");
        LinearSystem { matrix, rhs }
    }
}
