//! Triple-buffered per-cell state.
//!
//! Every cell holds a fixed-size field vector three times:
//! `previous` is the last converged time step,
//! `iterate` the Newton iterate property lookups are frozen at during one iteration,
//! and `next` the candidate mutated by Newton updates.
//! The unknown of field `f` of cell `c` lives at index `c * var_count + f`.

use nalgebra as na;

use crate::{
    mesh::{CellType, Mesh},
    model::FieldBounds,
    Vec2,
};

/// A field value that was forced back into its bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Clamp {
    /// Id of the cell.
    pub cell: usize,
    /// Index of the field.
    pub field: usize,
    /// The out-of-bounds value before clamping.
    pub value: f64,
}

/// Exported state of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellSnapshot {
    /// Cell id.
    pub id: usize,
    /// Cell type.
    pub cell_type: CellType,
    /// Cell center.
    pub centroid: Vec2,
    /// Cell volume.
    pub volume: f64,
    /// Current field values.
    pub values: Vec<f64>,
}

/// Per-cell state in three buffers.
#[derive(Clone, Debug)]
pub struct StateStore {
    var_count: usize,
    previous: na::DVector<f64>,
    iterate: na::DVector<f64>,
    next: na::DVector<f64>,
}

impl StateStore {
    /// Create a store where every cell starts from the same field vector.
    pub fn new(cell_count: usize, initial: &[f64]) -> Self {
        let var_count = initial.len();
        let values = na::DVector::from_fn(cell_count * var_count, |i, _| initial[i % var_count]);
        Self {
            var_count,
            previous: values.clone(),
            iterate: values.clone(),
            next: values,
        }
    }

    /// Number of fields per cell.
    #[inline]
    pub fn var_count(&self) -> usize {
        self.var_count
    }

    /// Number of cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.next.len() / self.var_count
    }

    /// Overwrite one cell's state in all three buffers,
    /// e.g. to set up a non-uniform initial condition.
    pub fn set_cell(&mut self, cell: usize, values: &[f64]) {
        let range = self.range(cell);
        for buf in [&mut self.previous, &mut self.iterate, &mut self.next] {
            buf.as_mut_slice()[range.clone()].copy_from_slice(values);
        }
    }

    #[inline]
    fn range(&self, cell: usize) -> std::ops::Range<usize> {
        cell * self.var_count..(cell + 1) * self.var_count
    }

    /// Fields of a cell at the last converged time step.
    #[inline]
    pub fn previous(&self, cell: usize) -> &[f64] {
        &self.previous.as_slice()[self.range(cell)]
    }

    /// Fields of a cell at the current Newton iterate.
    #[inline]
    pub fn iterate(&self, cell: usize) -> &[f64] {
        &self.iterate.as_slice()[self.range(cell)]
    }

    /// Current candidate fields of a cell.
    #[inline]
    pub fn next(&self, cell: usize) -> &[f64] {
        &self.next.as_slice()[self.range(cell)]
    }

    /// Mutable access to a cell's candidate fields.
    #[inline]
    pub fn next_mut(&mut self, cell: usize) -> &mut [f64] {
        let range = self.range(cell);
        &mut self.next.as_mut_slice()[range]
    }

    /// The whole candidate vector.
    #[inline]
    pub fn next_values(&self) -> &na::DVector<f64> {
        &self.next
    }

    /// Freeze the candidate as the iterate at the start of a Newton iteration.
    pub fn begin_iteration(&mut self) {
        self.iterate.copy_from(&self.next);
    }

    /// Accept the candidate as the new converged state.
    pub fn commit(&mut self) {
        self.previous.copy_from(&self.next);
        self.iterate.copy_from(&self.next);
    }

    /// Discard the candidate and return to the last converged state,
    /// for retrying a time step.
    pub fn rollback(&mut self) {
        self.next.copy_from(&self.previous);
        self.iterate.copy_from(&self.previous);
    }

    /// Add `damping * increment` to the candidate,
    /// clamping every field into the bounds given for it.
    /// Returns the clamped entries.
    pub fn apply_increment(
        &mut self,
        increment: &na::DVector<f64>,
        damping: f64,
        bounds: impl Fn(usize) -> FieldBounds,
    ) -> Vec<Clamp> {
        let mut clamps = Vec::new();
        for (idx, (value, delta)) in self.next.iter_mut().zip(increment.iter()).enumerate() {
            let field = idx % self.var_count;
            let (clamped, changed) = bounds(field).clamp(*value + damping * delta);
            if changed {
                clamps.push(Clamp {
                    cell: idx / self.var_count,
                    field,
                    value: *value + damping * delta,
                });
            }
            *value = clamped;
        }
        clamps
    }

    /// Current candidate state of every cell together with its geometry.
    pub fn export<'a>(&'a self, mesh: &'a Mesh) -> impl Iterator<Item = CellSnapshot> + 'a {
        mesh.cells().iter().map(move |cell| CellSnapshot {
            id: cell.id,
            cell_type: cell.cell_type,
            centroid: cell.centroid,
            volume: cell.volume,
            values: self.next(cell.id).to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_lifecycle() {
        let mut state = StateStore::new(3, &[1.0, 0.5]);
        assert_eq!(state.cell_count(), 3);
        assert_eq!(state.next(2), &[1.0, 0.5]);

        let dx = na::DVector::from_vec(vec![0.1, 0.0, 0.2, 0.1, 0.0, -0.1]);
        state.apply_increment(&dx, 1.0, |_| FieldBounds::UNBOUNDED);
        assert_eq!(state.next(1), &[1.2, 0.6]);
        assert_eq!(state.iterate(1), &[1.0, 0.5], "iterate changed before begin");

        state.begin_iteration();
        assert_eq!(state.iterate(1), &[1.2, 0.6]);
        assert_eq!(state.previous(1), &[1.0, 0.5]);

        state.rollback();
        assert_eq!(state.next(1), &[1.0, 0.5]);
        assert_eq!(state.iterate(1), &[1.0, 0.5]);

        state.apply_increment(&dx, 0.5, |_| FieldBounds::UNBOUNDED);
        state.commit();
        approx::assert_relative_eq!(state.previous(0)[0], 1.05);
        approx::assert_relative_eq!(state.iterate(0)[0], 1.05);
        assert_eq!(state.previous(0)[1], 0.5);
    }

    #[test]
    fn clamps_are_reported() {
        let mut state = StateStore::new(2, &[1.0, 0.9]);
        state.set_cell(0, &[0.1, 0.5]);
        let dx = na::DVector::from_vec(vec![-0.5, 0.0, 0.0, 0.3]);
        let clamps = state.apply_increment(&dx, 1.0, |field| {
            if field == 0 {
                FieldBounds::NONNEGATIVE
            } else {
                FieldBounds::UNIT
            }
        });

        assert_eq!(clamps.len(), 2);
        assert_eq!((clamps[0].cell, clamps[0].field), (0, 0));
        assert_eq!((clamps[1].cell, clamps[1].field), (1, 1));
        assert_eq!(state.next(0), &[0.0, 0.5]);
        assert_eq!(state.next(1), &[1.0, 1.0]);
    }
}
