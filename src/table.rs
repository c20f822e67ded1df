//! Piecewise-linear property tables.

use serde::{Deserialize, Serialize};

use crate::autodiff::Scalar;

/// Error in constructing a [`Table`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TableError {
    /// A table needs at least one point.
    #[error("Table has no points")]
    Empty,
    /// Abscissae must be strictly increasing.
    #[error("Table abscissae not strictly increasing at index {index}")]
    NotIncreasing {
        /// Index of the first offending point.
        index: usize,
    },
    /// A point is not a finite number.
    #[error("Table point {index} is not finite")]
    NonFinite {
        /// Index of the offending point.
        index: usize,
    },
}

/// A function given as points `(x, y)`,
/// interpolated linearly between them and extrapolated as a constant outside.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(f64, f64)>", into = "Vec<(f64, f64)>")]
pub struct Table {
    points: Vec<(f64, f64)>,
}

impl Table {
    /// Create a table from points sorted by strictly increasing `x`.
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self, TableError> {
        if points.is_empty() {
            return Err(TableError::Empty);
        }
        if let Some(index) = points
            .iter()
            .position(|(x, y)| !(x.is_finite() && y.is_finite()))
        {
            return Err(TableError::NonFinite { index });
        }
        if let Some(index) = points.windows(2).position(|w| w[1].0 <= w[0].0) {
            return Err(TableError::NotIncreasing { index: index + 1 });
        }
        Ok(Self { points })
    }

    /// The table `y = x` on `[0, 1]`, clamped outside.
    pub fn unit_linear() -> Self {
        Self {
            points: vec![(0.0, 0.0), (1.0, 1.0)],
        }
    }

    /// The points of the table.
    #[inline]
    pub fn points(&self) -> &[(f64, f64)] {
        &self.points
    }

    /// Evaluate the table at `x`.
    ///
    /// The segment is chosen by the plain value of `x`,
    /// so derivatives are those of the selected segment
    /// and zero in the constant extrapolation regions.
    pub fn eval<S: Scalar>(&self, x: S) -> S {
        let xv = x.value();
        let (first, last) = (self.points[0], self.points[self.points.len() - 1]);
        if xv <= first.0 {
            return S::constant(first.1);
        }
        if xv >= last.0 {
            return S::constant(last.1);
        }
        // first point with x strictly greater, guaranteed to be in 1..len
        let upper = self.points.partition_point(|(px, _)| *px <= xv);
        let (x0, y0) = self.points[upper - 1];
        let (x1, y1) = self.points[upper];
        let slope = (y1 - y0) / (x1 - x0);
        (x - x0) * slope + y0
    }
}

impl TryFrom<Vec<(f64, f64)>> for Table {
    type Error = TableError;

    fn try_from(points: Vec<(f64, f64)>) -> Result<Self, Self::Error> {
        Self::new(points)
    }
}

impl From<Table> for Vec<(f64, f64)> {
    fn from(table: Table) -> Self {
        table.points
    }
}
