//! Forward-mode automatic differentiation on top of [`num_dual`].
//!
//! Residual expressions are written once, generic over [`Scalar`].
//! Evaluated with `f64` they give plain values,
//! evaluated with [`Dual64`]s seeded on one variable
//! they also give the derivative with respect to that variable.

use nalgebra as na;
use num_dual::DualNum;
use std::ops::{Add, Div, Mul, Sub};

pub use num_dual::Dual64;

/// A number type residual expressions can be evaluated with.
pub trait Scalar:
    DualNum<f64>
    + Copy
    + std::fmt::Debug
    + Send
    + Sync
    + 'static
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// A constant with zero derivatives.
    fn constant(v: f64) -> Self;

    /// The plain value, dropping any derivatives.
    #[inline]
    fn value(&self) -> f64 {
        self.re()
    }
}

impl Scalar for f64 {
    #[inline]
    fn constant(v: f64) -> Self {
        v
    }
}

impl Scalar for Dual64 {
    #[inline]
    fn constant(v: f64) -> Self {
        Dual64::from(v)
    }
}

/// `value` as the variable being differentiated against.
#[inline]
pub fn seed(value: f64) -> Dual64 {
    Dual64::new(value, 1.0)
}

/// Values and dense Jacobian of `f` at `x`.
///
/// Runs one sweep with every input constant for the values,
/// then one sweep per input seeding that input alone,
/// each giving a column of the Jacobian.
pub fn jacobian<F>(x: &[f64], f: F) -> (na::DVector<f64>, na::DMatrix<f64>)
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let mut vars: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
    let out = f(&vars);
    let values = na::DVector::from_iterator(out.len(), out.iter().map(|r| r.re));

    let mut jac = na::DMatrix::zeros(values.len(), x.len());
    for (col, &v) in x.iter().enumerate() {
        vars[col] = seed(v);
        for (row, r) in f(&vars).iter().enumerate() {
            jac[(row, col)] = r.eps;
        }
        vars[col] = Dual64::from(v);
    }
    (values, jac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A generic expression mixing every operation residuals use.
    fn expr<S: Scalar>(x: S, y: S) -> S {
        let a = x * y + x.exp() / (y + 2.0);
        let b = (x - y).powf(2.0) * 0.5 - y.ln();
        a - b + (x * 3.0).sqrt() + (-y) / 4.0
    }

    /// Derivatives match central finite differences of the plain-value evaluation.
    #[test]
    fn jacobian_matches_finite_differences() {
        let (x0, y0) = (0.7, 1.3);
        let (values, jac) = jacobian(&[x0, y0], |v| vec![expr(v[0], v[1]), v[0] * v[1]]);

        assert_relative_eq!(values[0], expr(x0, y0), epsilon = 1e-14);
        assert_relative_eq!(values[1], x0 * y0, epsilon = 1e-14);
        let h = 1e-6;
        let dx = (expr(x0 + h, y0) - expr(x0 - h, y0)) / (2.0 * h);
        let dy = (expr(x0, y0 + h) - expr(x0, y0 - h)) / (2.0 * h);
        assert_relative_eq!(jac[(0, 0)], dx, epsilon = 1e-7);
        assert_relative_eq!(jac[(0, 1)], dy, epsilon = 1e-7);
        assert_relative_eq!(jac[(1, 0)], y0, epsilon = 1e-14);
        assert_relative_eq!(jac[(1, 1)], x0, epsilon = 1e-14);
    }

    #[test]
    fn constants_carry_no_derivative() {
        let c = Dual64::constant(2.0);
        assert_eq!(c.eps, 0.0);
        assert_eq!(c.value(), 2.0);

        let x = seed(3.0);
        assert_eq!((c * x).eps, 2.0);
        assert_relative_eq!((c / x).eps, -2.0 / 9.0);
        assert_eq!((x * 2.0 + 1.0).value(), 7.0);

        let (values, jac) = jacobian(&[], |_| vec![Dual64::constant(1.0)]);
        assert_eq!(values.len(), 1);
        assert_eq!(jac.shape(), (1, 0));
    }
}
