//! The delta-method primitive every functional reduces to.
//!
//! For a scalar `g(θ)` over the free parameters, `Var(g) ≈ J Σ Jᵀ` with `J`
//! estimated by Richardson differences. The value is always returned; the
//! standard error is missing when `Σ` is unavailable, `J` is not finite, or
//! `J Σ Jᵀ` is negative beyond rounding.

use nalgebra::DMatrix;

use crate::math::{jacobian, quad_form};

/// Relative size of a negative `J Σ Jᵀ` still attributed to rounding.
const NEG_VARIANCE_TOL: f64 = 1e-10;

/// Value and propagated uncertainty of one functional.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEstimate {
    pub value: f64,
    /// `∂g/∂θ` at the estimates.
    pub jacobian: Vec<f64>,
    pub variance: Option<f64>,
}

impl DeltaEstimate {
    pub fn std_error(&self) -> Option<f64> {
        self.variance.map(f64::sqrt)
    }
}

/// Apply the delta method to `g` at `theta` with covariance `sigma`.
pub fn delta_method<G>(g: G, theta: &[f64], sigma: Option<&DMatrix<f64>>) -> DeltaEstimate
where
    G: Fn(&[f64]) -> f64,
{
    let value = g(theta);
    let jac = jacobian(&g, theta);

    let variance = sigma
        .filter(|s| s.nrows() == jac.len() && s.ncols() == jac.len())
        .filter(|_| jac.iter().all(|v| v.is_finite()))
        .and_then(|s| {
            let v = quad_form(&jac, s);
            // Rounding can leave a tiny negative quadratic form; anything
            // larger means Σ is not a covariance.
            let scale = jac.iter().map(|j| j * j).sum::<f64>() * s.amax();
            if !v.is_finite() || v < -NEG_VARIANCE_TOL * scale.max(f64::MIN_POSITIVE) {
                None
            } else {
                Some(v.max(0.0))
            }
        });

    DeltaEstimate {
        value,
        jacobian: jac,
        variance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_functional_is_exact() {
        // g = 2a - b, Var = 4 Var(a) + Var(b) - 4 Cov(a, b)
        let sigma = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.1, 0.2]);
        let est = delta_method(|p| 2.0 * p[0] - p[1], &[3.0, 1.0], Some(&sigma));
        assert_eq!(est.value, 5.0);
        assert_relative_eq!(est.variance.unwrap(), 2.0 + 0.2 - 0.4, epsilon = 1e-9);
    }

    #[test]
    fn missing_covariance_keeps_the_value() {
        let est = delta_method(|p| p[0] * p[0], &[3.0], None);
        assert_eq!(est.value, 9.0);
        assert!(est.std_error().is_none());
        assert_relative_eq!(est.jacobian[0], 6.0, epsilon = 1e-8);
    }

    #[test]
    fn negative_variance_is_missing_not_zero() {
        // LU inverse of the indefinite [[-1, 2], [2, -1]]: [1, -1] Σ [1, -1]^T = -2/3.
        let sigma = DMatrix::from_row_slice(2, 2, &[1.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0, 1.0 / 3.0]);
        let est = delta_method(|p| p[0] - p[1], &[1.0, 2.0], Some(&sigma));
        assert_eq!(est.value, -1.0);
        assert!(est.variance.is_none());
        assert!(est.std_error().is_none());
    }

    #[test]
    fn non_finite_jacobian_drops_the_error_only() {
        let sigma = DMatrix::identity(1, 1);
        let est = delta_method(|p| if p[0] > 1.0 { f64::NAN } else { p[0] }, &[1.0], Some(&sigma));
        assert_eq!(est.value, 1.0);
        assert!(est.variance.is_none());
    }
}
