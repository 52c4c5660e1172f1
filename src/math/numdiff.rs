//! Numerical differentiation.
//!
//! - `richardson`: first/second derivative of a scalar function of one variable,
//!   Richardson-extrapolated central differences.
//! - `jacobian`: partial derivatives of a scalar functional `g(θ)` with respect to
//!   every coordinate of `θ`, using the same Richardson scheme per coordinate.
//! - `central_gradient` / `hessian`: plain central differences of a loss, used by
//!   the solvers.
//!
//! Step sizes depend only on the evaluation point, never on call history, so a
//! given input always yields the same output.

use nalgebra::DMatrix;

/// Relative initial step for Richardson differences.
const RICH_D: f64 = 1e-4;
/// Absolute initial step used when the evaluation point is (near) zero.
const RICH_EPS: f64 = 1e-4;
/// Below this magnitude a coordinate counts as zero for step selection.
const RICH_ZERO_TOL: f64 = 1.781_447_1e-5;
/// Number of Richardson levels.
const RICH_LEVELS: usize = 4;
/// Step reduction factor between levels.
const RICH_SHRINK: f64 = 2.0;

/// Derivative order supported by [`richardson`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivOrder {
    First,
    Second,
}

impl DerivOrder {
    pub fn from_u8(order: u8) -> Option<Self> {
        match order {
            1 => Some(DerivOrder::First),
            2 => Some(DerivOrder::Second),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            DerivOrder::First => 1,
            DerivOrder::Second => 2,
        }
    }
}

fn initial_step(x: f64) -> f64 {
    if x.abs() < RICH_ZERO_TOL {
        RICH_EPS
    } else {
        RICH_D * x.abs()
    }
}

/// Richardson-extrapolated derivative of `f` at `x`.
///
/// Both orders use central differences whose error expands in even powers of
/// `h`, so each extrapolation level removes the next `h^2m` term.
pub fn richardson<F>(f: F, x: f64, order: DerivOrder) -> f64
where
    F: Fn(f64) -> f64,
{
    let f0 = match order {
        DerivOrder::First => 0.0,
        DerivOrder::Second => f(x),
    };

    let mut h = initial_step(x);
    let mut a = [0.0_f64; RICH_LEVELS];
    for slot in a.iter_mut() {
        let fp = f(x + h);
        let fm = f(x - h);
        *slot = match order {
            DerivOrder::First => (fp - fm) / (2.0 * h),
            DerivOrder::Second => (fp - 2.0 * f0 + fm) / (h * h),
        };
        h /= RICH_SHRINK;
    }

    let ratio = RICH_SHRINK * RICH_SHRINK;
    for m in 1..RICH_LEVELS {
        let w = ratio.powi(m as i32);
        for k in 0..(RICH_LEVELS - m) {
            a[k] = (a[k + 1] * w - a[k]) / (w - 1.0);
        }
    }
    a[0]
}

/// Gradient of a scalar functional `g(θ)` by Richardson differences per coordinate.
///
/// This is the 1×p Jacobian used by the delta method.
pub fn jacobian<G>(g: G, theta: &[f64]) -> Vec<f64>
where
    G: Fn(&[f64]) -> f64,
{
    (0..theta.len())
        .map(|j| {
            richardson(
                |v| {
                    let mut p = theta.to_vec();
                    p[j] = v;
                    g(&p)
                },
                theta[j],
                DerivOrder::First,
            )
        })
        .collect()
}

/// Central-difference gradient of a loss.
pub fn central_gradient<F>(f: F, x: &[f64]) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut work = x.to_vec();
    let mut grad = Vec::with_capacity(x.len());
    for i in 0..x.len() {
        // cbrt(machine eps) is the balanced step for central differences.
        let h = 6.0e-6 * x[i].abs().max(1.0);
        work[i] = x[i] + h;
        let fp = f(&work);
        work[i] = x[i] - h;
        let fm = f(&work);
        work[i] = x[i];
        grad.push((fp - fm) / (2.0 * h));
    }
    grad
}

/// Central-difference Hessian of a loss at `x`, symmetrised.
///
/// Returns `None` if any entry is non-finite.
pub fn hessian<F>(f: F, x: &[f64]) -> Option<DMatrix<f64>>
where
    F: Fn(&[f64]) -> f64,
{
    let n = x.len();
    let steps: Vec<f64> = x.iter().map(|v| 1e-4 * v.abs().max(1.0)).collect();
    let f0 = f(x);
    let mut work = x.to_vec();
    let mut h = DMatrix::<f64>::zeros(n, n);

    for i in 0..n {
        let hi = steps[i];
        work[i] = x[i] + hi;
        let fp = f(&work);
        work[i] = x[i] - hi;
        let fm = f(&work);
        work[i] = x[i];
        h[(i, i)] = (fp - 2.0 * f0 + fm) / (hi * hi);

        for j in (i + 1)..n {
            let hj = steps[j];
            let mut corner = |si: f64, sj: f64| {
                work[i] = x[i] + si * hi;
                work[j] = x[j] + sj * hj;
                let v = f(&work);
                work[i] = x[i];
                work[j] = x[j];
                v
            };
            let fpp = corner(1.0, 1.0);
            let fpm = corner(1.0, -1.0);
            let fmp = corner(-1.0, 1.0);
            let fmm = corner(-1.0, -1.0);
            let v = (fpp - fpm - fmp + fmm) / (4.0 * hi * hj);
            h[(i, j)] = v;
            h[(j, i)] = v;
        }
    }

    if h.iter().all(|v| v.is_finite()) {
        Some(h)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn richardson_matches_analytic_derivatives() {
        let f = |x: f64| x.sin() * x.exp();
        let x = 0.7_f64;
        let d1 = x.exp() * (x.sin() + x.cos());
        let d2 = 2.0 * x.exp() * x.cos();
        assert!((richardson(f, x, DerivOrder::First) - d1).abs() < 1e-9);
        assert!((richardson(f, x, DerivOrder::Second) - d2).abs() < 1e-6);
    }

    #[test]
    fn richardson_handles_zero_point() {
        let d = richardson(|x| 3.0 * x + 1.0, 0.0, DerivOrder::First);
        assert!((d - 3.0).abs() < 1e-10);
    }

    #[test]
    fn richardson_is_deterministic() {
        let f = |x: f64| (1.0 + x * x).ln();
        let a = richardson(f, 2.5, DerivOrder::First);
        let b = richardson(f, 2.5, DerivOrder::First);
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn jacobian_of_product() {
        let g = |p: &[f64]| p[0] * p[1] + p[1];
        let j = jacobian(g, &[2.0, 5.0]);
        assert!((j[0] - 5.0).abs() < 1e-8);
        assert!((j[1] - 3.0).abs() < 1e-8);
    }

    #[test]
    fn hessian_of_quadratic() {
        // f = (x - 2)^2 + 3 (y + 1)^2 + x y
        let f = |p: &[f64]| (p[0] - 2.0).powi(2) + 3.0 * (p[1] + 1.0).powi(2) + p[0] * p[1];
        let h = hessian(f, &[1.0, 4.0]).unwrap();
        assert!((h[(0, 0)] - 2.0).abs() < 1e-4);
        assert!((h[(1, 1)] - 6.0).abs() < 1e-4);
        assert!((h[(0, 1)] - 1.0).abs() < 1e-4);
        assert_eq!(h[(0, 1)], h[(1, 0)]);
    }

    #[test]
    fn central_gradient_of_quadratic() {
        let g = central_gradient(|p: &[f64]| p[0] * p[0] + 4.0 * p[1], &[3.0, -1.0]);
        assert!((g[0] - 6.0).abs() < 1e-6);
        assert!((g[1] - 4.0).abs() < 1e-6);
    }
}
