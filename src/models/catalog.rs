//! Built-in curve shapes.
//!
//! These are plain evaluators; the fitting and inference layers never look
//! inside them beyond the registered parameter names.

use super::curve::Curve;

/// Below this |x| the Nelson–Siegel basis switches to its series form.
const NS_SMALL_X: f64 = 1e-6;

/// All built-in curves.
pub fn builtin_curves() -> Vec<Curve> {
    [
        Curve::new("linear", &["m", "b"], linear),
        Curve::new("quadratic", &["a", "b", "c"], quadratic),
        Curve::new("exponential", &["a", "r"], exponential),
        Curve::new("logistic", &["a", "t0", "k"], logistic),
        Curve::new("gompertz", &["a", "b", "c"], gompertz),
        Curve::new("linear_plateau", &["t1", "t2", "k"], linear_plateau),
        Curve::new(
            "linear_plateau_linear",
            &["t1", "t2", "t3", "k", "beta"],
            linear_plateau_linear,
        ),
        Curve::new("nelson_siegel", &["b0", "b1", "b2", "tau"], nelson_siegel),
    ]
    .into_iter()
    .filter_map(Result::ok)
    .collect()
}

/// `m x + b`
pub fn linear(x: f64, p: &[f64]) -> f64 {
    p[0] * x + p[1]
}

/// `a x² + b x + c`
pub fn quadratic(x: f64, p: &[f64]) -> f64 {
    (p[0] * x + p[1]) * x + p[2]
}

/// `a exp(r x)`
pub fn exponential(x: f64, p: &[f64]) -> f64 {
    p[0] * (p[1] * x).exp()
}

/// `a / (1 + exp(-k (x - t0)))`
pub fn logistic(x: f64, p: &[f64]) -> f64 {
    let (a, t0, k) = (p[0], p[1], p[2]);
    a / (1.0 + (-k * (x - t0)).exp())
}

/// `a exp(-b exp(-c x))`
pub fn gompertz(x: f64, p: &[f64]) -> f64 {
    let (a, b, c) = (p[0], p[1], p[2]);
    a * (-b * (-c * x).exp()).exp()
}

/// Zero before `t1`, linear ramp to `k` between `t1` and `t2`, flat at `k` after.
pub fn linear_plateau(x: f64, p: &[f64]) -> f64 {
    let (t1, t2, k) = (p[0], p[1], p[2]);
    if x < t1 {
        0.0
    } else if x <= t2 {
        k / (t2 - t1) * (x - t1)
    } else {
        k
    }
}

/// `linear_plateau` up to `t3`, then a second linear segment with slope `beta`.
pub fn linear_plateau_linear(x: f64, p: &[f64]) -> f64 {
    let (t1, t2, t3, k, beta) = (p[0], p[1], p[2], p[3], p[4]);
    if x < t1 {
        0.0
    } else if x <= t2 {
        k / (t2 - t1) * (x - t1)
    } else if x <= t3 {
        k
    } else {
        k + beta * (x - t3)
    }
}

/// Nelson–Siegel: `b0 + b1 f1(x/τ) + b2 f2(x/τ)`.
pub fn nelson_siegel(x: f64, p: &[f64]) -> f64 {
    let (b0, b1, b2, tau) = (p[0], p[1], p[2], p[3]);
    let (f1, f2) = ns_basis(x / tau);
    b0 + b1 * f1 + b2 * f2
}

/// Nelson–Siegel loadings `f1(u) = (1 - e^-u)/u`, `f2(u) = f1(u) - e^-u`.
///
/// `1 - e^-u` is taken as `-expm1(-u)`; near zero the series avoids the
/// cancellation in both terms (limits: `f1 → 1`, `f2 → 0`).
fn ns_basis(u: f64) -> (f64, f64) {
    if u.abs() < NS_SMALL_X {
        return (1.0 - u / 2.0 + u * u / 6.0, u / 2.0 - u * u / 3.0);
    }
    let f1 = -(-u).exp_m1() / u;
    (f1, f1 - (-u).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CurveRegistry;

    #[test]
    fn catalog_names_are_unique_and_registered() {
        let curves = builtin_curves();
        let reg = CurveRegistry::with_builtins();
        assert_eq!(curves.len(), 8);
        assert_eq!(reg.len(), curves.len());
    }

    #[test]
    fn linear_plateau_shape() {
        let p = [38.6, 61.0, 99.8];
        assert_eq!(linear_plateau(0.0, &p), 0.0);
        assert!((linear_plateau(61.0, &p) - 99.8).abs() < 1e-12);
        assert_eq!(linear_plateau(100.0, &p), 99.8);
        let mid = linear_plateau(49.8, &p);
        assert!((mid - 49.9).abs() < 1e-9);
    }

    #[test]
    fn linear_plateau_linear_tail() {
        let p = [10.0, 20.0, 30.0, 50.0, -1.0];
        assert_eq!(linear_plateau_linear(25.0, &p), 50.0);
        assert!((linear_plateau_linear(40.0, &p) - 40.0).abs() < 1e-12);
    }

    #[test]
    fn nelson_siegel_limits_near_zero() {
        let (f1, f2) = ns_basis(1e-12);
        assert!((f1 - 1.0).abs() < 1e-9);
        assert!(f2.abs() < 1e-9);
        let y = nelson_siegel(0.0, &[100.0, -20.0, 50.0, 2.0]);
        assert!((y - 80.0).abs() < 1e-9);
    }

    #[test]
    fn logistic_midpoint() {
        assert!((logistic(5.0, &[10.0, 5.0, 2.0]) - 5.0).abs() < 1e-12);
    }
}
