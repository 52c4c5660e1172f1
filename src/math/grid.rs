//! Equally spaced grids and the composite trapezoid rule.
//!
//! AUC estimates are always computed on the same node layout for a given
//! `(lo, hi, n_points)`, so repeated calls reproduce bit-for-bit.

/// Generate `n` equally spaced points between `lo` and `hi` (inclusive).
///
/// Returns `None` for non-finite bounds, `hi < lo`, or `n < 2`.
pub fn linspace(lo: f64, hi: f64, n: usize) -> Option<Vec<f64>> {
    if !(lo.is_finite() && hi.is_finite()) || hi < lo || n < 2 {
        return None;
    }
    let step = (hi - lo) / (n as f64 - 1.0);
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        out.push(lo + step * i as f64);
    }
    // Pin the right endpoint; `lo + step * (n - 1)` can drift by an ulp.
    out[n - 1] = hi;
    Some(out)
}

/// Composite trapezoid rule over paired samples.
///
/// `x` and `y` must have equal length; fewer than two points integrate to 0.
pub fn trapezoid(x: &[f64], y: &[f64]) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    x.windows(2)
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

/// Integrate `f` over `[lo, hi]` with the trapezoid rule on `n` equally spaced nodes.
pub fn integrate_trapezoid<F>(f: F, lo: f64, hi: f64, n: usize) -> Option<f64>
where
    F: Fn(f64) -> f64,
{
    let nodes = linspace(lo, hi, n)?;
    let values: Vec<f64> = nodes.iter().map(|&t| f(t)).collect();
    Some(trapezoid(&nodes, &values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_endpoints() {
        let v = linspace(0.1, 10.0, 7).unwrap();
        assert_eq!(v.len(), 7);
        assert_eq!(v[0], 0.1);
        assert_eq!(v[6], 10.0);
        assert!(linspace(1.0, 0.0, 5).is_none());
        assert!(linspace(0.0, 1.0, 1).is_none());
    }

    #[test]
    fn trapezoid_is_exact_for_lines() {
        let area = integrate_trapezoid(|t| 2.0 * t + 1.0, 0.0, 3.0, 4).unwrap();
        assert!((area - 12.0).abs() < 1e-12);
    }

    #[test]
    fn trapezoid_converges_on_quadratic() {
        let area = integrate_trapezoid(|t| t * t, 0.0, 1.0, 201).unwrap();
        assert!((area - 1.0 / 3.0).abs() < 1e-5);
    }
}
