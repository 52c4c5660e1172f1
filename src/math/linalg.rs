//! Small dense linear-algebra helpers for covariance work.
//!
//! Parameter dimensions are tiny (a handful of free parameters per curve), so
//! we favour robustness over speed: an SVD conditioning check followed by a
//! Cholesky inverse; a matrix Cholesky rejects is not a usable Hessian.

use nalgebra::{DMatrix, DVector};

/// Reciprocal condition number below which a Hessian is treated as singular.
const RCOND_MIN: f64 = 1e-12;

/// Invert a (numerically estimated) Hessian.
///
/// Returns `None` when the matrix is empty, non-finite, singular, not positive
/// definite, or yields a non-positive variance on the diagonal.
pub fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    if n == 0 || n != hessian.ncols() || hessian.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let sym = (hessian + hessian.transpose()) * 0.5;

    let svd = sym.clone().svd(false, false);
    let s_max = svd.singular_values.iter().fold(0.0_f64, |a, &b| a.max(b));
    let s_min = svd
        .singular_values
        .iter()
        .fold(f64::INFINITY, |a, &b| a.min(b));
    if !(s_max > 0.0) || s_min / s_max < RCOND_MIN {
        return None;
    }

    // An indefinite Hessian is not a minimum; treat it as unavailable.
    let inv = sym.cholesky()?.inverse();

    for i in 0..n {
        let v = inv[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(inv)
}

/// Quadratic form `jᵀ Σ j`.
pub fn quad_form(j: &[f64], sigma: &DMatrix<f64>) -> f64 {
    let v = DVector::from_column_slice(j);
    (v.transpose() * sigma * &v)[(0, 0)]
}

/// Restrict a square matrix to the given row/column indices.
pub fn submatrix(m: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(idx.len(), idx.len(), |r, c| m[(idx[r], idx[c])])
}
