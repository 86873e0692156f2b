//! Dense linear-algebra helpers shared by the estimators.

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};

/// Relative pivot threshold below which a system is treated as singular.
const PIVOT_TOL: f64 = 1e-13;

fn check_square(a: &DMatrix<f64>, stage: &str) -> Result<()> {
    if a.nrows() != a.ncols() {
        return Err(Error::Computation(format!("{}: expected a square matrix, got {}x{}", stage, a.nrows(), a.ncols())));
    }
    if a.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation(format!("{}: non-finite entries", stage)));
    }
    Ok(())
}

fn lu_checked(a: &DMatrix<f64>, stage: &str) -> Result<nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>> {
    check_square(a, stage)?;
    let lu = a.clone().lu();
    let u = lu.u();
    let diag = u.diagonal();
    let max = diag.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let min = diag.iter().fold(f64::INFINITY, |m, v| m.min(v.abs()));
    if !(max > 0.0) || min <= PIVOT_TOL * max {
        return Err(Error::singular(stage, a.nrows()));
    }
    Ok(lu)
}

/// Inverse of a square matrix, with [`Error::SingularSystem`] on (near) singularity.
pub fn inverse(a: &DMatrix<f64>, stage: &str) -> Result<DMatrix<f64>> {
    if a.nrows() == 0 && a.ncols() == 0 {
        return Ok(a.clone());
    }
    lu_checked(a, stage)?.try_inverse().ok_or_else(|| Error::singular(stage, a.nrows()))
}

/// Solve `A x = b`.
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>, stage: &str) -> Result<DVector<f64>> {
    if b.len() != a.nrows() {
        return Err(Error::Computation(format!("{}: rhs has {} rows, system has {}", stage, b.len(), a.nrows())));
    }
    lu_checked(a, stage)?.solve(b).ok_or_else(|| Error::singular(stage, a.nrows()))
}

/// Copy of `x` with row `i` multiplied by `w[i]`.
pub fn scale_rows(x: &DMatrix<f64>, w: &[f64]) -> DMatrix<f64> {
    let mut out = x.clone();
    for (i, mut row) in out.row_iter_mut().enumerate() {
        row *= w[i];
    }
    out
}

/// `x` scaled by observation weights, or a plain copy for unit weights.
pub fn weighted(x: &DMatrix<f64>, w: Option<&[f64]>) -> DMatrix<f64> {
    match w {
        Some(w) => scale_rows(x, w),
        None => x.clone(),
    }
}

/// `(A + A') / 2`.
pub fn symmetrize(a: &DMatrix<f64>) -> DMatrix<f64> {
    (a + a.transpose()) * 0.5
}

/// Largest absolute entry (0 for an empty vector).
pub fn max_abs(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0_f64, |m, x| m.max(x.abs()))
}
