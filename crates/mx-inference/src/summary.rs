//! Derived inference quantities from an estimate and its variance.
//!
//! All tests and intervals use the normal approximation.

use nalgebra::{DMatrix, DVector};

use mx_core::{CoefRecord, CoefTable, Error, Result};
use mx_prob::normal;

/// Square roots of the variance diagonal (`NaN` for negative entries).
pub fn stderr(vcov: &DMatrix<f64>) -> DVector<f64> {
    vcov.diagonal().map(|v| if v >= 0.0 { v.sqrt() } else { f64::NAN })
}

/// `coef / stderr`.
pub fn tstat(coef: &DVector<f64>, vcov: &DMatrix<f64>) -> DVector<f64> {
    coef.component_div(&stderr(vcov))
}

/// Two-sided p-values of the t statistics.
pub fn pval(coef: &DVector<f64>, vcov: &DMatrix<f64>) -> DVector<f64> {
    tstat(coef, vcov).map(normal::two_sided_pval)
}

/// Confidence intervals at `level`, one row per coefficient.
pub fn confint(coef: &DVector<f64>, vcov: &DMatrix<f64>, level: f64) -> Result<DMatrix<f64>> {
    let z = critical_value(level)?;
    let se = stderr(vcov);
    Ok(DMatrix::from_fn(coef.len(), 2, |i, j| if j == 0 { coef[i] - z * se[i] } else { coef[i] + z * se[i] }))
}

fn critical_value(level: f64) -> Result<f64> {
    if !(level > 0.0 && level < 1.0) {
        return Err(Error::Validation(format!("confidence level must be in (0,1), got {}", level)));
    }
    normal::quantile(0.5 + 0.5 * level)
}

/// Assemble a [`CoefTable`].
pub fn coeftable(
    names: &[String],
    coef: &DVector<f64>,
    vcov: &DMatrix<f64>,
    level: f64,
    nobs: Option<f64>,
) -> Result<CoefTable> {
    if names.len() != coef.len() {
        return Err(Error::Validation(format!("{} names for {} coefficients", names.len(), coef.len())));
    }
    let z = critical_value(level)?;
    let se = stderr(vcov);
    let records = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let t = coef[i] / se[i];
            CoefRecord {
                name: name.clone(),
                estimate: coef[i],
                stderr: se[i],
                tstat: t,
                pval: normal::two_sided_pval(t),
                lower: coef[i] - z * se[i],
                upper: coef[i] + z * se[i],
            }
        })
        .collect();
    Ok(CoefTable { level, nobs, records })
}
