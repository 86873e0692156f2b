//! Hausman-type comparisons of two fitted models.
//!
//! Three variants, by how the estimation samples relate:
//!
//! - [`hausman_1s`]: both models were fitted on the same rows. The
//!   difference of their influence rows goes through one meat, so the
//!   covariance between the estimates is accounted for exactly.
//! - [`hausman_2s`]: independent samples, `V1 + V2`.
//! - [`hausman_2s_corr`]: samples related through a caller-supplied
//!   structure over the original row indices of both samples,
//!   `V1 + V2 - C - C'`.

use nalgebra::{DMatrix, DVector};

use mx_core::{CoefTable, Error, Result};

use crate::corr::CorrStructure;
use crate::estimator::Estimator;
use crate::summary;
use crate::vcov::{self, Part};

/// Difference of two coefficient vectors with its covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct ParObject {
    names: Vec<String>,
    par: DVector<f64>,
    vcov: DMatrix<f64>,
}

impl ParObject {
    /// Coefficient labels.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Differences `b1 - b2`.
    pub fn coef(&self) -> &DVector<f64> {
        &self.par
    }

    /// Covariance of the differences.
    pub fn vcov(&self) -> &DMatrix<f64> {
        &self.vcov
    }

    /// Standard errors.
    pub fn stderr(&self) -> DVector<f64> {
        summary::stderr(&self.vcov)
    }

    /// Ratios of differences to standard errors.
    pub fn tstat(&self) -> DVector<f64> {
        summary::tstat(&self.par, &self.vcov)
    }

    /// Two-sided normal p-values.
    pub fn pval(&self) -> DVector<f64> {
        summary::pval(&self.par, &self.vcov)
    }

    /// Normal confidence intervals (`k x 2`).
    pub fn confint(&self, level: f64) -> Result<DMatrix<f64>> {
        summary::confint(&self.par, &self.vcov, level)
    }

    /// Coefficient table.
    pub fn coeftable(&self, level: f64) -> Result<CoefTable> {
        summary::coeftable(&self.names, &self.par, &self.vcov, level, None)
    }
}

/// Column positions of the compared coefficients in each model.
fn align(m1: &dyn Estimator, m2: &dyn Estimator, names: Option<&[&str]>) -> Result<(Vec<String>, Vec<usize>, Vec<usize>)> {
    let n1 = m1.coef_names();
    let n2 = m2.coef_names();
    let wanted: Vec<String> = match names {
        Some(list) => list.iter().map(|s| s.to_string()).collect(),
        None => n1.iter().filter(|n| n2.contains(n)).cloned().collect(),
    };
    if wanted.is_empty() {
        return Err(Error::Validation(format!("{} and {} share no coefficients", m1.name(), m2.name())));
    }
    let find = |names: &[String], target: &str, model: &dyn Estimator| -> Result<usize> {
        names
            .iter()
            .position(|n| n == target)
            .ok_or_else(|| Error::Validation(format!("{} has no coefficient `{}`", model.name(), target)))
    };
    let mut i1 = Vec::with_capacity(wanted.len());
    let mut i2 = Vec::with_capacity(wanted.len());
    for name in &wanted {
        i1.push(find(&n1, name, m1)?);
        i2.push(find(&n2, name, m2)?);
    }
    Ok((wanted, i1, i2))
}

fn difference(m1: &dyn Estimator, m2: &dyn Estimator, i1: &[usize], i2: &[usize]) -> DVector<f64> {
    DVector::from_iterator(i1.len(), i1.iter().zip(i2).map(|(&a, &b)| m1.coef()[a] - m2.coef()[b]))
}

fn sub_vcov(v: &DMatrix<f64>, idx: &[usize]) -> DMatrix<f64> {
    DMatrix::from_fn(idx.len(), idx.len(), |r, c| v[(idx[r], idx[c])])
}

/// Compare two models fitted on the same rows.
///
/// The variance is the meat of `ψ1 - ψ2` under the first model's structure
/// and weights.
pub fn hausman_1s(m1: &dyn Estimator, m2: &dyn Estimator, names: Option<&[&str]>) -> Result<ParObject> {
    let (names, i1, i2) = align(m1, m2, names)?;
    let (s1, s2) = (m1.sample(), m2.sample());
    if s1.rows() != s2.rows() {
        return Err(Error::IncompatibleStructure(format!(
            "{} and {} were fitted on different rows ({} vs {})",
            m1.name(),
            m2.name(),
            s1.nrows(),
            s2.nrows()
        )));
    }
    let psi = m1.influence()?.select_columns(i1.iter()) - m2.influence()?.select_columns(i2.iter());
    let corr = vcov::robust_structure(s1.corr(), "Hausman test");
    let v = vcov::meat(&psi, &corr, s1.weights())?;
    log::debug!("hausman_1s: {} coefficients over {} rows", names.len(), s1.nrows());
    Ok(ParObject { par: difference(m1, m2, &i1, &i2), vcov: v, names })
}

/// Compare two models fitted on independent samples.
pub fn hausman_2s(m1: &dyn Estimator, m2: &dyn Estimator, names: Option<&[&str]>) -> Result<ParObject> {
    let (names, i1, i2) = align(m1, m2, names)?;
    let v = sub_vcov(m1.vcov()?, &i1) + sub_vcov(m2.vcov()?, &i2);
    Ok(ParObject { par: difference(m1, m2, &i1, &i2), vcov: v, names })
}

/// Compare two models whose samples are related through `corr`.
///
/// `corr` must cover the original row indices of both samples. The cross
/// term uses each model's own weights.
pub fn hausman_2s_corr(
    m1: &dyn Estimator,
    m2: &dyn Estimator,
    corr: &CorrStructure,
    names: Option<&[&str]>,
) -> Result<ParObject> {
    let (names, i1, i2) = align(m1, m2, names)?;
    let (s1, s2) = (m1.sample(), m2.sample());
    let psi1 = m1.influence()?.select_columns(i1.iter());
    let psi2 = m2.influence()?.select_columns(i2.iter());
    let corr = vcov::robust_structure(corr, "Hausman test");
    let c = vcov::cross_meat(
        &Part { psi: &psi1, rows: s1.rows(), weights: s1.weights() },
        &Part { psi: &psi2, rows: s2.rows(), weights: s2.weights() },
        &corr,
    )?;
    let v = sub_vcov(m1.vcov()?, &i1) + sub_vcov(m2.vcov()?, &i2) - &c - c.transpose();
    Ok(ParObject { par: difference(m1, m2, &i1, &i2), vcov: v, names })
}
