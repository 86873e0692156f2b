//! The estimator contract consumed by the variance engine, the two-stage
//! composer and the Hausman tester.
//!
//! Sign and scale conventions:
//! - `score` is the per-observation derivative of the objective at the
//!   estimate, **unweighted** (one row per observation).
//! - `jacobian` is the weighted sum of derivatives of the score with respect
//!   to the parameters (for OLS, `X'WX`).
//! - `influence` rows are `bread * score_i`; the variance is
//!   `Σ_ij c_ij w_i w_j ψ_i ψ_j'`.

use std::fmt;

use nalgebra::{DMatrix, DVector};

use mx_core::{CoefTable, Error, Result};

use crate::corr::InfoMethod;
use crate::data::Microdata;
use crate::linalg;
use crate::summary;
use crate::vcov;

/// Fitted model usable by the variance engine.
///
/// The trait is object safe; composers and testers take `&dyn Estimator`.
pub trait Estimator: fmt::Debug + Send + Sync {
    /// Short model name for messages.
    fn name(&self) -> &str;

    /// Estimation sample.
    fn sample(&self) -> &Microdata;

    /// Point estimates.
    fn coef(&self) -> &DVector<f64>;

    /// Stored variance, if computed.
    fn vcov_opt(&self) -> Option<&DMatrix<f64>>;

    /// Store a variance computed elsewhere.
    fn set_vcov(&mut self, vcov: DMatrix<f64>) -> Result<()>;

    /// Coefficient labels.
    fn coef_names(&self) -> Vec<String>;

    /// Per-observation score (`n x k`, unweighted).
    fn score(&self) -> DMatrix<f64>;

    /// Weighted derivative of the summed score (`m x k`, `m` moments).
    fn jacobian(&self) -> Result<DMatrix<f64>>;

    /// Linear map from scores to influence, `k x m`. Just-identified models
    /// use the inverse Jacobian.
    fn bread(&self) -> Result<DMatrix<f64>> {
        linalg::inverse(&self.jacobian()?, &format!("{} jacobian", self.name()))
    }

    /// Per-observation influence (`n x k`).
    fn influence(&self) -> Result<DMatrix<f64>> {
        Ok(self.score() * self.bread()?.transpose())
    }

    /// Variance under the homoscedastic structure. Unsupported by default.
    fn homoscedastic_vcov(&self, method: InfoMethod) -> Result<DMatrix<f64>> {
        let _ = method;
        Err(Error::Validation(format!("{} does not support homoscedastic variance", self.name())))
    }

    /// Variance under the sample's correlation structure.
    fn variance(&self) -> Result<DMatrix<f64>> {
        vcov::sandwich(self)
    }

    /// Linear predictor (including any offset).
    fn predict(&self) -> DVector<f64>;

    /// Fitted mean.
    fn fitted(&self) -> DVector<f64>;

    /// Derivative of the fitted mean with respect to the coefficients
    /// (`n x k`), for models that can feed a two-stage composition.
    fn jacobexp(&self) -> Option<DMatrix<f64>> {
        None
    }

    /// Effective number of observations.
    fn nobs(&self) -> f64 {
        self.sample().nobs()
    }

    /// Stored variance or an error when it was never computed.
    fn vcov(&self) -> Result<&DMatrix<f64>> {
        self.vcov_opt()
            .ok_or_else(|| Error::Computation(format!("{}: variance has not been computed", self.name())))
    }

    /// Standard errors.
    fn stderr(&self) -> Result<DVector<f64>> {
        Ok(summary::stderr(self.vcov()?))
    }

    /// Ratios of estimates to standard errors.
    fn tstat(&self) -> Result<DVector<f64>> {
        Ok(summary::tstat(self.coef(), self.vcov()?))
    }

    /// Two-sided normal p-values.
    fn pval(&self) -> Result<DVector<f64>> {
        Ok(summary::pval(self.coef(), self.vcov()?))
    }

    /// Normal confidence intervals (`k x 2`: lower, upper).
    fn confint(&self, level: f64) -> Result<DMatrix<f64>> {
        summary::confint(self.coef(), self.vcov()?, level)
    }

    /// Coefficient table.
    fn coeftable(&self, level: f64) -> Result<CoefTable> {
        summary::coeftable(&self.coef_names(), self.coef(), self.vcov()?, level, Some(self.nobs()))
    }
}

/// Estimators that can be fitted from a sample.
pub trait Fit: Estimator + Sized {
    /// Fit options.
    type Config: Default;

    /// Fit with explicit options.
    fn fit_with(md: &Microdata, config: &Self::Config) -> Result<Self>;

    /// Fit with default options.
    fn fit(md: &Microdata) -> Result<Self> {
        Self::fit_with(md, &Self::Config::default())
    }
}

/// Options shared by closed-form estimators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FitOptions {
    /// Skip the variance computation.
    pub novar: bool,
}

/// Compute and store the variance unless `novar` is set.
pub(crate) fn finish<E: Estimator>(mut model: E, novar: bool) -> Result<E> {
    if !novar {
        let v = model.variance()?;
        model.set_vcov(v)?;
    }
    Ok(model)
}

/// Validate dimensions before storing a variance.
pub(crate) fn check_vcov(name: &str, k: usize, vcov: &DMatrix<f64>) -> Result<()> {
    if vcov.nrows() != k || vcov.ncols() != k {
        return Err(Error::Validation(format!(
            "{}: variance must be {}x{}, got {}x{}",
            name,
            k,
            k,
            vcov.nrows(),
            vcov.ncols()
        )));
    }
    Ok(())
}
