//! Linear models: weighted least squares and linear IV-GMM.
//!
//! # References
//!
//! - Wooldridge, *Econometric Analysis of Cross Section and Panel Data*, Ch. 4-5, 8.
//! - Hansen (1982), "Large sample properties of generalized method of moments estimators."

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};

use crate::corr::{CorrStructure, InfoMethod};
use crate::data::{Microdata, Role};
use crate::estimator::{check_vcov, finish, Estimator, Fit, FitOptions};
use crate::linalg::{inverse, scale_rows, solve, weighted};
use crate::vcov;

/// Normal equations `X'W X b = X'W y`.
///
/// Unit weights and all-ones weights go through the same products, so they
/// produce bit-identical estimates.
pub(crate) fn least_squares(x: &DMatrix<f64>, y: &DVector<f64>, w: Option<&[f64]>, stage: &str) -> Result<DVector<f64>> {
    let xw = weighted(x, w);
    let xtx = x.transpose() * &xw;
    let xty = xw.transpose() * y;
    solve(&xtx, &xty, stage)
}

/// Weighted sum of squared residuals divided by `nobs - k`.
fn residual_variance(u: &DVector<f64>, w: Option<&[f64]>, nobs: f64, k: usize) -> Result<f64> {
    let dof = nobs - k as f64;
    if dof <= 0.0 {
        return Err(Error::Validation(format!("no residual degrees of freedom ({} obs, {} parameters)", nobs, k)));
    }
    let ssr: f64 = match w {
        Some(w) => u.iter().zip(w).map(|(u, w)| w * u * u).sum(),
        None => u.norm_squared(),
    };
    Ok(ssr / dof)
}

/// Ordinary (weighted) least squares of the response on treatment and controls.
#[derive(Debug, Clone)]
pub struct Ols {
    sample: Microdata,
    beta: DVector<f64>,
    vcov: Option<DMatrix<f64>>,
}

impl Fit for Ols {
    type Config = FitOptions;

    fn fit_with(md: &Microdata, config: &FitOptions) -> Result<Self> {
        md.require(&[Role::Response], "OLS")?;
        if !md.has(Role::Control) && !md.has(Role::Treatment) {
            return Err(Error::missing_role(Role::Control.as_str(), "OLS"));
        }
        let x = md.regressors();
        let y = md.response()?;
        let beta = least_squares(&x, &y, md.weights().values(), "OLS normal equations")?;
        log::debug!("OLS: n={} k={}", md.nrows(), beta.len());
        finish(Ols { sample: md.clone(), beta, vcov: None }, config.novar)
    }
}

impl Ols {
    /// `y - offset - Xb`.
    pub fn residuals(&self) -> DVector<f64> {
        let y = self.sample.response().unwrap_or_else(|_| DVector::zeros(self.sample.nrows()));
        y - self.sample.regressors() * &self.beta
    }

    /// Number of coefficients.
    pub fn dof(&self) -> usize {
        self.beta.len()
    }

    /// Residual degrees of freedom, `nobs - k`.
    pub fn dof_residual(&self) -> f64 {
        self.nobs() - self.beta.len() as f64
    }

    /// Weighted coefficient of determination.
    pub fn r2(&self) -> f64 {
        let w = self.sample.weights().to_vector();
        let y = match self.sample.vector(Role::Response) {
            Ok(y) => y.into_owned(),
            Err(_) => return f64::NAN,
        };
        let u = self.residuals();
        let sw = w.sum();
        let ybar = w.dot(&y) / sw;
        let tss: f64 = y.iter().zip(w.iter()).map(|(y, w)| w * (y - ybar).powi(2)).sum();
        let rss: f64 = u.iter().zip(w.iter()).map(|(u, w)| w * u * u).sum();
        1.0 - rss / tss
    }

    /// Adjusted R², `1 - (1 - R²)(n - 1)/(n - k)`.
    pub fn adjr2(&self) -> f64 {
        let n = self.nobs();
        1.0 - (1.0 - self.r2()) * (n - 1.0) / self.dof_residual()
    }
}

impl Estimator for Ols {
    fn name(&self) -> &str {
        "OLS"
    }

    fn sample(&self) -> &Microdata {
        &self.sample
    }

    fn coef(&self) -> &DVector<f64> {
        &self.beta
    }

    fn vcov_opt(&self) -> Option<&DMatrix<f64>> {
        self.vcov.as_ref()
    }

    fn set_vcov(&mut self, vcov: DMatrix<f64>) -> Result<()> {
        check_vcov(self.name(), self.beta.len(), &vcov)?;
        self.vcov = Some(vcov);
        Ok(())
    }

    fn coef_names(&self) -> Vec<String> {
        self.sample.regressor_names()
    }

    fn score(&self) -> DMatrix<f64> {
        let u = self.residuals();
        -scale_rows(&self.sample.regressors(), u.as_slice())
    }

    fn jacobian(&self) -> Result<DMatrix<f64>> {
        let x = self.sample.regressors();
        Ok(x.transpose() * weighted(&x, self.sample.weights().values()))
    }

    fn homoscedastic_vcov(&self, _method: InfoMethod) -> Result<DMatrix<f64>> {
        let s2 = residual_variance(&self.residuals(), self.sample.weights().values(), self.nobs(), self.beta.len())?;
        Ok(self.bread()? * s2)
    }

    fn predict(&self) -> DVector<f64> {
        let xb = self.sample.regressors() * &self.beta;
        match self.sample.offset() {
            Some(o) => xb + o,
            None => xb,
        }
    }

    fn fitted(&self) -> DVector<f64> {
        self.predict()
    }

    fn jacobexp(&self) -> Option<DMatrix<f64>> {
        Some(self.sample.regressors())
    }
}

/// Weight-matrix choice for linear IV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IvMethod {
    /// Two-stage least squares, `A = (Z'WZ)^-1`.
    #[default]
    Tsls,
    /// Efficient weight from first-step residuals, sandwich variance.
    TwoStepGmm,
    /// Efficient weight from first-step residuals, `(G'Ω^-1 G)^-1` variance.
    OptimalGmm,
}

/// Options for [`Iv`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IvConfig {
    /// Weight-matrix choice.
    pub method: IvMethod,
    /// Skip the variance computation.
    pub novar: bool,
}

/// Linear instrumental-variables GMM.
///
/// Regressors are treatment then controls; instruments are excluded
/// instruments then controls. The stored weight matrix is in mean scale.
#[derive(Debug, Clone)]
pub struct Iv {
    sample: Microdata,
    method: IvMethod,
    beta: DVector<f64>,
    weight: DMatrix<f64>,
    vcov: Option<DMatrix<f64>>,
}

/// Minimizer of `(Z'W(y - Xb))' A (Z'W(y - Xb))`.
fn linear_gmm(zx: &DMatrix<f64>, zy: &DVector<f64>, a: &DMatrix<f64>) -> Result<DVector<f64>> {
    let ga = zx.transpose() * a;
    solve(&(&ga * zx), &(ga * zy), "IV normal equations")
}

impl Fit for Iv {
    type Config = IvConfig;

    fn fit_with(md: &Microdata, config: &IvConfig) -> Result<Self> {
        md.require(&[Role::Response, Role::Treatment, Role::Instrument], "IV")?;
        let x = md.regressors();
        let z = md.matrix(&[Role::Instrument, Role::Control]);
        if z.ncols() < x.ncols() {
            return Err(Error::Validation(format!(
                "IV is under-identified: {} instruments for {} regressors",
                z.ncols(),
                x.ncols()
            )));
        }
        let y = md.response()?;
        let w = md.weights().values();
        let n = md.nobs();

        let zw = weighted(&z, w);
        let zx = zw.transpose() * &x;
        let zy = zw.transpose() * &y;
        let zz = z.transpose() * &zw;
        let a1 = inverse(&(&zz / n), "IV instrument cross-product")?;
        let beta1 = linear_gmm(&zx, &zy, &a1)?;

        let (beta, weight) = match config.method {
            IvMethod::Tsls => (beta1, a1),
            IvMethod::TwoStepGmm | IvMethod::OptimalGmm => {
                let u = &y - &x * &beta1;
                let omega = match md.corr() {
                    CorrStructure::Homoscedastic { .. } => zz * residual_variance(&u, w, n, 0)?,
                    corr => vcov::meat(&(-scale_rows(&z, u.as_slice())), corr, md.weights())?,
                };
                let a2 = inverse(&(omega / n), "IV moment covariance")?;
                (linear_gmm(&zx, &zy, &a2)?, a2)
            }
        };

        let model = Iv { sample: md.clone(), method: config.method, beta, weight, vcov: None };
        finish(model, config.novar)
    }
}

impl Iv {
    /// Weight-matrix choice used for this fit.
    pub fn method(&self) -> IvMethod {
        self.method
    }

    /// GMM weight matrix (mean scale).
    pub fn weight_matrix(&self) -> &DMatrix<f64> {
        &self.weight
    }

    /// Structural residuals `y - offset - Xb`.
    pub fn residuals(&self) -> DVector<f64> {
        let y = self.sample.response().unwrap_or_else(|_| DVector::zeros(self.sample.nrows()));
        y - self.sample.regressors() * &self.beta
    }

    fn instruments(&self) -> DMatrix<f64> {
        self.sample.matrix(&[Role::Instrument, Role::Control])
    }

    /// OLS of the response on treatment and controls, ignoring instruments.
    pub fn ols(md: &Microdata) -> Result<Ols> {
        Ols::fit(md)
    }

    /// OLS of the (single) treatment on instruments and controls.
    pub fn first_stage(md: &Microdata) -> Result<Ols> {
        md.require(&[Role::Treatment, Role::Instrument], "IV first stage")?;
        if md.width(Role::Treatment) != 1 {
            return Err(Error::Validation(format!(
                "first stage needs exactly one treatment, got {}",
                md.width(Role::Treatment)
            )));
        }
        let fs = md.reassign(&[
            (Role::Response, &[Role::Treatment][..]),
            (Role::Control, &[Role::Instrument, Role::Control][..]),
            (Role::Treatment, &[][..]),
            (Role::Instrument, &[][..]),
            (Role::Offset, &[][..]),
        ]);
        Ols::fit(&fs)
    }

    /// OLS of the response on instruments and controls.
    pub fn reduced_form(md: &Microdata) -> Result<Ols> {
        md.require(&[Role::Response, Role::Instrument], "IV reduced form")?;
        let rf = md.reassign(&[
            (Role::Control, &[Role::Instrument, Role::Control][..]),
            (Role::Treatment, &[][..]),
            (Role::Instrument, &[][..]),
        ]);
        Ols::fit(&rf)
    }
}

impl Estimator for Iv {
    fn name(&self) -> &str {
        match self.method {
            IvMethod::Tsls => "IV (2SLS)",
            IvMethod::TwoStepGmm => "IV (two-step GMM)",
            IvMethod::OptimalGmm => "IV (optimal GMM)",
        }
    }

    fn sample(&self) -> &Microdata {
        &self.sample
    }

    fn coef(&self) -> &DVector<f64> {
        &self.beta
    }

    fn vcov_opt(&self) -> Option<&DMatrix<f64>> {
        self.vcov.as_ref()
    }

    fn set_vcov(&mut self, vcov: DMatrix<f64>) -> Result<()> {
        check_vcov(self.name(), self.beta.len(), &vcov)?;
        self.vcov = Some(vcov);
        Ok(())
    }

    fn coef_names(&self) -> Vec<String> {
        self.sample.regressor_names()
    }

    fn score(&self) -> DMatrix<f64> {
        let u = self.residuals();
        -scale_rows(&self.instruments(), u.as_slice())
    }

    fn jacobian(&self) -> Result<DMatrix<f64>> {
        let zw = weighted(&self.instruments(), self.sample.weights().values());
        Ok(zw.transpose() * self.sample.regressors())
    }

    fn bread(&self) -> Result<DMatrix<f64>> {
        let g = self.jacobian()?;
        let ga = g.transpose() * &self.weight;
        Ok(inverse(&(&ga * &g), "IV bread")? * ga)
    }

    fn homoscedastic_vcov(&self, _method: InfoMethod) -> Result<DMatrix<f64>> {
        let w = self.sample.weights().values();
        let s2 = residual_variance(&self.residuals(), w, self.nobs(), self.beta.len())?;
        let z = self.instruments();
        let zz_inv = inverse(&(z.transpose() * weighted(&z, w)), "IV instrument cross-product")?;
        let g = self.jacobian()?;
        Ok(inverse(&(g.transpose() * zz_inv * &g), "IV homoscedastic variance")? * s2)
    }

    fn variance(&self) -> Result<DMatrix<f64>> {
        match (self.method, self.sample.corr()) {
            (_, CorrStructure::Homoscedastic { method, .. }) => self.homoscedastic_vcov(*method),
            (IvMethod::OptimalGmm, _) => {
                let g = self.jacobian()?;
                let a = &self.weight / self.nobs();
                inverse(&(g.transpose() * a * &g), "IV optimal variance")
            }
            _ => vcov::sandwich(self),
        }
    }

    fn predict(&self) -> DVector<f64> {
        let xb = self.sample.regressors() * &self.beta;
        match self.sample.offset() {
            Some(o) => xb + o,
            None => xb,
        }
    }

    fn fitted(&self) -> DVector<f64> {
        self.predict()
    }

    fn jacobexp(&self) -> Option<DMatrix<f64>> {
        Some(self.sample.regressors())
    }
}
