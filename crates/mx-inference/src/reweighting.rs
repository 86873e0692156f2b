//! Two-stage propensity-reweighting estimators.
//!
//! A first-stage model predicts the probability `p` of treatment (IPW) or
//! of the binary instrument (Abadie, Frölich-Melly, Tan). Observations with
//! `p` outside `[trim, 1 - trim]` are excluded from the second stage, which
//! is then fitted with weights `w_i v(d_i, z_i, p_i)`.
//!
//! The variance stacks both stages. With second-stage scores `S`, bread `B`,
//! first-stage influence `ψ¹` and `D = S' diag(w ∂v/∂p) ∂p/∂θ`, the
//! influence rows are
//!
//! ```text
//! Ψ = (diag(v) S - ψ¹ D') B'
//! ```
//!
//! so trimmed observations still carry their first-stage uncertainty.
//!
//! # References
//!
//! - Hirano, Imbens & Ridder (2003), "Efficient estimation of average treatment effects."
//! - Abadie (2003), "Semiparametric instrumental variable estimation of treatment response models."
//! - Frölich & Melly (2013), "Unconditional quantile treatment effects under endogeneity."
//! - Tan (2006), "Regression and weighting methods for causal inference using instrumental variables."

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};

use crate::data::{Microdata, Role, INTERCEPT};
use crate::estimator::{check_vcov, finish, Estimator, Fit, FitOptions};
use crate::linalg::scale_rows;
use crate::linear::{Iv, IvConfig, Ols};
use crate::mle::{Cloglog, Logit, MleConfig, Poisson, Probit};
use crate::vcov;

/// Reweighting design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reweighting {
    /// Inverse probability of treatment weighting.
    Ipw,
    /// Abadie's kappa weighting for complier parameters.
    Abadie,
    /// Frölich-Melly complier weighting.
    FrolichMelly,
    /// Tan's weighted two-stage least squares.
    Tan,
}

impl Reweighting {
    /// Model name.
    pub fn name(self) -> &'static str {
        match self {
            Reweighting::Ipw => "IPW",
            Reweighting::Abadie => "Abadie",
            Reweighting::FrolichMelly => "Frolich-Melly",
            Reweighting::Tan => "Tan",
        }
    }

    /// Role whose probability the first stage predicts.
    pub fn target(self) -> Role {
        match self {
            Reweighting::Ipw => Role::Treatment,
            _ => Role::Instrument,
        }
    }

    fn required(self) -> &'static [Role] {
        match self {
            Reweighting::Ipw => &[Role::Response, Role::Treatment, Role::Control],
            _ => &[Role::Response, Role::Treatment, Role::Instrument, Role::Control],
        }
    }

    /// Weight `v` and its derivative with respect to `p`.
    fn weight(self, d: f64, z: f64, p: f64) -> (f64, f64) {
        let q = 1.0 - p;
        match self {
            Reweighting::Ipw => (d / p + (1.0 - d) / q, -d / (p * p) + (1.0 - d) / (q * q)),
            Reweighting::Abadie => (
                1.0 - d * (1.0 - z) / q - (1.0 - d) * z / p,
                -d * (1.0 - z) / (q * q) + (1.0 - d) * z / (p * p),
            ),
            Reweighting::FrolichMelly => {
                let s = 2.0 * d - 1.0;
                (s * (z / p - (1.0 - z) / q), -s * (z / (p * p) + (1.0 - z) / (q * q)))
            }
            Reweighting::Tan => (z / p + (1.0 - z) / q, -z / (p * p) + (1.0 - z) / (q * q)),
        }
    }
}

/// First-stage model.
#[derive(Debug)]
pub enum FirstStage {
    /// Logit of the target on controls.
    Logit,
    /// Probit of the target on controls.
    Probit,
    /// Complementary log-log of the target on controls.
    Cloglog,
    /// Linear probability model of the target on controls.
    Linear,
    /// Model fitted by the caller on the same rows. Must expose
    /// [`Estimator::jacobexp`].
    Fitted(Box<dyn Estimator>),
}

/// Outcome model for [`Reweighting::Abadie`], over treatment and controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecondStage {
    /// Weighted least squares.
    #[default]
    Ols,
    /// Logit.
    Logit,
    /// Probit.
    Probit,
    /// Complementary log-log.
    Cloglog,
    /// Poisson.
    Poisson,
}

/// Options for the second stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReweightingConfig {
    /// Exclude observations with propensity outside `[trim, 1 - trim]`.
    pub trim: f64,
    /// Outcome model used by [`Reweighting::Abadie`].
    pub second: SecondStage,
    /// Skip the variance computation.
    pub novar: bool,
}

fn check_binary(md: &Microdata, role: Role, context: &str) -> Result<()> {
    let v = md.vector(role)?;
    match v.iter().find(|x| **x != 0.0 && **x != 1.0) {
        Some(bad) => Err(Error::Validation(format!("{}: {} must be binary, found {}", context, role, bad))),
        None => Ok(()),
    }
}

/// Validated sample, before any fitting.
#[derive(Debug, Clone)]
pub struct TwoStagePlan {
    kind: Reweighting,
    sample: Microdata,
}

impl TwoStagePlan {
    /// Check roles and binary columns for `kind`.
    pub fn new(kind: Reweighting, md: &Microdata) -> Result<Self> {
        md.require(kind.required(), kind.name())?;
        check_binary(md, Role::Treatment, kind.name())?;
        if kind != Reweighting::Ipw {
            check_binary(md, Role::Instrument, kind.name())?;
        }
        Ok(Self { kind, sample: md.clone() })
    }

    /// Sample with the first-stage target as response and controls as regressors.
    pub fn first_stage_sample(&self) -> Microdata {
        self.sample.reassign(&[
            (Role::Response, &[self.kind.target()][..]),
            (Role::Treatment, &[][..]),
            (Role::Instrument, &[][..]),
            (Role::Offset, &[][..]),
        ])
    }

    /// Fit (or adopt) the first stage and compute propensities.
    pub fn first_stage(self, first: FirstStage) -> Result<FirstStageFit> {
        let model: Box<dyn Estimator> = match first {
            FirstStage::Logit => Box::new(Logit::fit(&self.first_stage_sample())?),
            FirstStage::Probit => Box::new(Probit::fit(&self.first_stage_sample())?),
            FirstStage::Cloglog => Box::new(Cloglog::fit(&self.first_stage_sample())?),
            FirstStage::Linear => Box::new(Ols::fit(&self.first_stage_sample())?),
            FirstStage::Fitted(model) => {
                if model.sample().rows() != self.sample.rows() {
                    return Err(Error::IncompatibleStructure(format!(
                        "{}: first stage was fitted on {} rows, sample has {}",
                        self.kind.name(),
                        model.sample().nrows(),
                        self.sample.nrows()
                    )));
                }
                if model.sample().weights() != self.sample.weights() {
                    return Err(Error::IncompatibleStructure(format!(
                        "{}: first stage {} was fitted under different weights",
                        self.kind.name(),
                        model.name()
                    )));
                }
                model
            }
        };
        if model.jacobexp().is_none() {
            return Err(Error::Validation(format!(
                "{}: first stage {} does not expose the derivative of its fitted values",
                self.kind.name(),
                model.name()
            )));
        }
        let propensity = model.fitted();
        if let Some(bad) = propensity.iter().find(|p| !p.is_finite()) {
            return Err(Error::Computation(format!("{}: non-finite propensity {}", self.kind.name(), bad)));
        }
        Ok(FirstStageFit { kind: self.kind, sample: self.sample, first: model, propensity })
    }

    /// Fit both stages.
    pub fn fit(self, first: FirstStage, config: &ReweightingConfig) -> Result<TwoStage> {
        self.first_stage(first)?.second_stage(config)
    }
}

/// First stage fitted, second stage pending.
#[derive(Debug)]
pub struct FirstStageFit {
    kind: Reweighting,
    sample: Microdata,
    first: Box<dyn Estimator>,
    propensity: DVector<f64>,
}

impl FirstStageFit {
    /// Predicted probabilities, one per sample row.
    pub fn propensity(&self) -> &DVector<f64> {
        &self.propensity
    }

    /// First-stage model.
    pub fn model(&self) -> &dyn Estimator {
        self.first.as_ref()
    }

    /// Trim, reweight and fit the second stage.
    pub fn second_stage(self, config: &ReweightingConfig) -> Result<TwoStage> {
        let kind = self.kind;
        if !(0.0..0.5).contains(&config.trim) {
            return Err(Error::Validation(format!("{}: trim must be in [0, 0.5), got {}", kind.name(), config.trim)));
        }
        let md = &self.sample;
        let n = md.nrows();
        let d = md.vector(Role::Treatment)?;
        let z = md.vector(Role::Instrument).ok();
        let base = md.weights();

        let mut v = vec![0.0; n];
        let mut dv = vec![0.0; n];
        let mut kept = vec![false; n];
        let mut degenerate = 0;
        for i in 0..n {
            let p = self.propensity[i];
            if p <= 0.0 || p >= 1.0 {
                degenerate += 1;
                continue;
            }
            if p < config.trim || p > 1.0 - config.trim {
                continue;
            }
            let zi = z.as_ref().map_or(0.0, |z| z[i]);
            (v[i], dv[i]) = kind.weight(d[i], zi, p);
            kept[i] = true;
        }
        let n_kept = kept.iter().filter(|k| **k).count();
        if degenerate > 0 {
            log::debug!("{}: {} observations with propensity outside (0, 1) excluded", kind.name(), degenerate);
        }
        if n_kept == 0 {
            return Err(Error::empty(format!("{}: trimming at {} removed every observation", kind.name(), config.trim)));
        }
        log::debug!("{}: {} of {} observations kept after trimming at {}", kind.name(), n_kept, n, config.trim);
        let negative = v.iter().filter(|x| **x < 0.0).count();
        if negative > 0 && kind == Reweighting::Abadie {
            log::warn!("{}: {} negative kappa weights", kind.name(), negative);
        }

        let w2: Vec<f64> = (0..n).map(|i| base.get(i) * v[i]).collect();
        let md2 = md.reweighted(w2)?;
        let second = fit_second(kind, &md2, config.second)?;
        let effective_nobs = (0..n).filter(|&i| kept[i]).map(|i| if base.is_frequency() { base.get(i) } else { 1.0 }).sum();

        let model = TwoStage {
            kind,
            sample: self.sample,
            first: self.first,
            second,
            propensity: self.propensity,
            reweights: v,
            dreweights: dv,
            trim: config.trim,
            effective_nobs,
            vcov: None,
        };
        finish(model, config.novar)
    }
}

fn fit_second(kind: Reweighting, md: &Microdata, second: SecondStage) -> Result<Box<dyn Estimator>> {
    let opts = FitOptions { novar: true };
    let mle = MleConfig { novar: true, ..MleConfig::default() };
    let simple = || md.remap(&[(Role::Control, &[INTERCEPT][..]), (Role::Offset, &[][..])]);
    Ok(match kind {
        Reweighting::Ipw | Reweighting::FrolichMelly => Box::new(Ols::fit_with(&simple()?, &opts)?),
        Reweighting::Tan => Box::new(Iv::fit_with(&simple()?, &IvConfig { novar: true, ..IvConfig::default() })?),
        Reweighting::Abadie => match second {
            SecondStage::Ols => Box::new(Ols::fit_with(md, &opts)?),
            SecondStage::Logit => Box::new(Logit::fit_with(md, &mle)?),
            SecondStage::Probit => Box::new(Probit::fit_with(md, &mle)?),
            SecondStage::Cloglog => Box::new(Cloglog::fit_with(md, &mle)?),
            SecondStage::Poisson => Box::new(Poisson::fit_with(md, &mle)?),
        },
    })
}

/// Fitted two-stage reweighting model.
///
/// Coefficients are those of the second stage; the variance accounts for
/// estimation of the first stage.
#[derive(Debug)]
pub struct TwoStage {
    kind: Reweighting,
    sample: Microdata,
    first: Box<dyn Estimator>,
    second: Box<dyn Estimator>,
    propensity: DVector<f64>,
    reweights: Vec<f64>,
    dreweights: Vec<f64>,
    trim: f64,
    effective_nobs: f64,
    vcov: Option<DMatrix<f64>>,
}

impl TwoStage {
    /// Fit both stages in one call.
    pub fn fit(kind: Reweighting, md: &Microdata, first: FirstStage, config: &ReweightingConfig) -> Result<Self> {
        TwoStagePlan::new(kind, md)?.fit(first, config)
    }

    /// Reweighting design.
    pub fn kind(&self) -> Reweighting {
        self.kind
    }

    /// First-stage model.
    pub fn first(&self) -> &dyn Estimator {
        self.first.as_ref()
    }

    /// Second-stage model (fitted without its own variance).
    pub fn second(&self) -> &dyn Estimator {
        self.second.as_ref()
    }

    /// First-stage predicted probabilities.
    pub fn propensity(&self) -> &DVector<f64> {
        &self.propensity
    }

    /// Reweighting factors `v_i`; zero for excluded observations.
    pub fn reweights(&self) -> &[f64] {
        &self.reweights
    }

    /// Trimming threshold.
    pub fn trim(&self) -> f64 {
        self.trim
    }

    /// Observations (frequency-weighted) that survived trimming.
    pub fn effective_nobs(&self) -> f64 {
        self.effective_nobs
    }
}

impl Estimator for TwoStage {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn sample(&self) -> &Microdata {
        &self.sample
    }

    fn coef(&self) -> &DVector<f64> {
        self.second.coef()
    }

    fn vcov_opt(&self) -> Option<&DMatrix<f64>> {
        self.vcov.as_ref()
    }

    fn set_vcov(&mut self, vcov: DMatrix<f64>) -> Result<()> {
        check_vcov(self.kind.name(), self.second.coef().len(), &vcov)?;
        self.vcov = Some(vcov);
        Ok(())
    }

    fn coef_names(&self) -> Vec<String> {
        self.second.coef_names()
    }

    /// Second-stage scores scaled by the reweighting factors.
    fn nobs(&self) -> f64 {
        self.effective_nobs
    }

    fn score(&self) -> DMatrix<f64> {
        scale_rows(&self.second.score(), &self.reweights)
    }

    fn jacobian(&self) -> Result<DMatrix<f64>> {
        self.second.jacobian()
    }

    fn bread(&self) -> Result<DMatrix<f64>> {
        self.second.bread()
    }

    fn influence(&self) -> Result<DMatrix<f64>> {
        let base = self.sample.weights();
        let p_jac = self
            .first
            .jacobexp()
            .ok_or_else(|| Error::Validation(format!("{}: first stage lacks jacobexp", self.kind.name())))?;
        let wdv: Vec<f64> = self.dreweights.iter().enumerate().map(|(i, dv)| base.get(i) * dv).collect();
        let s2 = self.second.score();
        let d = s2.transpose() * scale_rows(&p_jac, &wdv);
        let stacked = scale_rows(&s2, &self.reweights) - self.first.influence()? * d.transpose();
        Ok(stacked * self.second.bread()?.transpose())
    }

    fn variance(&self) -> Result<DMatrix<f64>> {
        vcov::robust(self)
    }

    fn predict(&self) -> DVector<f64> {
        self.second.predict()
    }

    fn fitted(&self) -> DVector<f64> {
        self.second.fitted()
    }
}
