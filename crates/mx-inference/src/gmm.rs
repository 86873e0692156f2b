//! GMM for exponential-mean models with endogenous regressors.
//!
//! Both estimators model `E[y | x] = exp(x'b + offset)` and use the
//! instruments `z = [instruments, controls]`:
//!
//! - [`IvPoisson`]: additive errors, moments `z (y - μ)`.
//! - [`Mullahy`]: multiplicative errors, moments `z (y / μ - 1)`.
//!
//! Estimates minimize `ḡ' A ḡ` by Gauss-Newton with step halving, starting
//! from the Poisson MLE. Weight matrices are stored in mean scale.
//!
//! # References
//!
//! - Mullahy (1997), "Instrumental-variable estimation of count data models."
//! - Windmeijer & Santos Silva (1997), "Endogeneity in count data models."

use std::fmt;
use std::marker::PhantomData;

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};
use mx_prob::math;

use crate::data::{Microdata, Role};
use crate::estimator::{check_vcov, finish, Estimator, Fit};
use crate::linalg::{inverse, max_abs, scale_rows, solve, weighted};
use crate::mle::{MleConfig, Poisson};
use crate::vcov;

/// Residual function of an exponential-mean moment condition.
pub trait Moment: fmt::Debug + Clone + Copy + Default + Send + Sync + 'static {
    /// Model name.
    const NAME: &'static str;

    /// Residual `r(y, μ)`; the moments are `z r`.
    fn residual(y: f64, mu: f64) -> f64;

    /// `-dr/dη`.
    fn slope(y: f64, mu: f64) -> f64;
}

/// Additive error: `r = y - μ`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Additive;

impl Moment for Additive {
    const NAME: &'static str = "IV Poisson";

    fn residual(y: f64, mu: f64) -> f64 {
        y - mu
    }

    fn slope(_y: f64, mu: f64) -> f64 {
        mu
    }
}

/// Multiplicative error: `r = y / μ - 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Multiplicative;

impl Moment for Multiplicative {
    const NAME: &'static str = "Mullahy";

    fn residual(y: f64, mu: f64) -> f64 {
        y / mu - 1.0
    }

    fn slope(y: f64, mu: f64) -> f64 {
        y / mu
    }
}

/// IV Poisson with additive errors.
pub type IvPoisson = ExpGmm<Additive>;
/// IV Poisson with multiplicative errors.
pub type Mullahy = ExpGmm<Multiplicative>;

/// Weight-matrix choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GmmMethod {
    /// Identity weight matrix.
    #[default]
    OneStep,
    /// `A = (Z'WZ / n)^-1`.
    Tsls,
    /// Efficient weight from a first `Tsls` step, sandwich variance.
    TwoStepGmm,
    /// Efficient weight, `(J'Ω^-1 J)^-1` variance.
    OptimalGmm,
}

/// Options for [`ExpGmm`].
#[derive(Debug, Clone, PartialEq)]
pub struct GmmConfig {
    /// Weight-matrix choice.
    pub method: GmmMethod,
    /// Iteration budget per optimization step.
    pub max_iter: usize,
    /// Tolerance on the max-abs gradient of the mean GMM objective.
    pub tol: f64,
    /// Keep the last iterate (with a warning) instead of failing.
    pub accept_unconverged: bool,
    /// Skip the variance computation.
    pub novar: bool,
}

impl Default for GmmConfig {
    fn default() -> Self {
        Self { method: GmmMethod::OneStep, max_iter: 100, tol: 1e-8, accept_unconverged: false, novar: false }
    }
}

struct Moments<'a, M> {
    x: &'a DMatrix<f64>,
    z: &'a DMatrix<f64>,
    y: &'a DVector<f64>,
    offset: Option<&'a DVector<f64>>,
    w: Option<&'a [f64]>,
    n: f64,
    _moment: PhantomData<M>,
}

struct Step {
    beta: DVector<f64>,
    iterations: usize,
    grad_norm: f64,
    converged: bool,
}

const MAX_HALVINGS: usize = 40;

impl<M: Moment> Moments<'_, M> {
    fn mu(&self, beta: &DVector<f64>) -> DVector<f64> {
        let mut eta = self.x * beta;
        if let Some(o) = self.offset {
            eta += o;
        }
        eta.map(math::exp_clamped)
    }

    fn weighted_terms(&self, beta: &DVector<f64>) -> (Vec<f64>, Vec<f64>) {
        let mu = self.mu(beta);
        let n = self.y.len();
        let mut wr = Vec::with_capacity(n);
        let mut wq = Vec::with_capacity(n);
        for i in 0..n {
            let w = self.w.map_or(1.0, |w| w[i]);
            wr.push(w * M::residual(self.y[i], mu[i]));
            wq.push(w * M::slope(self.y[i], mu[i]));
        }
        (wr, wq)
    }

    /// Mean moments `Σ w z r / n`.
    fn gbar(&self, beta: &DVector<f64>) -> DVector<f64> {
        let (wr, _) = self.weighted_terms(beta);
        self.z.transpose() * DVector::from_vec(wr) / self.n
    }

    /// `Σ w z q x' / n`, the negative derivative of the mean moments.
    fn jac(&self, beta: &DVector<f64>) -> DMatrix<f64> {
        let (_, wq) = self.weighted_terms(beta);
        self.z.transpose() * scale_rows(self.x, &wq) / self.n
    }

    fn objective(&self, beta: &DVector<f64>, a: &DMatrix<f64>) -> f64 {
        let g = self.gbar(beta);
        g.dot(&(a * &g))
    }

    fn gauss_newton(&self, init: DVector<f64>, a: &DMatrix<f64>, cfg: &GmmConfig, stage: &str) -> Result<Step> {
        let mut beta = init;
        let mut iterations = 0;
        let grad = |b: &DVector<f64>| -> (DMatrix<f64>, DVector<f64>) {
            let g = self.gbar(b);
            let ja = self.jac(b).transpose() * a;
            let grad = &ja * g;
            (ja, grad)
        };
        let (mut ja, mut gr) = grad(&beta);
        while iterations < cfg.max_iter {
            if max_abs(&gr) < cfg.tol {
                break;
            }
            let jaj = &ja * self.jac(&beta);
            let delta = solve(&jaj, &gr, stage)?;
            let q0 = self.objective(&beta, a);
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let cand = &beta + &delta * step;
                let q = self.objective(&cand, a);
                if q.is_finite() && q <= q0 {
                    accepted = Some(cand);
                    break;
                }
                step *= 0.5;
            }
            iterations += 1;
            match accepted {
                Some(b) => {
                    beta = b;
                    (ja, gr) = grad(&beta);
                }
                None => {
                    log::debug!("{}: line search stalled at iteration {}", stage, iterations);
                    break;
                }
            }
        }
        let grad_norm = max_abs(&gr);
        let converged = grad_norm < cfg.tol;
        if !converged {
            if cfg.accept_unconverged {
                log::warn!("{}: accepting unconverged estimate (|grad|={:.3e})", stage, grad_norm);
            } else {
                return Err(Error::NonConvergence { stage: stage.to_string(), iterations, grad_norm });
            }
        }
        Ok(Step { beta, iterations, grad_norm, converged })
    }

    /// Per-observation scores `-z_i r_i` (unweighted).
    fn scores(&self, beta: &DVector<f64>) -> DMatrix<f64> {
        let mu = self.mu(beta);
        let r: Vec<f64> = (0..self.y.len()).map(|i| -M::residual(self.y[i], mu[i])).collect();
        scale_rows(self.z, &r)
    }
}

/// Fitted exponential-mean GMM model.
#[derive(Debug, Clone)]
pub struct ExpGmm<M: Moment> {
    sample: Microdata,
    method: GmmMethod,
    beta: DVector<f64>,
    weight: DMatrix<f64>,
    vcov: Option<DMatrix<f64>>,
    iterations: usize,
    converged: bool,
    _moment: PhantomData<M>,
}

impl<M: Moment> Fit for ExpGmm<M> {
    type Config = GmmConfig;

    fn fit_with(md: &Microdata, config: &GmmConfig) -> Result<Self> {
        md.require(&[Role::Response, Role::Treatment, Role::Instrument], M::NAME)?;
        let x = md.regressors();
        let z = md.matrix(&[Role::Instrument, Role::Control]);
        if z.ncols() < x.ncols() {
            return Err(Error::Validation(format!(
                "{} is under-identified: {} instruments for {} regressors",
                M::NAME,
                z.ncols(),
                x.ncols()
            )));
        }
        let y = md.vector(Role::Response)?.into_owned();
        if let Some(bad) = y.iter().find(|v| **v < 0.0) {
            return Err(Error::Validation(format!("{}: negative response {}", M::NAME, bad)));
        }
        let offset = md.offset();
        let w = md.weights().values();
        let moments = Moments::<M> {
            x: &x,
            z: &z,
            y: &y,
            offset: offset.as_ref(),
            w,
            n: md.nobs(),
            _moment: PhantomData,
        };

        let start_cfg = MleConfig { novar: true, accept_unconverged: true, ..MleConfig::default() };
        let init = match Poisson::fit_with(md, &start_cfg) {
            Ok(p) => p.coef().clone(),
            Err(e) => {
                log::debug!("{}: Poisson starting values unavailable ({}), using zeros", M::NAME, e);
                DVector::zeros(x.ncols())
            }
        };

        let tsls_weight = || -> Result<DMatrix<f64>> {
            let zz = z.transpose() * weighted(&z, w) / md.nobs();
            inverse(&zz, "instrument cross-product")
        };
        let (step, weight) = match config.method {
            GmmMethod::OneStep => {
                let a = DMatrix::identity(z.ncols(), z.ncols());
                (moments.gauss_newton(init, &a, config, M::NAME)?, a)
            }
            GmmMethod::Tsls => {
                let a = tsls_weight()?;
                (moments.gauss_newton(init, &a, config, M::NAME)?, a)
            }
            GmmMethod::TwoStepGmm | GmmMethod::OptimalGmm => {
                let a1 = tsls_weight()?;
                let first = moments.gauss_newton(init, &a1, config, M::NAME)?;
                let corr = vcov::robust_structure(md.corr(), M::NAME);
                let omega = vcov::meat(&moments.scores(&first.beta), &corr, md.weights())?;
                let a2 = inverse(&(omega / md.nobs()), "moment covariance")?;
                (moments.gauss_newton(first.beta, &a2, config, M::NAME)?, a2)
            }
        };
        log::debug!("{}: {} iterations, |grad|={:.3e}", M::NAME, step.iterations, step.grad_norm);

        let model = ExpGmm {
            sample: md.clone(),
            method: config.method,
            beta: step.beta,
            weight,
            vcov: None,
            iterations: step.iterations,
            converged: step.converged,
            _moment: PhantomData,
        };
        finish(model, config.novar)
    }
}

impl<M: Moment> ExpGmm<M> {
    fn with_moments<T>(&self, f: impl FnOnce(&Moments<'_, M>) -> T) -> T {
        let x = self.sample.regressors();
        let z = self.sample.matrix(&[Role::Instrument, Role::Control]);
        let y = self
            .sample
            .vector(Role::Response)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| DVector::zeros(self.sample.nrows()));
        let offset = self.sample.offset();
        let m = Moments::<M> {
            x: &x,
            z: &z,
            y: &y,
            offset: offset.as_ref(),
            w: self.sample.weights().values(),
            n: self.sample.nobs(),
            _moment: PhantomData,
        };
        f(&m)
    }

    /// Weight-matrix choice used for this fit.
    pub fn method(&self) -> GmmMethod {
        self.method
    }

    /// GMM weight matrix (mean scale).
    pub fn weight_matrix(&self) -> &DMatrix<f64> {
        &self.weight
    }

    /// Mean moments at the estimate.
    pub fn moments(&self) -> DVector<f64> {
        self.with_moments(|m| m.gbar(&self.beta))
    }

    /// Gauss-Newton iterations of the final step.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Whether the final step met its tolerance.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Poisson regression of the response on treatment and controls.
    pub fn poisson(md: &Microdata) -> Result<Poisson> {
        Poisson::fit(md)
    }

    /// Poisson regression of the response on instruments and controls.
    pub fn reduced_form(md: &Microdata) -> Result<Poisson> {
        md.require(&[Role::Response, Role::Instrument], "reduced form")?;
        let rf = md.reassign(&[
            (Role::Control, &[Role::Instrument, Role::Control][..]),
            (Role::Treatment, &[][..]),
            (Role::Instrument, &[][..]),
        ]);
        Poisson::fit(&rf)
    }
}

impl<M: Moment> Estimator for ExpGmm<M> {
    fn name(&self) -> &str {
        M::NAME
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
        check_vcov(M::NAME, self.beta.len(), &vcov)?;
        self.vcov = Some(vcov);
        Ok(())
    }

    fn coef_names(&self) -> Vec<String> {
        self.sample.regressor_names()
    }

    fn score(&self) -> DMatrix<f64> {
        self.with_moments(|m| m.scores(&self.beta))
    }

    fn jacobian(&self) -> Result<DMatrix<f64>> {
        Ok(self.with_moments(|m| m.jac(&self.beta)) * self.sample.nobs())
    }

    fn bread(&self) -> Result<DMatrix<f64>> {
        let j = self.jacobian()?;
        let ja = j.transpose() * &self.weight;
        Ok(inverse(&(&ja * &j), &format!("{} bread", M::NAME))? * ja)
    }

    fn variance(&self) -> Result<DMatrix<f64>> {
        match self.method {
            GmmMethod::OptimalGmm => {
                let j = self.jacobian()?;
                let a = &self.weight / self.sample.nobs();
                inverse(&(j.transpose() * a * &j), &format!("{} optimal variance", M::NAME))
            }
            _ => vcov::robust(self),
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
        self.predict().map(math::exp_clamped)
    }

    fn jacobexp(&self) -> Option<DMatrix<f64>> {
        let mu = self.fitted();
        Some(scale_rows(&self.sample.regressors(), mu.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, INTERCEPT};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal, Poisson as PoissonDist};

    /// Counts with `log E[y|d] = 0.5 + 0.5 d`, `d = (z1 + z2 + v) / 2`, and an
    /// unobserved multiplicative shock correlated with `v` when `endogenous`.
    fn counts(n: usize, seed: u64, endogenous: bool) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let (mut y, mut d, mut z1, mut z2) = (vec![], vec![], vec![], vec![]);
        for _ in 0..n {
            let a: f64 = normal.sample(&mut rng);
            let b: f64 = normal.sample(&mut rng);
            let v: f64 = normal.sample(&mut rng);
            let e: f64 = normal.sample(&mut rng);
            let di = 0.5 * a + 0.5 * b + 0.5 * v;
            let eps = if endogenous { 0.5 * v + 0.5 * e } else { 0.0 };
            let shock = if endogenous { (eps - 0.25_f64).exp() } else { 1.0 };
            let lambda = (0.5 + 0.5 * di).exp() * shock;
            y.push(PoissonDist::new(lambda).unwrap().sample(&mut rng));
            d.push(di);
            z1.push(a);
            z2.push(b);
        }
        Dataset::new()
            .with_column("y", y)
            .unwrap()
            .with_column("d", d)
            .unwrap()
            .with_column("z1", z1)
            .unwrap()
            .with_column("z2", z2)
            .unwrap()
    }

    fn sample(ds: &Dataset, instruments: &[&str]) -> Microdata {
        Microdata::builder(ds)
            .response("y")
            .treatment(&["d"])
            .instrument(instruments)
            .control(&[INTERCEPT])
            .build()
            .unwrap()
    }

    #[test]
    fn test_exogenous_instrument_reproduces_poisson() {
        let ds = counts(1000, 8, false);
        let md = sample(&ds, &["d"]);
        let gmm = IvPoisson::fit(&md).unwrap();
        let mle = IvPoisson::poisson(&md).unwrap();
        assert_relative_eq!(gmm.coef(), mle.coef(), epsilon = 1e-6);
        assert!(gmm.converged());
        assert!(max_abs(&gmm.moments()) < 1e-6);
    }

    #[test]
    fn test_iv_poisson_overidentified() {
        let ds = counts(4000, 21, false);
        let md = sample(&ds, &["z1", "z2"]);
        for method in [GmmMethod::OneStep, GmmMethod::Tsls, GmmMethod::TwoStepGmm, GmmMethod::OptimalGmm] {
            let cfg = GmmConfig { method, ..GmmConfig::default() };
            let m = IvPoisson::fit_with(&md, &cfg).unwrap();
            assert!((m.coef()[0] - 0.5).abs() < 0.1, "{:?}: slope={}", method, m.coef()[0]);
            let se = m.stderr().unwrap();
            assert!(se.iter().all(|s| s.is_finite() && *s > 0.0));
        }
    }

    #[test]
    fn test_mullahy_handles_multiplicative_endogeneity() {
        let ds = counts(6000, 4, true);
        let md = sample(&ds, &["z1", "z2"]);
        let cfg = GmmConfig { method: GmmMethod::TwoStepGmm, ..GmmConfig::default() };
        let m = Mullahy::fit_with(&md, &cfg).unwrap();
        assert!((m.coef()[0] - 0.5).abs() < 0.12, "slope={}", m.coef()[0]);
        // Ignoring endogeneity overstates the slope.
        let naive = Mullahy::poisson(&md).unwrap();
        assert!(naive.coef()[0] > m.coef()[0]);
    }

    #[test]
    fn test_reduced_form_uses_instruments() {
        let ds = counts(500, 2, false);
        let md = sample(&ds, &["z1", "z2"]);
        let rf = IvPoisson::reduced_form(&md).unwrap();
        assert_eq!(rf.coef_names(), vec!["z1".to_string(), "z2".to_string(), INTERCEPT.to_string()]);
    }

    #[test]
    fn test_requires_instruments() {
        let ds = counts(100, 2, false);
        let md = Microdata::builder(&ds).response("y").treatment(&["d"]).control(&[INTERCEPT]).build().unwrap();
        assert!(matches!(Mullahy::fit(&md), Err(Error::MissingRole { .. })));
    }
}
