//! Maximum-likelihood models with a single linear index.
//!
//! Binary response models (logit, probit, complementary log-log) and
//! Poisson regression share one implementation parameterized by a
//! [`Family`]. The default solver is Newton-Raphson with step halving on
//! the weighted log-likelihood; L-BFGS is available as an alternative.

use std::fmt;
use std::marker::PhantomData;

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};
use mx_prob::{math, normal};

use crate::corr::InfoMethod;
use crate::data::{Microdata, Role};
use crate::estimator::{check_vcov, finish, Estimator, Fit};
use crate::linalg::{inverse, max_abs, scale_rows, solve, weighted};
use crate::linear::least_squares;
use crate::optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizerConfig};

/// `x ln x` with the convention `0 ln 0 = 0`.
fn xlogx(x: f64) -> f64 {
    if x > 0.0 { x * x.ln() } else { 0.0 }
}

/// Per-observation likelihood of a single-index model.
pub trait Family: fmt::Debug + Clone + Copy + Default + Send + Sync + 'static {
    /// Model name.
    const NAME: &'static str;

    /// Whether the mean is `exp(η)` (starting values use a log-linear fit).
    const LOG_LINEAR: bool = false;

    /// Whether `y` is in the support.
    fn valid_response(y: f64) -> bool;

    /// Mean `μ(η)`.
    fn mean(eta: f64) -> f64;

    /// `dμ/dη`.
    fn dmean(eta: f64) -> f64;

    /// Log-likelihood contribution.
    fn loglik(y: f64, eta: f64) -> f64;

    /// `(dℓ/dη, -d²ℓ/dη²)`.
    fn derivs(y: f64, eta: f64) -> (f64, f64);

    /// Log-likelihood of the saturated model at `y`.
    fn saturated(y: f64) -> f64;
}

fn binary_saturated(y: f64) -> f64 {
    xlogx(y) + xlogx(1.0 - y)
}

/// Logistic link.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogitLink;

impl Family for LogitLink {
    const NAME: &'static str = "Logit";

    fn valid_response(y: f64) -> bool {
        (0.0..=1.0).contains(&y)
    }

    fn mean(eta: f64) -> f64 {
        math::sigmoid(eta)
    }

    fn dmean(eta: f64) -> f64 {
        let p = math::sigmoid(eta);
        p * (1.0 - p)
    }

    fn loglik(y: f64, eta: f64) -> f64 {
        y * eta - math::log1pexp(eta)
    }

    fn derivs(y: f64, eta: f64) -> (f64, f64) {
        let p = math::sigmoid(eta);
        (y - p, p * (1.0 - p))
    }

    fn saturated(y: f64) -> f64 {
        binary_saturated(y)
    }
}

/// Standard normal link.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbitLink;

impl Family for ProbitLink {
    const NAME: &'static str = "Probit";

    fn valid_response(y: f64) -> bool {
        (0.0..=1.0).contains(&y)
    }

    fn mean(eta: f64) -> f64 {
        normal::cdf(eta)
    }

    fn dmean(eta: f64) -> f64 {
        normal::pdf(eta)
    }

    fn loglik(y: f64, eta: f64) -> f64 {
        let mut ll = 0.0;
        if y > 0.0 {
            ll += y * normal::log_cdf(eta);
        }
        if y < 1.0 {
            ll += (1.0 - y) * normal::log_cdf(-eta);
        }
        ll
    }

    fn derivs(y: f64, eta: f64) -> (f64, f64) {
        let r1 = normal::mills(eta);
        let r0 = normal::mills(-eta);
        let g = y * r1 - (1.0 - y) * r0;
        let h = y * r1 * (eta + r1) + (1.0 - y) * r0 * (r0 - eta);
        (g, h)
    }

    fn saturated(y: f64) -> f64 {
        binary_saturated(y)
    }
}

/// Complementary log-log link.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloglogLink;

impl Family for CloglogLink {
    const NAME: &'static str = "Cloglog";

    fn valid_response(y: f64) -> bool {
        (0.0..=1.0).contains(&y)
    }

    fn mean(eta: f64) -> f64 {
        math::inv_cloglog(eta)
    }

    fn dmean(eta: f64) -> f64 {
        let t = math::exp_clamped(eta);
        t * (-t).exp()
    }

    fn loglik(y: f64, eta: f64) -> f64 {
        let t = math::exp_clamped(eta);
        let mut ll = 0.0;
        if y > 0.0 {
            ll += y * (-(-t).exp_m1()).ln();
        }
        if y < 1.0 {
            ll -= (1.0 - y) * t;
        }
        ll
    }

    fn derivs(y: f64, eta: f64) -> (f64, f64) {
        let t = math::exp_clamped(eta);
        let q = math::t_over_expm1(t);
        // q * e^t written without overflow.
        let qe = t / -(-t).exp_m1();
        let g = y * q - (1.0 - y) * t;
        let h = y * q * (qe - 1.0) + (1.0 - y) * t;
        (g, h)
    }

    fn saturated(y: f64) -> f64 {
        binary_saturated(y)
    }
}

/// Log link with Poisson variance.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLink;

impl Family for LogLink {
    const NAME: &'static str = "Poisson";
    const LOG_LINEAR: bool = true;

    fn valid_response(y: f64) -> bool {
        y >= 0.0
    }

    fn mean(eta: f64) -> f64 {
        math::exp_clamped(eta)
    }

    fn dmean(eta: f64) -> f64 {
        math::exp_clamped(eta)
    }

    fn loglik(y: f64, eta: f64) -> f64 {
        y * eta - math::exp_clamped(eta) - statrs::function::gamma::ln_gamma(y + 1.0)
    }

    fn derivs(y: f64, eta: f64) -> (f64, f64) {
        let mu = math::exp_clamped(eta);
        (y - mu, mu)
    }

    fn saturated(y: f64) -> f64 {
        xlogx(y) - y - statrs::function::gamma::ln_gamma(y + 1.0)
    }
}

/// Logistic regression.
pub type Logit = Mle<LogitLink>;
/// Probit regression.
pub type Probit = Mle<ProbitLink>;
/// Complementary log-log regression.
pub type Cloglog = Mle<CloglogLink>;
/// Poisson regression.
pub type Poisson = Mle<LogLink>;

/// Optimizer used for likelihood maximization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Solver {
    /// Newton-Raphson with step halving.
    #[default]
    Newton,
    /// Quasi-Newton L-BFGS on the mean negative log-likelihood.
    Lbfgs,
}

/// Options for likelihood models.
#[derive(Debug, Clone, PartialEq)]
pub struct MleConfig {
    /// Iteration budget.
    pub max_iter: usize,
    /// Tolerance on the max-abs gradient of the mean log-likelihood.
    pub tol: f64,
    /// Keep the last iterate (with a warning) instead of failing.
    pub accept_unconverged: bool,
    /// Optimizer.
    pub solver: Solver,
    /// Skip the variance computation.
    pub novar: bool,
}

impl Default for MleConfig {
    fn default() -> Self {
        Self { max_iter: 100, tol: 1e-8, accept_unconverged: false, solver: Solver::Newton, novar: false }
    }
}

/// Weighted log-likelihood over a fixed design.
struct Problem<'a, F> {
    x: &'a DMatrix<f64>,
    y: &'a DVector<f64>,
    offset: Option<&'a DVector<f64>>,
    w: Option<&'a [f64]>,
    _family: PhantomData<F>,
}

struct Derivatives {
    loglik: f64,
    grad: DVector<f64>,
    info: DMatrix<f64>,
}

struct Solution {
    beta: DVector<f64>,
    loglik: f64,
    iterations: usize,
    grad_norm: f64,
    converged: bool,
}

const MAX_HALVINGS: usize = 40;

impl<'a, F: Family> Problem<'a, F> {
    fn new(x: &'a DMatrix<f64>, y: &'a DVector<f64>, offset: Option<&'a DVector<f64>>, w: Option<&'a [f64]>) -> Self {
        Self { x, y, offset, w, _family: PhantomData }
    }

    fn weight(&self, i: usize) -> f64 {
        self.w.map_or(1.0, |w| w[i])
    }

    fn total_weight(&self) -> f64 {
        self.w.map_or(self.y.len() as f64, |w| w.iter().map(|v| v.abs()).sum::<f64>().max(f64::MIN_POSITIVE))
    }

    fn eta(&self, beta: &DVector<f64>) -> DVector<f64> {
        let xb = self.x * beta;
        match self.offset {
            Some(o) => xb + o,
            None => xb,
        }
    }

    fn loglik(&self, beta: &DVector<f64>) -> f64 {
        let eta = self.eta(beta);
        (0..self.y.len()).map(|i| self.weight(i) * F::loglik(self.y[i], eta[i])).sum()
    }

    fn derivatives(&self, beta: &DVector<f64>) -> Derivatives {
        let eta = self.eta(beta);
        let n = self.y.len();
        let mut wg = DVector::zeros(n);
        let mut wh = vec![0.0; n];
        let mut ll = 0.0;
        for i in 0..n {
            let w = self.weight(i);
            let (g, h) = F::derivs(self.y[i], eta[i]);
            ll += w * F::loglik(self.y[i], eta[i]);
            wg[i] = w * g;
            wh[i] = w * h;
        }
        Derivatives {
            loglik: ll,
            grad: self.x.transpose() * wg,
            info: self.x.transpose() * scale_rows(self.x, &wh),
        }
    }

    fn newton(&self, init: DVector<f64>, cfg: &MleConfig, stage: &str) -> Result<Solution> {
        let sw = self.total_weight();
        let mut beta = init;
        let mut d = self.derivatives(&beta);
        let mut iterations = 0;
        while iterations < cfg.max_iter {
            if max_abs(&d.grad) / sw < cfg.tol {
                break;
            }
            let delta = solve(&d.info, &d.grad, stage)?;
            let floor = d.loglik - 1e-12 * d.loglik.abs().max(1.0);
            let mut step = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let cand = &beta + &delta * step;
                let ll = self.loglik(&cand);
                if ll.is_finite() && ll >= floor {
                    accepted = Some(cand);
                    break;
                }
                step *= 0.5;
            }
            iterations += 1;
            match accepted {
                Some(b) => {
                    beta = b;
                    d = self.derivatives(&beta);
                }
                None => {
                    log::debug!("{}: line search stalled at iteration {}", stage, iterations);
                    break;
                }
            }
        }
        let grad_norm = max_abs(&d.grad) / sw;
        Ok(Solution { beta, loglik: d.loglik, iterations, grad_norm, converged: grad_norm < cfg.tol })
    }

    fn lbfgs(&self, init: DVector<f64>, cfg: &MleConfig) -> Result<Solution> {
        let opt = LbfgsOptimizer::new(OptimizerConfig { max_iter: cfg.max_iter as u64, tol: cfg.tol, m: 10 });
        let res = opt.minimize(self, init.as_slice())?;
        let beta = DVector::from_vec(res.parameters);
        let d = self.derivatives(&beta);
        let grad_norm = max_abs(&d.grad) / self.total_weight();
        Ok(Solution {
            beta,
            loglik: d.loglik,
            iterations: res.n_iter as usize,
            grad_norm,
            converged: res.converged || grad_norm < cfg.tol,
        })
    }

    fn solve(&self, init: DVector<f64>, cfg: &MleConfig, stage: &str) -> Result<Solution> {
        let sol = match cfg.solver {
            Solver::Newton => self.newton(init, cfg, stage)?,
            Solver::Lbfgs => self.lbfgs(init, cfg)?,
        };
        if !sol.converged {
            if cfg.accept_unconverged {
                log::warn!(
                    "{}: accepting unconverged estimate after {} iterations (|grad|={:.3e})",
                    stage,
                    sol.iterations,
                    sol.grad_norm
                );
            } else {
                return Err(Error::NonConvergence {
                    stage: stage.to_string(),
                    iterations: sol.iterations,
                    grad_norm: sol.grad_norm,
                });
            }
        }
        Ok(sol)
    }

    /// Zeros, or a log-linear least-squares fit for log-link models.
    fn start(&self) -> DVector<f64> {
        let k = self.x.ncols();
        if F::LOG_LINEAR {
            let z = DVector::from_iterator(
                self.y.len(),
                (0..self.y.len()).map(|i| (self.y[i] + 0.1).ln() - self.offset.map_or(0.0, |o| o[i])),
            );
            if let Ok(b) = least_squares(self.x, &z, self.w, "starting values") {
                if b.iter().all(|v| v.is_finite()) && self.loglik(&b).is_finite() {
                    return b;
                }
            }
        }
        DVector::zeros(k)
    }
}

impl<F: Family> ObjectiveFunction for Problem<'_, F> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        Ok(-self.loglik(&DVector::from_column_slice(params)) / self.total_weight())
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let d = self.derivatives(&DVector::from_column_slice(params));
        let sw = self.total_weight();
        Ok(d.grad.iter().map(|g| -g / sw).collect())
    }
}

/// Fitted single-index likelihood model.
#[derive(Debug, Clone)]
pub struct Mle<F: Family> {
    sample: Microdata,
    beta: DVector<f64>,
    vcov: Option<DMatrix<f64>>,
    loglik: f64,
    iterations: usize,
    converged: bool,
    config: MleConfig,
    _family: PhantomData<F>,
}

impl<F: Family> Fit for Mle<F> {
    type Config = MleConfig;

    fn fit_with(md: &Microdata, config: &MleConfig) -> Result<Self> {
        md.require(&[Role::Response], F::NAME)?;
        if !md.has(Role::Control) && !md.has(Role::Treatment) {
            return Err(Error::missing_role(Role::Control.as_str(), F::NAME));
        }
        let x = md.regressors();
        let y = md.vector(Role::Response)?.into_owned();
        if let Some(bad) = y.iter().find(|v| !F::valid_response(**v)) {
            return Err(Error::Validation(format!("{}: response value {} outside the support", F::NAME, bad)));
        }
        let offset = md.offset();
        let problem = Problem::<F>::new(&x, &y, offset.as_ref(), md.weights().values());
        let sol = problem.solve(problem.start(), config, F::NAME)?;
        log::debug!("{}: converged={} after {} iterations, loglik={:.6}", F::NAME, sol.converged, sol.iterations, sol.loglik);

        let model = Mle {
            sample: md.clone(),
            beta: sol.beta,
            vcov: None,
            loglik: sol.loglik,
            iterations: sol.iterations,
            converged: sol.converged,
            config: config.clone(),
            _family: PhantomData,
        };
        finish(model, config.novar)
    }
}

impl<F: Family> Mle<F> {
    fn design(&self) -> (DMatrix<f64>, DVector<f64>, Option<DVector<f64>>) {
        let y = self
            .sample
            .vector(Role::Response)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| DVector::zeros(self.sample.nrows()));
        (self.sample.regressors(), y, self.sample.offset())
    }

    /// Maximized weighted log-likelihood.
    pub fn loglikelihood(&self) -> f64 {
        self.loglik
    }

    /// Log-likelihood of the intercept-only model (with the same offset).
    pub fn nullloglikelihood(&self) -> Result<f64> {
        let (_, y, offset) = self.design();
        let ones = DMatrix::from_element(y.len(), 1, 1.0);
        let problem = Problem::<F>::new(&ones, &y, offset.as_ref(), self.sample.weights().values());
        let stage = format!("{} null model", F::NAME);
        Ok(problem.solve(problem.start(), &self.config, &stage)?.loglik)
    }

    fn saturated_loglik(&self) -> f64 {
        let (_, y, _) = self.design();
        let w = self.sample.weights();
        y.iter().enumerate().map(|(i, &v)| w.get(i) * F::saturated(v)).sum()
    }

    /// `2 (ℓ_saturated - ℓ)`.
    pub fn deviance(&self) -> f64 {
        2.0 * (self.saturated_loglik() - self.loglik)
    }

    /// Deviance of the intercept-only model.
    pub fn nulldeviance(&self) -> Result<f64> {
        Ok(2.0 * (self.saturated_loglik() - self.nullloglikelihood()?))
    }

    /// McFadden pseudo R², `1 - ℓ / ℓ₀`.
    pub fn r2(&self) -> Result<f64> {
        Ok(1.0 - self.loglik / self.nullloglikelihood()?)
    }

    /// Adjusted McFadden pseudo R², `1 - (ℓ - k) / ℓ₀`.
    pub fn adjr2(&self) -> Result<f64> {
        Ok(1.0 - (self.loglik - self.beta.len() as f64) / self.nullloglikelihood()?)
    }

    /// Akaike information criterion.
    pub fn aic(&self) -> f64 {
        2.0 * self.beta.len() as f64 - 2.0 * self.loglik
    }

    /// Small-sample corrected AIC.
    pub fn aicc(&self) -> f64 {
        let k = self.beta.len() as f64;
        self.aic() + 2.0 * k * (k + 1.0) / (self.nobs() - k - 1.0)
    }

    /// Bayesian information criterion.
    pub fn bic(&self) -> f64 {
        -2.0 * self.loglik + self.beta.len() as f64 * self.nobs().ln()
    }

    /// Solver iterations.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Whether the solver met its tolerance.
    pub fn converged(&self) -> bool {
        self.converged
    }
}

impl<F: Family> Estimator for Mle<F> {
    fn name(&self) -> &str {
        F::NAME
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
        check_vcov(F::NAME, self.beta.len(), &vcov)?;
        self.vcov = Some(vcov);
        Ok(())
    }

    fn coef_names(&self) -> Vec<String> {
        self.sample.regressor_names()
    }

    fn score(&self) -> DMatrix<f64> {
        let (x, y, _) = self.design();
        let eta = self.predict();
        let g: Vec<f64> = (0..y.len()).map(|i| -F::derivs(y[i], eta[i]).0).collect();
        scale_rows(&x, &g)
    }

    fn jacobian(&self) -> Result<DMatrix<f64>> {
        let (x, y, offset) = self.design();
        let problem = Problem::<F>::new(&x, &y, offset.as_ref(), self.sample.weights().values());
        Ok(problem.derivatives(&self.beta).info)
    }

    fn homoscedastic_vcov(&self, method: InfoMethod) -> Result<DMatrix<f64>> {
        match method {
            InfoMethod::Oim => self.bread(),
            InfoMethod::Opg => {
                let s = self.score();
                let opg = s.transpose() * weighted(&s, self.sample.weights().values());
                inverse(&opg, &format!("{} outer product of gradients", F::NAME))
            }
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
        self.predict().map(F::mean)
    }

    fn jacobexp(&self) -> Option<DMatrix<f64>> {
        let d: Vec<f64> = self.predict().iter().map(|&e| F::dmean(e)).collect();
        Some(scale_rows(&self.sample.regressors(), &d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corr::CorrStructure;
    use crate::data::{Dataset, INTERCEPT};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal, Poisson as PoissonDist};

    fn check_derivatives<F: Family>(y: f64, eta: f64) {
        let h = 1e-5;
        let (g, hh) = F::derivs(y, eta);
        let g_num = (F::loglik(y, eta + h) - F::loglik(y, eta - h)) / (2.0 * h);
        let g_up = F::derivs(y, eta + h).0;
        let g_down = F::derivs(y, eta - h).0;
        let h_num = -(g_up - g_down) / (2.0 * h);
        assert!((g - g_num).abs() < 1e-6 * (1.0 + g.abs()), "{} grad y={} eta={}: {} vs {}", F::NAME, y, eta, g, g_num);
        assert!((hh - h_num).abs() < 1e-5 * (1.0 + hh.abs()), "{} hess y={} eta={}: {} vs {}", F::NAME, y, eta, hh, h_num);
        let m_num = (F::mean(eta + h) - F::mean(eta - h)) / (2.0 * h);
        assert!((F::dmean(eta) - m_num).abs() < 1e-6, "{} dmean eta={}", F::NAME, eta);
    }

    #[test]
    fn test_analytic_derivatives() {
        for &eta in &[-3.0, -0.7, 0.0, 0.4, 2.5] {
            for &y in &[0.0, 1.0, 0.3] {
                check_derivatives::<LogitLink>(y, eta);
                check_derivatives::<ProbitLink>(y, eta);
                check_derivatives::<CloglogLink>(y, eta);
            }
            for &y in &[0.0, 1.0, 4.0] {
                check_derivatives::<LogLink>(y, eta);
            }
        }
    }

    fn binary_data(n: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            let xi: f64 = normal.sample(&mut rng);
            let p = math::sigmoid(-0.5 + 1.2 * xi);
            x.push(xi);
            y.push(if rng.random::<f64>() < p { 1.0 } else { 0.0 });
        }
        Dataset::new().with_column("x", x).unwrap().with_column("y", y).unwrap()
    }

    #[test]
    fn test_logit_recovers_parameters() {
        let ds = binary_data(5000, 42);
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        let m = Logit::fit(&md).unwrap();
        assert!(m.converged());
        assert!((m.coef()[0] - 1.2).abs() < 0.15, "slope={}", m.coef()[0]);
        assert!((m.coef()[1] + 0.5).abs() < 0.15, "intercept={}", m.coef()[1]);

        // Score sums to zero at the optimum.
        let total = m.score().row_sum();
        assert!(total.iter().all(|v| v.abs() < 1e-6));

        let r2 = m.r2().unwrap();
        assert!(r2 > 0.0 && r2 < 1.0);
        assert!(m.adjr2().unwrap() < r2);
        assert_relative_eq!(m.deviance(), -2.0 * m.loglikelihood(), epsilon = 1e-9);
        assert!(m.bic() > m.aic());
    }

    #[test]
    fn test_lbfgs_agrees_with_newton() {
        let ds = binary_data(800, 9);
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        let newton = Probit::fit(&md).unwrap();
        let cfg = MleConfig { solver: Solver::Lbfgs, tol: 1e-7, ..MleConfig::default() };
        let lbfgs = Probit::fit_with(&md, &cfg).unwrap();
        assert_relative_eq!(newton.coef(), lbfgs.coef(), epsilon = 1e-3);
    }

    #[test]
    fn test_oim_and_opg_are_close_for_correct_model() {
        let ds = binary_data(4000, 5);
        let oim = Microdata::builder(&ds)
            .response("y")
            .control(&["x", INTERCEPT])
            .corr(CorrStructure::homoscedastic(InfoMethod::Oim))
            .build()
            .unwrap();
        let opg = Microdata::builder(&ds)
            .response("y")
            .control(&["x", INTERCEPT])
            .corr(CorrStructure::homoscedastic(InfoMethod::Opg))
            .build()
            .unwrap();
        let robust = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        let a = Logit::fit(&oim).unwrap().stderr().unwrap();
        let b = Logit::fit(&opg).unwrap().stderr().unwrap();
        let c = Logit::fit(&robust).unwrap().stderr().unwrap();
        for i in 0..2 {
            assert!((a[i] / b[i] - 1.0).abs() < 0.1);
            assert!((a[i] / c[i] - 1.0).abs() < 0.1);
        }
    }

    #[test]
    fn test_cloglog_and_probit_fit() {
        let ds = binary_data(2000, 17);
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        let c = Cloglog::fit(&md).unwrap();
        let p = Probit::fit(&md).unwrap();
        assert!(c.coef()[0] > 0.0 && p.coef()[0] > 0.0);
        // Probit slopes are roughly logit slopes / 1.6.
        let l = Logit::fit(&md).unwrap();
        assert!((l.coef()[0] / p.coef()[0] - 1.7).abs() < 0.2);
        let fitted = c.fitted();
        assert!(fitted.iter().all(|v| *v > 0.0 && *v < 1.0));
        let jx = c.jacobexp().unwrap();
        assert_eq!(jx.shape(), (2000, 2));
    }

    #[test]
    fn test_poisson_with_offset() {
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let n = 3000;
        let mut x = Vec::with_capacity(n);
        let mut expo = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for i in 0..n {
            let xi: f64 = normal.sample(&mut rng);
            let e = (1.0 + (i % 3) as f64).ln();
            let mu = (0.3 + 0.5 * xi + e).exp();
            x.push(xi);
            expo.push(e);
            y.push(PoissonDist::new(mu).unwrap().sample(&mut rng));
        }
        let ds = Dataset::new()
            .with_column("x", x)
            .unwrap()
            .with_column("exposure", expo)
            .unwrap()
            .with_column("y", y)
            .unwrap();
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).offset("exposure").build().unwrap();
        let m = Poisson::fit(&md).unwrap();
        assert!((m.coef()[0] - 0.5).abs() < 0.05);
        assert!((m.coef()[1] - 0.3).abs() < 0.05);
        assert!(m.deviance() >= 0.0);
        assert!(m.nulldeviance().unwrap() > m.deviance());
    }

    #[test]
    fn test_invalid_response_and_nonconvergence() {
        let ds = Dataset::new()
            .with_column("x", vec![0.0, 1.0, 2.0, 3.0])
            .unwrap()
            .with_column("y", vec![0.0, 2.0, 1.0, 0.0])
            .unwrap();
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        assert!(matches!(Logit::fit(&md), Err(Error::Validation(_))));

        let ds = binary_data(200, 1);
        let md = Microdata::builder(&ds).response("y").control(&["x", INTERCEPT]).build().unwrap();
        let cfg = MleConfig { max_iter: 1, ..MleConfig::default() };
        assert!(matches!(Logit::fit_with(&md, &cfg), Err(Error::NonConvergence { .. })));
        let lenient = MleConfig { max_iter: 1, accept_unconverged: true, ..MleConfig::default() };
        let m = Logit::fit_with(&md, &lenient).unwrap();
        assert!(!m.converged());
    }
}
