//! # mx-inference
//!
//! Variance estimation and model composition for microeconometric models.
//!
//! This crate provides:
//! - an estimation sample with variable roles, weights and a correlation
//!   structure ([`Microdata`], [`CorrStructure`]);
//! - the [`Estimator`] contract and a sandwich variance engine ([`vcov`])
//!   shared by every model;
//! - linear models ([`Ols`], [`Iv`]), likelihood models ([`Logit`],
//!   [`Probit`], [`Cloglog`], [`Poisson`]) and exponential-mean GMM
//!   ([`IvPoisson`], [`Mullahy`]);
//! - two-stage reweighting estimators ([`TwoStage`]);
//! - Hausman comparisons of two fitted models ([`hausman_1s`],
//!   [`hausman_2s`], [`hausman_2s_corr`]).
//!
//! ## Architecture
//!
//! Fitted models hold a read-only view of the shared data matrix. Fits are
//! single-threaded and share no mutable state, so independent fits can run
//! on separate threads.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Correlation structures and kernels.
pub mod corr;
/// Dataset, variable roles, weights and estimation samples.
pub mod data;
/// The estimator contract.
pub mod estimator;
/// Exponential-mean GMM (IV Poisson, Mullahy).
pub mod gmm;
/// Hausman comparisons.
pub mod hausman;
/// Dense linear-algebra helpers.
pub mod linalg;
/// OLS and linear IV-GMM.
pub mod linear;
/// Maximum-likelihood single-index models.
pub mod mle;
/// L-BFGS minimization (argmin backend).
pub mod optimizer;
/// Two-stage propensity reweighting.
pub mod reweighting;
/// Standard errors, p-values, intervals and tables.
pub mod summary;
/// Sandwich variance engine.
pub mod vcov;

pub use corr::{CorrStructure, CrossCorrelation, CrossPattern, InfoMethod, Kernel, MissingCluster};
pub use data::{Dataset, Microdata, MicrodataBuilder, Role, Weights, INTERCEPT};
pub use estimator::{Estimator, Fit, FitOptions};
pub use gmm::{ExpGmm, GmmConfig, GmmMethod, IvPoisson, Mullahy};
pub use hausman::{hausman_1s, hausman_2s, hausman_2s_corr, ParObject};
pub use linear::{Iv, IvConfig, IvMethod, Ols};
pub use mle::{Cloglog, Family, Logit, Mle, MleConfig, Poisson, Probit, Solver};
pub use optimizer::{LbfgsOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig};
pub use reweighting::{FirstStage, FirstStageFit, ReweightingConfig, Reweighting, SecondStage, TwoStage, TwoStagePlan};
