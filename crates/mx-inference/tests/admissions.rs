//! End-to-end scenario on a synthetic admissions sample:
//! - linear probability model of `admit` on `gre`, `gpa` and rank dummies
//!   under the default heteroscedastic structure;
//! - same-sample Hausman comparison of the `gre` coefficient against the
//!   model without rank dummies.

use approx::assert_relative_eq;
use mx_inference::{
    CorrStructure, Dataset, Estimator, Fit, Logit, Microdata, Ols, TwoStage, hausman_1s, INTERCEPT,
};
use mx_inference::{FirstStage, Reweighting, ReweightingConfig};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

const N: usize = 400;

/// Higher ranks (worse schools) send students with higher test scores but
/// admit fewer of them, so omitting rank biases the `gre` coefficient.
fn admissions(seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let eps = Normal::new(0.0, 1.0).unwrap();
    let mut admit = Vec::with_capacity(N);
    let mut gre = Vec::with_capacity(N);
    let mut gpa = Vec::with_capacity(N);
    let mut rank = Vec::with_capacity(N);
    for _ in 0..N {
        let r: i64 = rng.random_range(1..=4);
        let g = (500.0 + 40.0 * r as f64 + 80.0 * eps.sample(&mut rng)).clamp(200.0, 800.0);
        let a = (3.0 + 0.3 * eps.sample(&mut rng)).clamp(2.0, 4.0);
        let p = (0.3 + 0.001 * (g - 600.0) + 0.15 * (a - 3.4) - 0.12 * (r - 1) as f64).clamp(0.02, 0.98);
        admit.push(if rng.random::<f64>() < p { 1.0 } else { 0.0 });
        gre.push(g);
        gpa.push(a);
        rank.push(Some(r));
    }
    Dataset::new()
        .with_column("admit", admit)
        .unwrap()
        .with_column("gre", gre)
        .unwrap()
        .with_column("gpa", gpa)
        .unwrap()
        .with_dummies("rank", &rank)
        .unwrap()
}

const FULL: [&str; 6] = ["gre", "gpa", "rank: 2", "rank: 3", "rank: 4", INTERCEPT];

fn sample(ds: &Dataset, controls: &[&str]) -> Microdata {
    Microdata::builder(ds).response("admit").control(controls).build().unwrap()
}

#[test]
fn linear_probability_model_has_six_coefficients() {
    let ds = admissions(2024);
    let md = sample(&ds, &FULL);
    let m = Ols::fit(&md).unwrap();

    assert_eq!(m.coef().len(), 6);
    assert_eq!(m.coef_names(), FULL.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    assert_eq!(m.nobs(), N as f64);

    // HC1 by hand: (X'X)^-1 X' diag(u^2) X (X'X)^-1 n / (n - 1).
    let x = md.regressors();
    let u = m.residuals();
    let xtx_inv = (x.transpose() * &x).try_inverse().unwrap();
    let xu = DMatrix::from_fn(N, 6, |i, j| x[(i, j)] * u[i]);
    let hc1 = &xtx_inv * (xu.transpose() * &xu) * &xtx_inv * (N as f64 / (N as f64 - 1.0));
    assert_relative_eq!(m.vcov().unwrap(), &hc1, epsilon = 1e-12, max_relative = 1e-9);

    let table = m.coeftable(0.95).unwrap();
    let gpa = table.get("gpa").unwrap();
    assert!(gpa.stderr > 0.0 && gpa.lower < gpa.estimate && gpa.estimate < gpa.upper);
    // The worst rank admits clearly fewer students than the second.
    let c = m.coef();
    assert!(c[4] < 0.0 && c[4] < c[2]);
}

#[test]
fn hausman_detects_omitted_rank() {
    let ds = admissions(2024);
    let full = Ols::fit(&sample(&ds, &FULL)).unwrap();
    let reduced = Ols::fit(&sample(&ds, &["gre", "gpa", INTERCEPT])).unwrap();

    let h = hausman_1s(&full, &reduced, Some(&["gre"])).unwrap();
    assert_eq!(h.names(), &["gre".to_string()]);
    let t = h.tstat()[0];
    assert!(t.abs() > 1.96, "t = {}", t);
    assert!(h.pval()[0] < 0.05);
}

#[test]
fn logit_and_linear_agree_on_signs() {
    let ds = admissions(7);
    let md = sample(&ds, &FULL);
    let lpm = Ols::fit(&md).unwrap();
    let logit = Logit::fit(&md).unwrap();
    for i in [0, 4] {
        assert_eq!(lpm.coef()[i].signum(), logit.coef()[i].signum(), "{}", FULL[i]);
    }
}

#[test]
fn clustered_by_rank_and_reweighted() {
    let ds = admissions(11);
    let rank: Vec<u64> = (0..N)
        .map(|i| {
            let r2 = ds.column("rank: 2").unwrap()[i];
            let r3 = ds.column("rank: 3").unwrap()[i];
            let r4 = ds.column("rank: 4").unwrap()[i];
            (1.0 + r2 + 2.0 * r3 + 3.0 * r4) as u64
        })
        .collect();

    // Four clusters: valid, if coarse.
    let md = Microdata::builder(&ds)
        .response("admit")
        .control(&["gre", "gpa", INTERCEPT])
        .corr(CorrStructure::clustered(rank))
        .build()
        .unwrap();
    let m = Ols::fit(&md).unwrap();
    assert!(m.stderr().unwrap().iter().all(|s| s.is_finite()));

    // IPW of admission on a high-gpa indicator.
    let high: Vec<f64> = ds.column("gpa").unwrap().iter().map(|g| if *g > 3.0 { 1.0 } else { 0.0 }).collect();
    let ds = ds.with_column("high", high).unwrap();
    let md = Microdata::builder(&ds)
        .response("admit")
        .treatment(&["high"])
        .control(&["gre", INTERCEPT])
        .build()
        .unwrap();
    let ipw = TwoStage::fit(Reweighting::Ipw, &md, FirstStage::Logit, &ReweightingConfig::default()).unwrap();
    assert_eq!(ipw.coef().len(), 2);
    assert!(ipw.stderr().unwrap()[0] > 0.0);
}
