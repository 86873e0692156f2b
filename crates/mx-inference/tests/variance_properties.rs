//! Properties of the variance engine that hold across estimators:
//! - heteroscedastic variance is the diagonal special case of cross-correlation
//! - clustered estimates do not depend on row order
//! - restricting a structure is idempotent
//! - unit and all-ones weights give identical results
//! - frequency weights match replicated rows

use approx::assert_relative_eq;
use mx_inference::{
    CorrStructure, CrossCorrelation, Dataset, Estimator, Fit, Kernel, Microdata, MissingCluster, Ols, Poisson,
    Weights, INTERCEPT,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

struct Panel {
    y: Vec<f64>,
    x: Vec<f64>,
    count: Vec<f64>,
    firm: Vec<u64>,
    year: Vec<f64>,
}

fn panel(firms: usize, years: usize, seed: u64) -> Panel {
    let mut rng = StdRng::seed_from_u64(seed);
    let eps = Normal::new(0.0, 1.0).unwrap();
    let mut p = Panel { y: vec![], x: vec![], count: vec![], firm: vec![], year: vec![] };
    for f in 0..firms {
        let effect: f64 = eps.sample(&mut rng);
        for t in 0..years {
            let x: f64 = eps.sample(&mut rng) + 1.5 * effect;
            p.y.push(1.0 + 0.5 * x + effect + eps.sample(&mut rng));
            p.count.push(rng.random_range(0..5) as f64);
            p.x.push(x);
            p.firm.push(f as u64);
            p.year.push(t as f64);
        }
    }
    p
}

fn dataset(p: &Panel, order: &[usize]) -> Dataset {
    let pick = |v: &[f64]| order.iter().map(|&i| v[i]).collect::<Vec<f64>>();
    Dataset::new()
        .with_column("y", pick(&p.y))
        .unwrap()
        .with_column("x", pick(&p.x))
        .unwrap()
        .with_column("count", pick(&p.count))
        .unwrap()
}

fn ols(ds: &Dataset, corr: CorrStructure) -> Ols {
    let md = Microdata::builder(ds).response("y").control(&["x", INTERCEPT]).corr(corr).build().unwrap();
    Ols::fit(&md).unwrap()
}

#[test]
fn heteroscedastic_is_diagonal_cross_correlation() {
    let p = panel(30, 4, 1);
    let n = p.y.len();
    let order: Vec<usize> = (0..n).collect();
    let ds = dataset(&p, &order);

    let hetero = ols(&ds, CorrStructure::heteroscedastic());
    let diagonal = ols(&ds, CorrStructure::cross(CrossCorrelation::from_pairs(n, &[]).unwrap()));
    assert_eq!(hetero.coef(), diagonal.coef());
    assert_relative_eq!(hetero.vcov().unwrap(), diagonal.vcov().unwrap(), max_relative = 1e-12);

    // A time kernel with a bandwidth below the smallest gap is diagonal too.
    let times: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let narrow = CrossCorrelation::time(&times, 0.5, Kernel::Bartlett).unwrap();
    assert_eq!(narrow.nnz(), n);
    let kernel = ols(&ds, CorrStructure::cross(narrow));
    assert_relative_eq!(hetero.vcov().unwrap(), kernel.vcov().unwrap(), max_relative = 1e-12);
}

#[test]
fn clustered_variance_ignores_row_order() {
    let p = panel(40, 5, 2);
    let n = p.y.len();
    let forward: Vec<usize> = (0..n).collect();
    let shuffled: Vec<usize> = (0..n).map(|i| (i * 37 + 11) % n).collect();
    let mut seen = shuffled.clone();
    seen.sort_unstable();
    assert_eq!(seen, forward);

    let a = ols(&dataset(&p, &forward), CorrStructure::clustered(forward.iter().map(|&i| p.firm[i])));
    let b = ols(&dataset(&p, &shuffled), CorrStructure::clustered(shuffled.iter().map(|&i| p.firm[i])));
    assert_relative_eq!(a.coef(), b.coef(), epsilon = 1e-10);
    assert_relative_eq!(a.vcov().unwrap(), b.vcov().unwrap(), epsilon = 1e-12, max_relative = 1e-9);

    // Clustering on firms inflates the slope variance relative to HC1.
    let hetero = ols(&dataset(&p, &forward), CorrStructure::heteroscedastic());
    assert!(a.vcov().unwrap()[(0, 0)] > hetero.vcov().unwrap()[(0, 0)]);
}

#[test]
fn restriction_is_idempotent() {
    let p = panel(10, 6, 3);
    let n = p.y.len();
    let mask: Vec<bool> = (0..n).map(|i| i % 4 != 1).collect();
    let kept = mask.iter().filter(|m| **m).count();

    let clustered = CorrStructure::clustered(p.firm.iter().copied());
    let once = clustered.restrict(&mask).unwrap();
    assert_eq!(once.restrict(&vec![true; kept]).unwrap(), once);
    assert_eq!(once.len(), Some(kept));

    let kernel = CorrStructure::cross(CrossCorrelation::time(&p.year, 2.0, Kernel::Parzen).unwrap());
    let once = kernel.restrict(&mask).unwrap();
    assert_eq!(once.restrict(&vec![true; kept]).unwrap(), once);
    // The original is untouched.
    assert_eq!(kernel.len(), Some(n));

    assert!(matches!(clustered.restrict(&[true, false]), Err(mx_core::Error::IncompatibleStructure(_))));
}

#[test]
fn missing_cluster_ids() {
    let p = panel(12, 3, 4);
    let n = p.y.len();
    let ds = dataset(&p, &(0..n).collect::<Vec<_>>());
    let ids: Vec<Option<u64>> = p.firm.iter().enumerate().map(|(i, f)| if i % 5 == 0 { None } else { Some(*f) }).collect();

    let excluded = ols(&ds, CorrStructure::clustered_with_missing(ids.clone(), MissingCluster::Exclude));
    assert_eq!(excluded.sample().nrows(), n - (0..n).filter(|i| i % 5 == 0).count());

    let singleton = ols(&ds, CorrStructure::clustered_with_missing(ids, MissingCluster::Singleton));
    assert_eq!(singleton.sample().nrows(), n);
    assert!(singleton.stderr().unwrap().iter().all(|s| s.is_finite()));
}

#[test]
fn unit_and_all_ones_weights_match_exactly() {
    let p = panel(20, 3, 5);
    let n = p.y.len();
    let ds = dataset(&p, &(0..n).collect::<Vec<_>>());
    let base = Microdata::builder(&ds).response("count").control(&["x", INTERCEPT]);
    let unit = base.build().unwrap();
    let ones = Microdata::builder(&ds)
        .response("count")
        .control(&["x", INTERCEPT])
        .weights(Weights::Analytic(vec![1.0; n]))
        .build()
        .unwrap();

    let (a, b) = (Ols::fit(&unit).unwrap(), Ols::fit(&ones).unwrap());
    assert_eq!(a.coef(), b.coef());
    assert_eq!(a.vcov().unwrap(), b.vcov().unwrap());

    let (a, b) = (Poisson::fit(&unit).unwrap(), Poisson::fit(&ones).unwrap());
    assert_eq!(a.coef(), b.coef());
}

#[test]
fn frequency_weights_replicate_rows() {
    let p = panel(15, 2, 6);
    let n = p.y.len();
    let counts: Vec<usize> = (0..n).map(|i| 1 + i % 3).collect();
    let ds = dataset(&p, &(0..n).collect::<Vec<_>>());
    let replicated: Vec<usize> = (0..n).flat_map(|i| std::iter::repeat(i).take(counts[i])).collect();
    let long = dataset(&p, &replicated);

    let weighted = Microdata::builder(&ds)
        .response("y")
        .control(&["x", INTERCEPT])
        .weights(Weights::Frequency(counts.iter().map(|&c| c as f64).collect()))
        .build()
        .unwrap();
    let a = Ols::fit(&weighted).unwrap();
    let b = ols(&long, CorrStructure::heteroscedastic());
    assert_eq!(a.nobs(), replicated.len() as f64);
    assert_relative_eq!(a.coef(), b.coef(), epsilon = 1e-10);
    assert_relative_eq!(a.vcov().unwrap(), b.vcov().unwrap(), epsilon = 1e-12, max_relative = 1e-8);
}

#[test]
fn homoscedastic_structure_uses_scale_estimate() {
    let p = panel(40, 2, 7);
    let n = p.y.len();
    let ds = dataset(&p, &(0..n).collect::<Vec<_>>());
    let m = ols(&ds, CorrStructure::homoscedastic(Default::default()));
    let u = m.residuals();
    let x = m.sample().regressors();
    let s2 = u.norm_squared() / (n as f64 - 2.0);
    let expected = (x.transpose() * &x).try_inverse().unwrap() * s2;
    assert_relative_eq!(m.vcov().unwrap(), &expected, epsilon = 1e-12, max_relative = 1e-9);
}
