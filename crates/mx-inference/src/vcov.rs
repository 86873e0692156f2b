//! Sandwich variance engine.
//!
//! Every robust variance in the crate reduces to a "meat" over influence
//! rows `ψ_i`: `Σ_ij c_ij (w_i ψ_i)(w_j ψ_j)'`, where `c_ij` comes from the
//! correlation structure, followed by the small-sample factor. The bread is
//! already folded into `ψ` by [`Estimator::influence`].

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use nalgebra::{DMatrix, DVector};

use mx_core::{Error, Result};

use crate::corr::CorrStructure;
use crate::data::Weights;
use crate::estimator::Estimator;
use crate::linalg::{scale_rows, symmetrize, weighted};

/// Cluster key: shared id, or the row itself for a missing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ClusterKey {
    Id(u64),
    Row(usize),
}

fn cluster_key(ids: &[Option<u64>], i: usize) -> ClusterKey {
    match ids[i] {
        Some(id) => ClusterKey::Id(id),
        None => ClusterKey::Row(i),
    }
}

/// Sum of weighted influence rows per cluster, in key order.
fn cluster_sums(v: &DMatrix<f64>, rows: impl Iterator<Item = (usize, usize)>, ids: &[Option<u64>]) -> BTreeMap<ClusterKey, DVector<f64>> {
    let mut sums: BTreeMap<ClusterKey, DVector<f64>> = BTreeMap::new();
    for (i, r) in rows {
        let key = cluster_key(ids, r);
        let row = v.row(i).transpose();
        match sums.get_mut(&key) {
            Some(acc) => *acc += row,
            None => {
                sums.insert(key, row);
            }
        }
    }
    sums
}

/// Structure usable for a robust meat. Homoscedastic requests fall back to
/// heteroscedastic with a warning.
pub(crate) fn robust_structure<'a>(corr: &'a CorrStructure, context: &str) -> Cow<'a, CorrStructure> {
    match corr {
        CorrStructure::Homoscedastic { adj, .. } => {
            log::warn!("{}: homoscedastic structure not supported, using heteroscedastic meat", context);
            Cow::Owned(CorrStructure::Heteroscedastic { adj: *adj })
        }
        other => Cow::Borrowed(other),
    }
}

/// Meat `Σ_ij c_ij (w_i ψ_i)(w_j ψ_j)'` times the small-sample factor.
///
/// With frequency weights under (hetero|homo)scedasticity each row counts
/// `w_i` times: `Σ_i w_i ψ_i ψ_i'`.
pub fn meat(psi: &DMatrix<f64>, corr: &CorrStructure, weights: &Weights) -> Result<DMatrix<f64>> {
    let n = psi.nrows();
    let k = psi.ncols();
    if weights.len() != n {
        return Err(Error::Computation(format!("meat: {} weights for {} influence rows", weights.len(), n)));
    }
    corr.check_len(n)?;

    let (m, units) = match corr {
        CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => {
            let m = match weights {
                Weights::Unit(_) => psi.transpose() * psi,
                Weights::Frequency(w) => psi.transpose() * scale_rows(psi, w),
                _ => {
                    let v = weighted(psi, weights.values());
                    v.transpose() * &v
                }
            };
            (m, weights.nobs())
        }
        CorrStructure::Clustered { ids, .. } => {
            let v = weighted(psi, weights.values());
            let sums = cluster_sums(&v, (0..n).map(|i| (i, i)), ids);
            let mut m = DMatrix::zeros(k, k);
            for u in sums.values() {
                m += u * u.transpose();
            }
            (m, sums.len() as f64)
        }
        CorrStructure::CrossCorrelated { pairs, .. } => {
            let v = weighted(psi, weights.values());
            let mut cv = DMatrix::zeros(n, k);
            for i in 0..n {
                for &(j, c) in pairs.row(i) {
                    for col in 0..k {
                        cv[(i, col)] += c * v[(j, col)];
                    }
                }
            }
            (symmetrize(&(v.transpose() * cv)), weights.nobs())
        }
    };
    Ok(m * corr.adjustment(units)?)
}

/// Influence rows of one model, indexed by original dataset row.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Part<'a> {
    pub psi: &'a DMatrix<f64>,
    pub rows: &'a [usize],
    pub weights: &'a Weights,
}

impl Part<'_> {
    fn check(&self) -> Result<()> {
        if self.psi.nrows() != self.rows.len() || self.weights.len() != self.rows.len() {
            return Err(Error::Computation("cross meat: influence, rows and weights disagree".into()));
        }
        Ok(())
    }
}

/// Cross meat `Σ_ij c(r_i, r_j) (w_i ψ_i)(w_j φ_j)'` between two models whose
/// rows index a common structure, scaled by the factor of the union sample.
pub(crate) fn cross_meat(a: &Part<'_>, b: &Part<'_>, corr: &CorrStructure) -> Result<DMatrix<f64>> {
    a.check()?;
    b.check()?;
    if let Some(n) = corr.len() {
        let top = a.rows.iter().chain(b.rows).copied().max().unwrap_or(0);
        if top >= n {
            return Err(Error::IncompatibleStructure(format!(
                "{} structure covers {} observations, row {} requested",
                corr.label(),
                n,
                top
            )));
        }
    }
    if let Some(r) = a.rows.iter().chain(b.rows).copied().find(|&r| !corr.covers(r)) {
        return Err(Error::IncompatibleStructure(format!(
            "{} structure does not describe row {} (missing cluster id, time or coordinates)",
            corr.label(),
            r
        )));
    }
    let va = weighted(a.psi, a.weights.values());
    let vb = weighted(b.psi, b.weights.values());
    let pos_b: HashMap<usize, usize> = b.rows.iter().enumerate().map(|(j, &r)| (r, j)).collect();
    let mut m = DMatrix::zeros(va.ncols(), vb.ncols());

    let units = match corr {
        CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => {
            for (i, r) in a.rows.iter().enumerate() {
                if let Some(&j) = pos_b.get(r) {
                    m += va.row(i).transpose() * vb.row(j);
                }
            }
            a.rows.iter().chain(b.rows).collect::<BTreeSet<_>>().len()
        }
        CorrStructure::Clustered { ids, .. } => {
            let sa = cluster_sums(&va, a.rows.iter().copied().enumerate(), ids);
            let sb = cluster_sums(&vb, b.rows.iter().copied().enumerate(), ids);
            for (key, ua) in &sa {
                if let Some(ub) = sb.get(key) {
                    m += ua * ub.transpose();
                }
            }
            sa.keys().chain(sb.keys()).collect::<BTreeSet<_>>().len()
        }
        CorrStructure::CrossCorrelated { pairs, .. } => {
            for (i, &r) in a.rows.iter().enumerate() {
                for &(r2, c) in pairs.row(r) {
                    if let Some(&j) = pos_b.get(&r2) {
                        m += (va.row(i).transpose() * vb.row(j)) * c;
                    }
                }
            }
            a.rows.iter().chain(b.rows).collect::<BTreeSet<_>>().len()
        }
    };
    Ok(m * corr.adjustment(units as f64)?)
}

/// Variance of a fitted model under its sample's structure.
///
/// Homoscedastic structures defer to [`Estimator::homoscedastic_vcov`];
/// all others use the influence-based sandwich.
pub fn sandwich<E: Estimator + ?Sized>(model: &E) -> Result<DMatrix<f64>> {
    let md = model.sample();
    match md.corr() {
        CorrStructure::Homoscedastic { method, .. } => model.homoscedastic_vcov(*method),
        corr => meat(&model.influence()?, corr, md.weights()),
    }
}

/// Influence-based sandwich that never takes the homoscedastic shortcut.
pub fn robust<E: Estimator + ?Sized>(model: &E) -> Result<DMatrix<f64>> {
    let md = model.sample();
    let corr = robust_structure(md.corr(), model.name());
    meat(&model.influence()?, &corr, md.weights())
}
