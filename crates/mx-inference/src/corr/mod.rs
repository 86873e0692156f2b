//! Correlation structures: which pairs of observations may be correlated and
//! with what bound.
//!
//! A structure is attached to an estimation sample and drives the "meat" of
//! every sandwich variance. Structures with an index space (clustered and
//! cross-correlated) cover a fixed number of observations and are restricted
//! alongside the sample; homoscedastic and heteroscedastic structures apply
//! to any sample.

pub mod cross;
pub mod kernel;

use std::collections::BTreeSet;

use mx_core::{Error, Result};

pub use cross::{CrossCorrelation, CrossPattern};
pub use kernel::Kernel;

/// Information estimate used for the homoscedastic variance of likelihood models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoMethod {
    /// Observed information (inverse Hessian).
    #[default]
    Oim,
    /// Outer product of gradients.
    Opg,
}

/// Treatment of observations whose cluster id is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingCluster {
    /// Drop the observation from any sample using the structure.
    #[default]
    Exclude,
    /// Keep the observation as its own cluster.
    Singleton,
}

/// Correlation assumption across observations.
#[derive(Debug, Clone, PartialEq)]
pub enum CorrStructure {
    /// Independent, identically distributed errors.
    Homoscedastic {
        /// Information estimate for likelihood models.
        method: InfoMethod,
        /// Apply the small-sample factor `n / (n - 1)`.
        adj: bool,
    },
    /// Independent observations, no further restriction (the default).
    Heteroscedastic {
        /// Apply the small-sample factor `n / (n - 1)`.
        adj: bool,
    },
    /// Correlation allowed within clusters only.
    Clustered {
        /// Cluster id per observation (`None` when missing).
        ids: Vec<Option<u64>>,
        /// Policy for missing ids.
        missing: MissingCluster,
        /// Apply the factor `G / (G - 1)`.
        adj: bool,
    },
    /// Arbitrary symmetric pair bounds.
    CrossCorrelated {
        /// Materialized bounds.
        pairs: CrossCorrelation,
        /// Apply the small-sample factor `n / (n - 1)`.
        adj: bool,
    },
}

impl Default for CorrStructure {
    fn default() -> Self {
        CorrStructure::Heteroscedastic { adj: true }
    }
}

impl CorrStructure {
    /// Homoscedastic structure with the given information method.
    pub fn homoscedastic(method: InfoMethod) -> Self {
        CorrStructure::Homoscedastic { method, adj: true }
    }

    /// Heteroscedastic structure.
    pub fn heteroscedastic() -> Self {
        CorrStructure::Heteroscedastic { adj: true }
    }

    /// One-way clustering on integer-coded ids. Missing ids are excluded.
    pub fn clustered(ids: impl IntoIterator<Item = u64>) -> Self {
        CorrStructure::Clustered {
            ids: ids.into_iter().map(Some).collect(),
            missing: MissingCluster::Exclude,
            adj: true,
        }
    }

    /// One-way clustering with possibly missing ids.
    pub fn clustered_with_missing(ids: Vec<Option<u64>>, missing: MissingCluster) -> Self {
        CorrStructure::Clustered { ids, missing, adj: true }
    }

    /// One-way clustering on arbitrary labels, coded in order of first appearance.
    pub fn clustered_by<T: Eq + std::hash::Hash>(labels: &[T]) -> Self {
        let mut codes = std::collections::HashMap::new();
        let ids = labels
            .iter()
            .map(|l| {
                let next = codes.len() as u64;
                *codes.entry(l).or_insert(next)
            })
            .collect::<Vec<u64>>();
        Self::clustered(ids)
    }

    /// Wrap a cross-correlation pattern.
    pub fn cross(pairs: CrossCorrelation) -> Self {
        CorrStructure::CrossCorrelated { pairs, adj: true }
    }

    /// Same structure with the small-sample adjustment switched on or off.
    pub fn with_adj(mut self, on: bool) -> Self {
        match &mut self {
            CorrStructure::Homoscedastic { adj, .. }
            | CorrStructure::Heteroscedastic { adj }
            | CorrStructure::Clustered { adj, .. }
            | CorrStructure::CrossCorrelated { adj, .. } => *adj = on,
        }
        self
    }

    /// Whether the small-sample adjustment applies.
    pub fn adj(&self) -> bool {
        match self {
            CorrStructure::Homoscedastic { adj, .. }
            | CorrStructure::Heteroscedastic { adj }
            | CorrStructure::Clustered { adj, .. }
            | CorrStructure::CrossCorrelated { adj, .. } => *adj,
        }
    }

    /// Short label for diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            CorrStructure::Homoscedastic { .. } => "homoscedastic",
            CorrStructure::Heteroscedastic { .. } => "heteroscedastic",
            CorrStructure::Clustered { .. } => "clustered",
            CorrStructure::CrossCorrelated { .. } => "cross-correlated",
        }
    }

    /// Size of the index space, `None` when the structure applies to any sample.
    pub fn len(&self) -> Option<usize> {
        match self {
            CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => None,
            CorrStructure::Clustered { ids, .. } => Some(ids.len()),
            CorrStructure::CrossCorrelated { pairs, .. } => Some(pairs.len()),
        }
    }

    /// Whether observation `i` can enter a sample under this structure.
    pub fn covers(&self, i: usize) -> bool {
        match self {
            CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => true,
            CorrStructure::Clustered { ids, missing, .. } => match ids.get(i) {
                Some(Some(_)) => true,
                Some(None) => *missing == MissingCluster::Singleton,
                None => false,
            },
            CorrStructure::CrossCorrelated { pairs, .. } => pairs.covers(i),
        }
    }

    /// Error unless the index space has exactly `n` observations.
    pub fn check_len(&self, n: usize) -> Result<()> {
        match self.len() {
            Some(m) if m != n => Err(Error::IncompatibleStructure(format!(
                "{} structure covers {} observations, sample has {}",
                self.label(),
                m,
                n
            ))),
            _ => Ok(()),
        }
    }

    /// Number of distinct clusters (missing ids count as singletons).
    pub fn n_clusters(&self) -> Option<usize> {
        match self {
            CorrStructure::Clustered { ids, .. } => {
                let mut seen = BTreeSet::new();
                let mut singletons = 0;
                for id in ids {
                    match id {
                        Some(id) => {
                            seen.insert(*id);
                        }
                        None => singletons += 1,
                    }
                }
                Some(seen.len() + singletons)
            }
            _ => None,
        }
    }

    /// Bound `c_ij` between observations `i` and `j` of the index space.
    pub fn weight(&self, i: usize, j: usize) -> f64 {
        match self {
            CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => {
                if i == j { 1.0 } else { 0.0 }
            }
            CorrStructure::Clustered { ids, .. } => {
                if i == j {
                    return 1.0;
                }
                match (ids[i], ids[j]) {
                    (Some(a), Some(b)) if a == b => 1.0,
                    _ => 0.0,
                }
            }
            CorrStructure::CrossCorrelated { pairs, .. } => pairs.weight(i, j),
        }
    }

    /// Structure over the observations where `mask` is true.
    ///
    /// Structures without an index space are returned unchanged. Restricting
    /// with an all-true mask yields an equal structure.
    pub fn restrict(&self, mask: &[bool]) -> Result<Self> {
        self.check_len(mask.len())?;
        Ok(match self {
            CorrStructure::Homoscedastic { .. } | CorrStructure::Heteroscedastic { .. } => self.clone(),
            CorrStructure::Clustered { ids, missing, adj } => CorrStructure::Clustered {
                ids: ids.iter().zip(mask).filter(|&(_, &keep)| keep).map(|(id, _)| *id).collect(),
                missing: *missing,
                adj: *adj,
            },
            CorrStructure::CrossCorrelated { pairs, adj } => {
                CorrStructure::CrossCorrelated { pairs: pairs.restrict(mask), adj: *adj }
            }
        })
    }

    /// Small-sample factor for a variance computed over `n_units` independent
    /// units (`n/(n-1)`, or `G/(G-1)` with `G` clusters when clustered).
    pub(crate) fn adjustment(&self, n_units: f64) -> Result<f64> {
        if !self.adj() {
            return Ok(1.0);
        }
        if let CorrStructure::Clustered { .. } = self {
            if n_units < 2.0 {
                return Err(Error::Validation(format!(
                    "clustered variance needs at least 2 clusters, got {}",
                    n_units
                )));
            }
        }
        if n_units <= 1.0 {
            return Ok(1.0);
        }
        Ok(n_units / (n_units - 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_heteroscedastic() {
        assert_eq!(CorrStructure::default(), CorrStructure::Heteroscedastic { adj: true });
        assert_eq!(CorrStructure::default().len(), None);
    }

    #[test]
    fn test_cluster_weights() {
        let c = CorrStructure::clustered_with_missing(
            vec![Some(3), Some(3), None, Some(4)],
            MissingCluster::Singleton,
        );
        assert_eq!(c.weight(0, 1), 1.0);
        assert_eq!(c.weight(1, 3), 0.0);
        assert_eq!(c.weight(2, 2), 1.0);
        assert_eq!(c.n_clusters(), Some(3));
        assert!(c.covers(2));

        let excl = CorrStructure::clustered_with_missing(vec![Some(1), None], MissingCluster::Exclude);
        assert!(!excl.covers(1));
    }

    #[test]
    fn test_clustered_by_labels() {
        let c = CorrStructure::clustered_by(&["b", "a", "b"]);
        assert_eq!(c, CorrStructure::clustered([0, 1, 0]));
    }

    #[test]
    fn test_restrict_is_idempotent() {
        let c = CorrStructure::clustered([1, 2, 1, 3, 2]);
        let mask = [true, false, true, true, false];
        let r = c.restrict(&mask).unwrap();
        assert_eq!(r, CorrStructure::clustered([1, 1, 3]));
        assert_eq!(r.restrict(&[true; 3]).unwrap(), r);

        let cross = CorrStructure::cross(CrossCorrelation::from_pairs(5, &[(0, 2, 0.5), (1, 4, 1.0)]).unwrap());
        let r = cross.restrict(&mask).unwrap();
        assert_eq!(r.weight(0, 1), 0.5);
        assert_eq!(r.restrict(&[true; 3]).unwrap(), r);
    }

    #[test]
    fn test_restrict_checks_length() {
        let c = CorrStructure::clustered([1, 2]);
        assert!(matches!(c.restrict(&[true]), Err(Error::IncompatibleStructure(_))));
        assert!(CorrStructure::heteroscedastic().restrict(&[true]).is_ok());
    }

    #[test]
    fn test_adjustment() {
        let c = CorrStructure::clustered([1, 2]);
        assert_eq!(c.adjustment(4.0).unwrap(), 4.0 / 3.0);
        assert!(c.adjustment(1.0).is_err());
        assert_eq!(c.clone().with_adj(false).adjustment(4.0).unwrap(), 1.0);
        assert_eq!(CorrStructure::heteroscedastic().adjustment(10.0).unwrap(), 10.0 / 9.0);
    }
}
