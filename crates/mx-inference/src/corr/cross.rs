//! Sparse symmetric pair bounds for cross-correlated observations.
//!
//! Every structure is materialized once at construction as a per-row list of
//! `(neighbour, weight)` entries sorted by neighbour, diagonal included. The
//! variance engine then only visits pairs with a nonzero bound.

use std::collections::{BTreeMap, HashMap};

use mx_core::{Error, Result};

use super::kernel::Kernel;

/// Mean Earth radius used for great-circle distances (km).
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// How a [`CrossCorrelation`] was generated.
#[derive(Debug, Clone, PartialEq)]
pub enum CrossPattern {
    /// Two observations correlate if they share either cluster id.
    TwoWay,
    /// Kernel on the absolute time difference.
    Time {
        /// Distance at which the kernel reaches zero.
        bandwidth: f64,
        /// Kernel applied to `|Δt| / bandwidth`.
        kernel: Kernel,
    },
    /// Kernel on the great-circle distance (km) between two points.
    Space {
        /// Distance at which the kernel reaches zero (km).
        bandwidth: f64,
        /// Kernel applied to `distance / bandwidth`.
        kernel: Kernel,
    },
    /// Product of a time kernel and a space kernel.
    TimeAndSpace {
        /// Time bandwidth.
        time_bandwidth: f64,
        /// Space bandwidth (km).
        space_bandwidth: f64,
        /// Kernel used on both axes.
        kernel: Kernel,
    },
    /// Caller-supplied pair list.
    Custom,
}

/// Materialized pair bounds `c_ij` over `n` observations.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCorrelation {
    pattern: CrossPattern,
    pairs: Vec<Vec<(usize, f64)>>,
    valid: Vec<bool>,
}

fn check_bandwidth(bw: f64, what: &str) -> Result<()> {
    if !(bw.is_finite() && bw > 0.0) {
        return Err(Error::Validation(format!("{} bandwidth must be finite and > 0, got {}", what, bw)));
    }
    Ok(())
}

/// Great-circle distance in kilometres; coordinates in radians.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let s_lat = ((lat2 - lat1) * 0.5).sin();
    let s_lon = ((lon2 - lon1) * 0.5).sin();
    let a = s_lat * s_lat + lat1.cos() * lat2.cos() * s_lon * s_lon;
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Accumulates symmetric entries and finishes with sorted rows.
struct PairSink {
    rows: Vec<Vec<(usize, f64)>>,
}

impl PairSink {
    fn new(n: usize) -> Self {
        Self { rows: (0..n).map(|i| vec![(i, 1.0)]).collect() }
    }

    fn push(&mut self, i: usize, j: usize, w: f64) {
        if i != j && w > 0.0 {
            self.rows[i].push((j, w));
            self.rows[j].push((i, w));
        }
    }

    fn finish(mut self) -> Vec<Vec<(usize, f64)>> {
        for row in &mut self.rows {
            row.sort_by_key(|&(j, _)| j);
        }
        self.rows
    }
}

/// Indices of finite entries ordered by value.
fn time_order(times: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..times.len()).filter(|&i| times[i].is_finite()).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]).then(a.cmp(&b)));
    order
}

impl CrossCorrelation {
    /// Two-way clustering: `c_ij = 1` when observations share the first or
    /// the second cluster id. Missing ids contribute no links on that axis.
    pub fn two_way(first: &[Option<u64>], second: &[Option<u64>]) -> Result<Self> {
        if first.len() != second.len() {
            return Err(Error::Validation(format!(
                "two-way clustering ids differ in length: {} vs {}",
                first.len(),
                second.len()
            )));
        }
        let n = first.len();
        let mut members: [HashMap<u64, Vec<usize>>; 2] = [HashMap::new(), HashMap::new()];
        for (axis, ids) in [first, second].into_iter().enumerate() {
            for (i, id) in ids.iter().enumerate() {
                if let Some(id) = id {
                    members[axis].entry(*id).or_default().push(i);
                }
            }
        }

        let mut pairs = Vec::with_capacity(n);
        for i in 0..n {
            let mut row: Vec<usize> = vec![i];
            for (axis, ids) in [first, second].into_iter().enumerate() {
                if let Some(id) = ids[i] {
                    if let Some(m) = members[axis].get(&id) {
                        row.extend_from_slice(m);
                    }
                }
            }
            row.sort_unstable();
            row.dedup();
            pairs.push(row.into_iter().map(|j| (j, 1.0)).collect());
        }

        Ok(Self { pattern: CrossPattern::TwoWay, pairs, valid: vec![true; n] })
    }

    /// Kernel on `|t_i - t_j|`. Non-finite times mark the row as uncovered.
    pub fn time(times: &[f64], bandwidth: f64, kernel: Kernel) -> Result<Self> {
        check_bandwidth(bandwidth, "time")?;
        let n = times.len();
        let order = time_order(times);
        let mut sink = PairSink::new(n);
        for (a, &i) in order.iter().enumerate() {
            for &j in &order[a + 1..] {
                let x = (times[j] - times[i]) / bandwidth;
                if x > 1.0 {
                    break;
                }
                sink.push(i, j, kernel.bound(x));
            }
        }
        let valid = times.iter().map(|t| t.is_finite()).collect();
        Ok(Self {
            pattern: CrossPattern::Time { bandwidth, kernel },
            pairs: sink.finish(),
            valid,
        })
    }

    /// Kernel on the haversine distance between `(lat, lon)` points in radians.
    pub fn space(lat: &[f64], lon: &[f64], bandwidth: f64, kernel: Kernel) -> Result<Self> {
        check_bandwidth(bandwidth, "space")?;
        if lat.len() != lon.len() {
            return Err(Error::Validation("latitude and longitude differ in length".into()));
        }
        let n = lat.len();
        let valid: Vec<bool> = (0..n).map(|i| lat[i].is_finite() && lon[i].is_finite()).collect();
        let mut sink = PairSink::new(n);
        for i in 0..n {
            if !valid[i] {
                continue;
            }
            for j in (i + 1)..n {
                if !valid[j] {
                    continue;
                }
                let d = haversine_km(lat[i], lon[i], lat[j], lon[j]);
                sink.push(i, j, kernel.bound(d / bandwidth));
            }
        }
        Ok(Self { pattern: CrossPattern::Space { bandwidth, kernel }, pairs: sink.finish(), valid })
    }

    /// Product of a time kernel and a space kernel.
    pub fn time_and_space(
        times: &[f64],
        lat: &[f64],
        lon: &[f64],
        time_bandwidth: f64,
        space_bandwidth: f64,
        kernel: Kernel,
    ) -> Result<Self> {
        check_bandwidth(time_bandwidth, "time")?;
        check_bandwidth(space_bandwidth, "space")?;
        let n = times.len();
        if lat.len() != n || lon.len() != n {
            return Err(Error::Validation("time and coordinates differ in length".into()));
        }
        let valid: Vec<bool> =
            (0..n).map(|i| times[i].is_finite() && lat[i].is_finite() && lon[i].is_finite()).collect();
        let order: Vec<usize> = time_order(times).into_iter().filter(|&i| valid[i]).collect();
        let mut sink = PairSink::new(n);
        for (a, &i) in order.iter().enumerate() {
            for &j in &order[a + 1..] {
                let xt = (times[j] - times[i]) / time_bandwidth;
                if xt > 1.0 {
                    break;
                }
                let kt = kernel.bound(xt);
                if kt == 0.0 {
                    continue;
                }
                let ds = haversine_km(lat[i], lon[i], lat[j], lon[j]);
                sink.push(i, j, kt * kernel.bound(ds / space_bandwidth));
            }
        }
        Ok(Self {
            pattern: CrossPattern::TimeAndSpace { time_bandwidth, space_bandwidth, kernel },
            pairs: sink.finish(),
            valid,
        })
    }

    /// Arbitrary symmetric bounds. Each `(i, j, c)` entry sets `c_ij = c_ji = c`;
    /// the diagonal is always 1. Bounds must lie in `[0, 1]`.
    pub fn from_pairs(n: usize, entries: &[(usize, usize, f64)]) -> Result<Self> {
        let mut rows: Vec<BTreeMap<usize, f64>> = (0..n).map(|i| BTreeMap::from([(i, 1.0)])).collect();
        for &(i, j, c) in entries {
            if i >= n || j >= n {
                return Err(Error::Validation(format!("pair ({}, {}) out of range for {} observations", i, j, n)));
            }
            if !(0.0..=1.0).contains(&c) {
                return Err(Error::Validation(format!("pair bound must be in [0,1], got {}", c)));
            }
            if i == j || c == 0.0 {
                continue;
            }
            rows[i].insert(j, c);
            rows[j].insert(i, c);
        }
        let pairs = rows.into_iter().map(|r| r.into_iter().collect()).collect();
        Ok(Self { pattern: CrossPattern::Custom, pairs, valid: vec![true; n] })
    }

    /// Generating pattern.
    pub fn pattern(&self) -> &CrossPattern {
        &self.pattern
    }

    /// Number of observations covered by the index space.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True when the index space is empty.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether row `i` has usable coordinates.
    pub fn covers(&self, i: usize) -> bool {
        self.valid.get(i).copied().unwrap_or(false)
    }

    /// Nonzero bounds of row `i`, sorted by neighbour (diagonal included).
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.pairs[i]
    }

    /// Bound `c_ij` (0 when the pair is absent).
    pub fn weight(&self, i: usize, j: usize) -> f64 {
        let row = &self.pairs[i];
        match row.binary_search_by_key(&j, |&(k, _)| k) {
            Ok(pos) => row[pos].1,
            Err(_) => 0.0,
        }
    }

    /// Total number of stored entries (both triangles plus diagonal).
    pub fn nnz(&self) -> usize {
        self.pairs.iter().map(|r| r.len()).sum()
    }

    /// Keep rows where `mask` is true, renumbering neighbours.
    pub(crate) fn restrict(&self, mask: &[bool]) -> Self {
        let mut new_index = vec![usize::MAX; mask.len()];
        let mut next = 0;
        for (i, &keep) in mask.iter().enumerate() {
            if keep {
                new_index[i] = next;
                next += 1;
            }
        }
        let mut pairs = Vec::with_capacity(next);
        let mut valid = Vec::with_capacity(next);
        for (i, &keep) in mask.iter().enumerate() {
            if !keep {
                continue;
            }
            pairs.push(
                self.pairs[i]
                    .iter()
                    .filter(|&&(j, _)| mask[j])
                    .map(|&(j, w)| (new_index[j], w))
                    .collect(),
            );
            valid.push(self.valid[i]);
        }
        Self { pattern: self.pattern.clone(), pairs, valid }
    }
}
