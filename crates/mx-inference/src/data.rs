//! Estimation samples.
//!
//! A [`Dataset`] is a plain table of named numeric columns. A [`Microdata`]
//! assigns columns to model roles, drops unusable rows, attaches observation
//! weights and a correlation structure, and stores the resulting design as a
//! single shared matrix. Remapping roles never copies the matrix.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use nalgebra::{DMatrix, DVector, DVectorView};

use mx_core::{Error, Result};

use crate::corr::CorrStructure;

/// Name of the constant column available in every sample.
pub const INTERCEPT: &str = "(Intercept)";

/// Role a variable plays in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Outcome variable.
    Response,
    /// Exogenous regressors (including the intercept when requested).
    Control,
    /// Endogenous or binary treatment variable.
    Treatment,
    /// Excluded instruments.
    Instrument,
    /// Linear-predictor offset with a fixed unit coefficient.
    Offset,
}

impl Role {
    /// Lower-case role name used in messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Response => "response",
            Role::Control => "control",
            Role::Treatment => "treatment",
            Role::Instrument => "instrument",
            Role::Offset => "offset",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column-oriented table of `f64` variables. Missing values are `NaN`.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl Dataset {
    /// Empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows (0 when no column has been added).
    pub fn nrows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.len())
    }

    /// Column names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names.iter().position(|n| n == name).map(|i| self.columns[i].as_slice())
    }

    /// Append a column. Names must be unique and lengths must agree.
    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if name == INTERCEPT {
            return Err(Error::Validation(format!("`{}` is reserved", INTERCEPT)));
        }
        if self.names.contains(&name) {
            return Err(Error::Validation(format!("duplicate column `{}`", name)));
        }
        if !self.columns.is_empty() && values.len() != self.nrows() {
            return Err(Error::Validation(format!(
                "column `{}` has {} rows, expected {}",
                name,
                values.len(),
                self.nrows()
            )));
        }
        self.names.push(name);
        self.columns.push(values);
        Ok(())
    }

    /// Builder-style [`Dataset::push_column`].
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        self.push_column(name, values)?;
        Ok(self)
    }

    /// Expand an integer-coded factor into indicator columns named
    /// `"{prefix}: {level}"`, omitting the smallest level. Missing codes
    /// (`None`) yield `NaN` in every indicator.
    pub fn with_dummies(mut self, prefix: &str, codes: &[Option<i64>]) -> Result<Self> {
        let mut levels: Vec<i64> = codes.iter().flatten().copied().collect();
        levels.sort_unstable();
        levels.dedup();
        for &level in levels.iter().skip(1) {
            let values = codes
                .iter()
                .map(|c| match c {
                    Some(c) if *c == level => 1.0,
                    Some(_) => 0.0,
                    None => f64::NAN,
                })
                .collect();
            self.push_column(format!("{}: {}", prefix, level), values)?;
        }
        Ok(self)
    }
}

/// Observation weights.
///
/// Analytic and probability weights are rescaled to sum to the number of
/// observations when a sample is built; frequency weights are kept as
/// counts and define the effective number of observations.
#[derive(Debug, Clone, PartialEq)]
pub enum Weights {
    /// All weights equal to one.
    Unit(usize),
    /// Inverse-variance style weights.
    Analytic(Vec<f64>),
    /// Inverse sampling-probability weights.
    Probability(Vec<f64>),
    /// Replication counts.
    Frequency(Vec<f64>),
}

impl Weights {
    /// Number of observations.
    pub fn len(&self) -> usize {
        match self {
            Weights::Unit(n) => *n,
            Weights::Analytic(w) | Weights::Probability(w) | Weights::Frequency(w) => w.len(),
        }
    }

    /// True when there are no observations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for [`Weights::Unit`].
    pub fn is_unit(&self) -> bool {
        matches!(self, Weights::Unit(_))
    }

    /// True for [`Weights::Frequency`].
    pub fn is_frequency(&self) -> bool {
        matches!(self, Weights::Frequency(_))
    }

    /// Explicit weight values, `None` for unit weights.
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Weights::Unit(_) => None,
            Weights::Analytic(w) | Weights::Probability(w) | Weights::Frequency(w) => Some(w),
        }
    }

    /// Weight of observation `i`.
    pub fn get(&self, i: usize) -> f64 {
        self.values().map_or(1.0, |w| w[i])
    }

    /// Sum of weights.
    pub fn sum(&self) -> f64 {
        match self {
            Weights::Unit(n) => *n as f64,
            Weights::Analytic(w) | Weights::Probability(w) | Weights::Frequency(w) => w.iter().sum(),
        }
    }

    /// Effective number of observations (sum of frequency weights, else row count).
    pub fn nobs(&self) -> f64 {
        match self {
            Weights::Frequency(w) => w.iter().sum(),
            _ => self.len() as f64,
        }
    }

    /// Weights as a dense vector.
    pub fn to_vector(&self) -> DVector<f64> {
        match self.values() {
            Some(w) => DVector::from_column_slice(w),
            None => DVector::from_element(self.len(), 1.0),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(w) = self.values() {
            if let Some(bad) = w.iter().find(|v| v.is_nan() || **v < 0.0 || v.is_infinite()) {
                return Err(Error::Validation(format!("weights must be finite and >= 0, got {}", bad)));
            }
        }
        Ok(())
    }

    fn select(&self, rows: &[usize]) -> Weights {
        let pick = |w: &[f64]| rows.iter().map(|&i| w[i]).collect::<Vec<f64>>();
        match self {
            Weights::Unit(_) => Weights::Unit(rows.len()),
            Weights::Analytic(w) => Weights::Analytic(pick(w)),
            Weights::Probability(w) => Weights::Probability(pick(w)),
            Weights::Frequency(w) => Weights::Frequency(pick(w)),
        }
    }

    fn normalized(self) -> Result<Weights> {
        let rescale = |w: Vec<f64>| -> Result<Vec<f64>> {
            let s: f64 = w.iter().sum();
            if !(s > 0.0) {
                return Err(Error::Validation("weights sum to zero over the sample".into()));
            }
            let k = w.len() as f64 / s;
            Ok(w.into_iter().map(|v| v * k).collect())
        };
        Ok(match self {
            Weights::Analytic(w) => Weights::Analytic(rescale(w)?),
            Weights::Probability(w) => Weights::Probability(rescale(w)?),
            other => other,
        })
    }
}

/// Estimation sample: role-mapped columns, weights and correlation structure.
#[derive(Debug, Clone)]
pub struct Microdata {
    mat: Arc<DMatrix<f64>>,
    vars: Arc<Vec<String>>,
    map: BTreeMap<Role, Vec<usize>>,
    rows: Arc<Vec<usize>>,
    weights: Arc<Weights>,
    corr: Arc<CorrStructure>,
}

/// Builder for [`Microdata`].
#[derive(Debug)]
pub struct MicrodataBuilder<'a> {
    data: &'a Dataset,
    roles: Vec<(Role, Vec<String>)>,
    subset: Option<Vec<bool>>,
    weights: Option<Weights>,
    corr: CorrStructure,
}

impl<'a> MicrodataBuilder<'a> {
    /// Assign variables to a role (replacing any previous assignment).
    pub fn role<S: AsRef<str>>(mut self, role: Role, names: &[S]) -> Self {
        self.roles.retain(|(r, _)| *r != role);
        self.roles.push((role, names.iter().map(|s| s.as_ref().to_string()).collect()));
        self
    }

    /// Response variable.
    pub fn response(self, name: &str) -> Self {
        self.role(Role::Response, &[name])
    }

    /// Control variables.
    pub fn control<S: AsRef<str>>(self, names: &[S]) -> Self {
        self.role(Role::Control, names)
    }

    /// Treatment variable(s).
    pub fn treatment<S: AsRef<str>>(self, names: &[S]) -> Self {
        self.role(Role::Treatment, names)
    }

    /// Instrument(s).
    pub fn instrument<S: AsRef<str>>(self, names: &[S]) -> Self {
        self.role(Role::Instrument, names)
    }

    /// Offset variable.
    pub fn offset(self, name: &str) -> Self {
        self.role(Role::Offset, &[name])
    }

    /// Keep only rows where `mask` is true.
    pub fn subset(mut self, mask: Vec<bool>) -> Self {
        self.subset = Some(mask);
        self
    }

    /// Observation weights over all dataset rows.
    pub fn weights(mut self, weights: Weights) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Correlation structure over all dataset rows.
    pub fn corr(mut self, corr: CorrStructure) -> Self {
        self.corr = corr;
        self
    }

    /// Resolve variables, drop unusable rows and assemble the sample.
    pub fn build(self) -> Result<Microdata> {
        let n = self.data.nrows();
        if n == 0 {
            return Err(Error::empty("dataset has no rows"));
        }
        if let Some(mask) = &self.subset {
            if mask.len() != n {
                return Err(Error::Validation(format!("subset has {} entries, dataset has {} rows", mask.len(), n)));
            }
        }
        let weights = self.weights.unwrap_or(Weights::Unit(n));
        if weights.len() != n {
            return Err(Error::Validation(format!("weights have {} entries, dataset has {} rows", weights.len(), n)));
        }
        weights.validate()?;
        self.corr.check_len(n)?;

        let mut vars: Vec<String> = Vec::new();
        let mut map = BTreeMap::new();
        for (role, names) in &self.roles {
            if names.is_empty() {
                continue;
            }
            if matches!(role, Role::Response | Role::Offset) && names.len() != 1 {
                return Err(Error::Validation(format!("{} takes exactly one variable", role)));
            }
            let mut idx = Vec::with_capacity(names.len());
            for name in names {
                let pos = match vars.iter().position(|v| v == name) {
                    Some(p) => p,
                    None => {
                        if name != INTERCEPT && self.data.column(name).is_none() {
                            return Err(Error::Validation(format!("unknown variable `{}`", name)));
                        }
                        vars.push(name.clone());
                        vars.len() - 1
                    }
                };
                idx.push(pos);
            }
            map.insert(*role, idx);
        }
        if !vars.iter().any(|v| v == INTERCEPT) {
            vars.push(INTERCEPT.to_string());
        }

        let cols: Vec<Option<&[f64]>> = vars.iter().map(|v| self.data.column(v)).collect();
        let mask: Vec<bool> = (0..n)
            .map(|i| {
                self.subset.as_ref().map_or(true, |m| m[i])
                    && self.corr.covers(i)
                    && cols.iter().flatten().all(|c| c[i].is_finite())
            })
            .collect();
        let rows: Vec<usize> = (0..n).filter(|&i| mask[i]).collect();
        if rows.is_empty() {
            return Err(Error::empty("no complete observations after subsetting"));
        }
        let dropped = n - rows.len();
        if dropped > 0 {
            log::debug!("microdata: dropped {} of {} rows", dropped, n);
        }

        let mat = DMatrix::from_fn(rows.len(), vars.len(), |r, c| match cols[c] {
            Some(col) => col[rows[r]],
            None => 1.0,
        });
        let corr = self.corr.restrict(&mask)?;
        let weights = weights.select(&rows).normalized()?;

        Ok(Microdata {
            mat: Arc::new(mat),
            vars: Arc::new(vars),
            map,
            rows: Arc::new(rows),
            weights: Arc::new(weights),
            corr: Arc::new(corr),
        })
    }
}

impl Microdata {
    /// Start building a sample over `data`.
    pub fn builder(data: &Dataset) -> MicrodataBuilder<'_> {
        MicrodataBuilder {
            data,
            roles: Vec::new(),
            subset: None,
            weights: None,
            corr: CorrStructure::default(),
        }
    }

    /// Number of retained rows.
    pub fn nrows(&self) -> usize {
        self.mat.nrows()
    }

    /// Effective number of observations (sum of frequency weights, else rows).
    pub fn nobs(&self) -> f64 {
        self.weights.nobs()
    }

    /// Original dataset row index of each retained row.
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    /// Observation weights over the retained rows.
    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    /// Correlation structure restricted to the retained rows.
    pub fn corr(&self) -> &CorrStructure {
        &self.corr
    }

    /// Whether a role has at least one variable.
    pub fn has(&self, role: Role) -> bool {
        self.map.get(&role).is_some_and(|v| !v.is_empty())
    }

    /// Error with [`Error::MissingRole`] for the first absent role.
    pub fn require(&self, roles: &[Role], context: &str) -> Result<()> {
        match roles.iter().find(|r| !self.has(**r)) {
            Some(r) => Err(Error::missing_role(r.as_str(), context)),
            None => Ok(()),
        }
    }

    /// Number of variables mapped to a role.
    pub fn width(&self, role: Role) -> usize {
        self.map.get(&role).map_or(0, |v| v.len())
    }

    /// Column of a single-variable role (first variable otherwise).
    pub fn vector(&self, role: Role) -> Result<DVectorView<'_, f64>> {
        match self.map.get(&role).and_then(|v| v.first()) {
            Some(&c) => Ok(self.mat.column(c)),
            None => Err(Error::missing_role(role.as_str(), "sample")),
        }
    }

    /// Response net of the offset, if any.
    pub fn response(&self) -> Result<DVector<f64>> {
        let y = self.vector(Role::Response)?.into_owned();
        Ok(match self.offset() {
            Some(o) => y - o,
            None => y,
        })
    }

    /// Offset column, if any.
    pub fn offset(&self) -> Option<DVector<f64>> {
        self.vector(Role::Offset).ok().map(|v| v.into_owned())
    }

    /// Columns of the given roles concatenated in order.
    pub fn matrix(&self, roles: &[Role]) -> DMatrix<f64> {
        self.mat.select_columns(self.indices(roles).iter())
    }

    /// Variable names of the given roles concatenated in order.
    pub fn names(&self, roles: &[Role]) -> Vec<String> {
        self.indices(roles).iter().map(|&c| self.vars[c].clone()).collect()
    }

    /// Regressor matrix of single-equation models: treatment then controls.
    pub fn regressors(&self) -> DMatrix<f64> {
        self.matrix(&[Role::Treatment, Role::Control])
    }

    /// Names matching [`Microdata::regressors`].
    pub fn regressor_names(&self) -> Vec<String> {
        self.names(&[Role::Treatment, Role::Control])
    }

    fn indices(&self, roles: &[Role]) -> Vec<usize> {
        roles.iter().filter_map(|r| self.map.get(r)).flatten().copied().collect()
    }

    /// New sample sharing the data where each target role is reassigned to
    /// the variables currently held by the listed source roles. Roles not
    /// named keep their variables; an empty source list clears the role.
    pub fn reassign(&self, mapping: &[(Role, &[Role])]) -> Microdata {
        let mut map = self.map.clone();
        for (target, sources) in mapping {
            let idx = self.indices(sources);
            if idx.is_empty() {
                map.remove(target);
            } else {
                map.insert(*target, idx);
            }
        }
        Microdata { map, ..self.clone() }
    }

    /// New sample sharing the data with roles mapped to named variables.
    /// Only variables already present in the sample can be referenced.
    pub fn remap<S: AsRef<str>>(&self, mapping: &[(Role, &[S])]) -> Result<Microdata> {
        let mut map = self.map.clone();
        for (role, names) in mapping {
            let mut idx = Vec::with_capacity(names.len());
            for name in names.iter() {
                let name = name.as_ref();
                match self.vars.iter().position(|v| v == name) {
                    Some(p) => idx.push(p),
                    None => return Err(Error::Validation(format!("variable `{}` is not in the sample", name))),
                }
            }
            if idx.is_empty() {
                map.remove(role);
            } else {
                map.insert(*role, idx);
            }
        }
        Ok(Microdata { map, ..self.clone() })
    }

    /// Same sample with explicit analytic weights. Values are used as given.
    pub(crate) fn reweighted(&self, w: Vec<f64>) -> Result<Microdata> {
        if w.len() != self.nrows() {
            return Err(Error::Validation(format!(
                "weights have {} entries, sample has {} rows",
                w.len(),
                self.nrows()
            )));
        }
        Ok(Microdata { weights: Arc::new(Weights::Analytic(w)), ..self.clone() })
    }

    /// Whether two samples share the same underlying matrix.
    pub fn shares_data(&self, other: &Microdata) -> bool {
        Arc::ptr_eq(&self.mat, &other.mat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corr::MissingCluster;

    fn data() -> Dataset {
        Dataset::new()
            .with_column("y", vec![1.0, 2.0, f64::NAN, 4.0, 5.0])
            .unwrap()
            .with_column("x", vec![0.5, 1.5, 2.5, 3.5, 4.5])
            .unwrap()
            .with_column("d", vec![0.0, 1.0, 0.0, 1.0, 1.0])
            .unwrap()
    }

    #[test]
    fn test_drops_incomplete_rows() {
        let md = Microdata::builder(&data()).response("y").control(&["x", INTERCEPT]).build().unwrap();
        assert_eq!(md.rows(), &[0, 1, 3, 4]);
        assert_eq!(md.nrows(), 4);
        let x = md.matrix(&[Role::Control]);
        assert_eq!(x.ncols(), 2);
        assert_eq!(x[(2, 0)], 3.5);
        assert_eq!(x[(2, 1)], 1.0);
        assert_eq!(md.names(&[Role::Control]), vec!["x".to_string(), INTERCEPT.to_string()]);
    }

    #[test]
    fn test_subset_and_missing_clusters() {
        let corr = CorrStructure::clustered_with_missing(
            vec![Some(1), Some(1), Some(2), None, Some(2)],
            MissingCluster::Exclude,
        );
        let md = Microdata::builder(&data())
            .control(&["x"])
            .subset(vec![true, false, true, true, true])
            .corr(corr)
            .build()
            .unwrap();
        assert_eq!(md.rows(), &[0, 2, 4]);
        assert_eq!(md.corr(), &CorrStructure::clustered([1, 2, 2]));
    }

    #[test]
    fn test_empty_sample_is_an_error() {
        let err = Microdata::builder(&data()).response("y").subset(vec![false; 5]).build().unwrap_err();
        assert!(matches!(err, Error::EmptySample { .. }));
    }

    #[test]
    fn test_structure_length_mismatch() {
        let err = Microdata::builder(&data()).control(&["x"]).corr(CorrStructure::clustered([1, 2])).build().unwrap_err();
        assert!(matches!(err, Error::IncompatibleStructure(_)));
    }

    #[test]
    fn test_unknown_variable() {
        assert!(Microdata::builder(&data()).response("z").build().is_err());
    }

    #[test]
    fn test_analytic_weights_are_normalized() {
        let md = Microdata::builder(&data())
            .control(&["x"])
            .weights(Weights::Analytic(vec![1.0, 2.0, 3.0, 4.0, 10.0]))
            .build()
            .unwrap();
        assert!((md.weights().sum() - 5.0).abs() < 1e-12);
        assert_eq!(md.nobs(), 5.0);

        let fw = Microdata::builder(&data())
            .control(&["x"])
            .weights(Weights::Frequency(vec![1.0, 2.0, 3.0, 4.0, 10.0]))
            .build()
            .unwrap();
        assert_eq!(fw.nobs(), 20.0);
        assert!(Microdata::builder(&data()).weights(Weights::Analytic(vec![-1.0; 5])).build().is_err());
    }

    #[test]
    fn test_reassign_shares_matrix() {
        let md = Microdata::builder(&data())
            .response("y")
            .treatment(&["d"])
            .control(&["x", INTERCEPT])
            .build()
            .unwrap();
        let first = md.reassign(&[(Role::Response, &[Role::Treatment][..]), (Role::Treatment, &[][..])]);
        assert!(first.shares_data(&md));
        assert_eq!(first.names(&[Role::Response]), vec!["d".to_string()]);
        assert!(!first.has(Role::Treatment));
        assert_eq!(md.regressor_names(), vec!["d", "x", INTERCEPT]);

        let second = md.remap(&[(Role::Control, &["d", INTERCEPT][..])]).unwrap();
        assert_eq!(second.width(Role::Control), 2);
        assert!(md.remap(&[(Role::Control, &["nope"][..])]).is_err());
    }

    #[test]
    fn test_require_roles() {
        let md = Microdata::builder(&data()).response("y").control(&["x"]).build().unwrap();
        assert!(md.require(&[Role::Response, Role::Control], "OLS").is_ok());
        let err = md.require(&[Role::Response, Role::Instrument], "IV").unwrap_err();
        assert!(matches!(err, Error::MissingRole { .. }));
    }

    #[test]
    fn test_dummies() {
        let ds = Dataset::new().with_dummies("rank", &[Some(1), Some(3), Some(2), None]).unwrap();
        assert_eq!(ds.names(), &["rank: 2".to_string(), "rank: 3".to_string()]);
        assert_eq!(ds.column("rank: 3").unwrap()[1], 1.0);
        assert!(ds.column("rank: 2").unwrap()[3].is_nan());
    }
}
