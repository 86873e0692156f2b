//! Summary records handed to presentation layers.

use serde::{Deserialize, Serialize};

use crate::Result;

/// One row of a coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefRecord {
    /// Coefficient label as it appears in regression tables.
    pub name: String,
    /// Point estimate.
    pub estimate: f64,
    /// Standard error (sqrt of the covariance diagonal).
    pub stderr: f64,
    /// Ratio of estimate to standard error.
    pub tstat: f64,
    /// Two-sided normal-approximation p-value.
    pub pval: f64,
    /// Lower confidence bound.
    pub lower: f64,
    /// Upper confidence bound.
    pub upper: f64,
}

/// Flat coefficient table (one record per coefficient).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefTable {
    /// Confidence level used for `lower`/`upper`.
    pub level: f64,
    /// Number of observations behind the estimates (`None` for derived objects).
    pub nobs: Option<f64>,
    /// Records in coefficient order.
    pub records: Vec<CoefRecord>,
}

impl CoefTable {
    /// Look up a record by coefficient name.
    pub fn get(&self, name: &str) -> Option<&CoefRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Coefficient names in table order.
    pub fn names(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.name.as_str()).collect()
    }

    /// Serialize to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Serialize to compact JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
