//! Probability building blocks for microx.
//!
//! - small numeric helpers (stable log/exp/sigmoid primitives) used by the
//!   binary-choice and count links
//! - standard normal pdf/cdf/quantile used by the probit link and by
//!   significance tests

pub mod math;
pub mod normal;
