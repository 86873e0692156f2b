//! Standard normal distribution utilities.

use mx_core::{Error, Result};
use statrs::distribution::{ContinuousCDF, Normal};

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Standard normal density `φ(x)`.
#[inline]
pub fn pdf(x: f64) -> f64 {
    (-0.5 * x * x - LN_SQRT_2PI).exp()
}

/// Standard normal CDF `Φ(x)`.
///
/// Uses erfc for better numerical behavior in the tails:
/// `Φ(x) = 0.5 * erfc(-x / sqrt(2))`.
#[inline]
pub fn cdf(x: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal survival function `1 - Φ(x)`.
#[inline]
pub fn sf(x: f64) -> f64 {
    0.5 * statrs::function::erf::erfc(x / std::f64::consts::SQRT_2)
}

/// `ln Φ(x)`, using the leading tail expansion below -30.
#[inline]
pub fn log_cdf(x: f64) -> f64 {
    if x > -30.0 {
        cdf(x).ln()
    } else {
        -0.5 * x * x - LN_SQRT_2PI - (-x).ln() - 1.0 / (x * x)
    }
}

/// Inverse Mills ratio `φ(x) / Φ(x)`.
///
/// Far in the left tail both terms underflow; the asymptotic expansion
/// `-x - 1/x + 2/x^3` takes over there.
#[inline]
pub fn mills(x: f64) -> f64 {
    if x > -30.0 {
        pdf(x) / cdf(x)
    } else {
        let x2 = x * x;
        -x - 1.0 / x + 2.0 / (x * x2)
    }
}

/// Two-sided p-value of a z statistic.
#[inline]
pub fn two_sided_pval(z: f64) -> f64 {
    if z.is_nan() { f64::NAN } else { (2.0 * sf(z.abs())).min(1.0) }
}

/// Quantile of the standard normal distribution.
pub fn quantile(p: f64) -> Result<f64> {
    if !(p > 0.0 && p < 1.0) {
        return Err(Error::Validation(format!("quantile probability must be in (0,1), got {}", p)));
    }
    let n = Normal::new(0.0, 1.0).map_err(|e| Error::Computation(e.to_string()))?;
    Ok(n.inverse_cdf(p))
}
