//! Small numerically-stable math utilities used by the link functions.

/// Stable `log(1 + exp(x))`.
///
/// Branchless: `log(1+exp(x)) = max(x,0) + log(1+exp(-|x|))`.
#[inline]
pub fn log1pexp(x: f64) -> f64 {
    let abs_x = x.abs();
    let e = (-abs_x).exp(); // always in (0, 1], no overflow
    x.max(0.0) + e.ln_1p()
}

/// Stable sigmoid: `1 / (1 + exp(-x))`.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    let abs_x = x.abs();
    let e = (-abs_x).exp();
    let recip = 1.0 / (1.0 + e);
    if x >= 0.0 { recip } else { e * recip }
}

/// Exponential with a conservative clamp to avoid overflow.
///
/// Keeps count-model objectives finite so Newton steps can be halved back
/// into a sensible region instead of producing `inf`.
#[inline]
pub fn exp_clamped(x: f64) -> f64 {
    x.clamp(-700.0, 700.0).exp()
}

/// Complementary log-log inverse link: `1 - exp(-exp(x))`.
///
/// Computed as `-expm1(-exp(x))` so small probabilities keep full precision.
#[inline]
pub fn inv_cloglog(x: f64) -> f64 {
    -(-exp_clamped(x)).exp_m1()
}

/// `t / (exp(t) - 1)` for `t >= 0`, with the removable singularity at 0.
#[inline]
pub fn t_over_expm1(t: f64) -> f64 {
    if t < 1e-12 { 1.0 - 0.5 * t } else { t / t.exp_m1() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log1pexp_matches_naive_moderate_values() {
        let xs: [f64; 7] = [-10.0, -2.0, -0.1, 0.0, 0.1, 2.0, 10.0];
        for x in xs {
            let naive = (1.0 + x.exp()).ln();
            let stable = log1pexp(x);
            assert!((naive - stable).abs() < 1e-12, "x={}: {} vs {}", x, naive, stable);
        }
    }

    #[test]
    fn test_sigmoid_bounds_and_symmetry() {
        let xs: [f64; 7] = [-50.0, -10.0, -1.0, 0.0, 1.0, 10.0, 50.0];
        for x in xs {
            let s = sigmoid(x);
            assert!((0.0..=1.0).contains(&s), "sigmoid({})={}", x, s);
            let t = sigmoid(-x);
            assert!((s + t - 1.0).abs() < 1e-15, "sigmoid symmetry failed at {}", x);
        }
    }

    #[test]
    fn test_inv_cloglog_matches_naive() {
        for x in [-5.0, -1.0, 0.0, 0.5, 1.5] {
            let naive = 1.0 - (-(x as f64).exp()).exp();
            assert!((inv_cloglog(x) - naive).abs() < 1e-14, "x={}", x);
        }
        // Tail keeps relative precision.
        let x = -40.0_f64;
        assert!((inv_cloglog(x) / x.exp() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_t_over_expm1_continuous_at_zero() {
        assert_eq!(t_over_expm1(0.0), 1.0);
        assert!((t_over_expm1(1e-8) - 1.0).abs() < 1e-7);
        assert!((t_over_expm1(1.0) - 1.0 / (1.0_f64.exp() - 1.0)).abs() < 1e-15);
    }

    #[test]
    fn test_exp_clamped_is_finite_extremes() {
        let xs: [f64; 4] = [-1e6, -100.0, 100.0, 1e6];
        for x in xs {
            let y = exp_clamped(x);
            assert!(y.is_finite(), "x={} produced {}", x, y);
            assert!(y >= 0.0);
        }
        assert!((exp_clamped(1e6).ln() - 700.0).abs() < 1e-12);
    }
}
