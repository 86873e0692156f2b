//! Correlation kernels bounding the dependence between two observations.
//!
//! The kernel argument is the normalized distance `x = distance / bandwidth`.
//! Every kernel is zero for `x > 1`, so pairs beyond the bandwidth never
//! enter the variance computation. Formulae follow Andrews (1991).

use std::fmt;
use std::sync::Arc;

use mx_core::{Error, Result};

/// Monotone-decreasing function of the normalized distance.
#[derive(Clone, Default)]
pub enum Kernel {
    /// Triangular kernel `1 - |x|`.
    Bartlett,
    /// Parzen kernel (the default).
    #[default]
    Parzen,
    /// Unit weight up to the bandwidth.
    Truncated,
    /// `(1 + cos(πx)) / 2`.
    TukeyHanning,
    /// User-supplied bound. Evaluated on `[0, 1]` only.
    Custom(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl Kernel {
    /// Wrap an arbitrary monotone-decreasing function.
    pub fn custom(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        Kernel::Custom(Arc::new(f))
    }

    /// Look up a predefined kernel by name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "bartlett" => Ok(Kernel::Bartlett),
            "parzen" => Ok(Kernel::Parzen),
            "truncated" => Ok(Kernel::Truncated),
            "tukeyhanning" => Ok(Kernel::TukeyHanning),
            _ => Err(Error::Validation(format!("unknown kernel `{}`", name))),
        }
    }

    /// Correlation bound at normalized distance `x`, clamped to `[0, 1]`.
    pub fn bound(&self, x: f64) -> f64 {
        let x = x.abs();
        if x.is_nan() || x > 1.0 {
            return 0.0;
        }
        let w = match self {
            Kernel::Bartlett => 1.0 - x,
            Kernel::Parzen => {
                if x <= 0.5 {
                    1.0 - 6.0 * x * x + 6.0 * x * x * x
                } else {
                    2.0 * (1.0 - x).powi(3)
                }
            }
            Kernel::Truncated => 1.0,
            Kernel::TukeyHanning => 0.5 * (1.0 + (std::f64::consts::PI * x).cos()),
            Kernel::Custom(f) => f(x),
        };
        if w.is_finite() { w.clamp(0.0, 1.0) } else { 0.0 }
    }

    /// Kernel name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Bartlett => "bartlett",
            Kernel::Parzen => "parzen",
            Kernel::Truncated => "truncated",
            Kernel::TukeyHanning => "tukeyhanning",
            Kernel::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kernel({})", self.name())
    }
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Kernel::Custom(a), Kernel::Custom(b)) => Arc::ptr_eq(a, b),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Kernel; 4] = [Kernel::Bartlett, Kernel::Parzen, Kernel::Truncated, Kernel::TukeyHanning];

    #[test]
    fn test_unit_at_origin_zero_beyond_bandwidth() {
        for k in ALL.iter() {
            assert_eq!(k.bound(0.0), 1.0, "{:?}", k);
            assert_eq!(k.bound(1.0 + 1e-12), 0.0, "{:?}", k);
            assert_eq!(k.bound(-3.0), 0.0, "{:?}", k);
        }
    }

    #[test]
    fn test_monotone_on_unit_interval() {
        for k in ALL.iter() {
            let mut prev = k.bound(0.0);
            for i in 1..=100 {
                let w = k.bound(i as f64 / 100.0);
                assert!(w <= prev + 1e-15, "{:?} increases at {}", k, i);
                prev = w;
            }
        }
    }

    #[test]
    fn test_parzen_is_continuous_at_half() {
        let left = Kernel::Parzen.bound(0.5);
        let right = Kernel::Parzen.bound(0.5 + 1e-12);
        assert!((left - 0.25).abs() < 1e-12);
        assert!((left - right).abs() < 1e-9);
    }

    #[test]
    fn test_custom_is_clamped_and_cut_off() {
        let k = Kernel::custom(|x| 2.0 - x);
        assert_eq!(k.bound(0.5), 1.0);
        assert_eq!(k.bound(1.5), 0.0);
        let k2 = k.clone();
        assert_eq!(k, k2);
        assert_ne!(k, Kernel::custom(|x| 2.0 - x));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Kernel::from_name("Tukey-Hanning").unwrap(), Kernel::TukeyHanning);
        assert_eq!(Kernel::from_name("parzen").unwrap(), Kernel::Parzen);
        assert!(Kernel::from_name("epanechnikov").is_err());
    }
}
