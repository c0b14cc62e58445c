//! Standard normal distribution, optionally truncated symmetrically

/// Standard normal cumulative distribution function
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * libm::erfc(-x / std::f64::consts::SQRT_2)
}

/// Standard normal survival function
pub fn norm_sf(x: f64) -> f64 {
    0.5 * libm::erfc(x / std::f64::consts::SQRT_2)
}

/// Standard normal truncated at ±`level`.
///
/// `level = None` means no truncation; `level = Some(0.0)` degenerates into a
/// step at zero (the median is exceeded or not).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncatedNormal {
    level: Option<f64>,
    phi_lo: f64,
    mass: f64,
}

impl TruncatedNormal {
    /// Build the distribution for a truncation level
    pub fn new(level: Option<f64>) -> Self {
        match level {
            Some(l) if l > 0.0 => {
                let phi_lo = norm_cdf(-l);
                Self {
                    level,
                    phi_lo,
                    mass: norm_cdf(l) - phi_lo,
                }
            }
            _ => Self {
                level,
                phi_lo: 0.0,
                mass: 1.0,
            },
        }
    }

    /// Truncation level
    pub fn level(&self) -> Option<f64> {
        self.level
    }

    /// Cumulative distribution function
    pub fn cdf(&self, x: f64) -> f64 {
        match self.level {
            None => norm_cdf(x),
            Some(l) if l <= 0.0 => {
                if x >= 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Some(l) => {
                if x <= -l {
                    0.0
                } else if x >= l {
                    1.0
                } else {
                    ((norm_cdf(x) - self.phi_lo) / self.mass).clamp(0.0, 1.0)
                }
            }
        }
    }

    /// Survival function, i.e. the probability of exceeding `x` standard deviations
    pub fn sf(&self, x: f64) -> f64 {
        match self.level {
            None => norm_sf(x),
            Some(l) if l <= 0.0 => {
                if x < 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Some(_) => 1.0 - self.cdf(x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_norm_cdf_reference_values() {
        assert_abs_diff_eq!(norm_cdf(0.0), 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(norm_cdf(1.0), 0.8413447460685429, epsilon = 1e-12);
        assert_abs_diff_eq!(norm_sf(1.96), 0.024997895148220435, epsilon = 1e-12);
    }

    #[test]
    fn test_truncated_bounds() {
        let tn = TruncatedNormal::new(Some(3.0));
        assert_eq!(tn.cdf(-3.5), 0.0);
        assert_eq!(tn.cdf(3.0), 1.0);
        assert_abs_diff_eq!(tn.cdf(0.0), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(tn.sf(-3.0), 1.0, epsilon = 1e-12);
        assert!(tn.sf(1.0) < norm_sf(1.0));
    }

    #[test]
    fn test_zero_truncation_is_a_step() {
        let tn = TruncatedNormal::new(Some(0.0));
        assert_eq!(tn.sf(-0.1), 1.0);
        assert_eq!(tn.sf(0.1), 0.0);
    }
}
