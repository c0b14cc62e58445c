//! Ground motion model interface
//!
//! A [`GroundMotionModel`] declares the distances, site parameters and rupture
//! parameters it reads from a [`RuptureContext`]; the context builder computes
//! the union of those declarations and nothing more.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::contexts::{DistanceParam, RuptureContext};
use crate::error::{HazardError, Result};
use crate::imt::{Imt, Imtls};
use crate::site::SiteParam;
use crate::stats::TruncatedNormal;

/// Contract every ground motion model fulfils
pub trait GroundMotionModel: Send + Sync + fmt::Debug {
    /// Model name, used in error messages and logs
    fn name(&self) -> &str;

    /// Distance measures read from the context
    fn requires_distances(&self) -> &[&'static str];

    /// Site parameters read from the context
    fn requires_sites_parameters(&self) -> &[&'static str];

    /// Rupture parameters read from the context
    fn requires_rupture_parameters(&self) -> &[&'static str];

    /// Mean and total standard deviation per site, in distribution space
    fn mean_std(&self, ctx: &RuptureContext, imt: &Imt) -> Result<(Vec<f64>, Vec<f64>)>;

    /// Conditional probabilities of exceedance, shape (N, L)
    fn poes(&self, ctx: &RuptureContext, imtls: &Imtls, tn: &TruncatedNormal) -> Result<Array2<f64>> {
        let n = ctx.num_sites();
        let loglevels = imtls.loglevels();
        let mut out = Array2::zeros((n, imtls.num_levels()));
        for (m, imt) in imtls.imts().iter().enumerate() {
            let (mean, std) = self.mean_std(ctx, imt)?;
            for l in imtls.slice(m) {
                for i in 0..n {
                    out[[i, l]] = exceedance(loglevels[l], mean[i], std[i], tn);
                }
            }
        }
        Ok(out)
    }
}

/// Probability that a normally distributed value exceeds `level`
pub fn exceedance(level: f64, mean: f64, std: f64, tn: &TruncatedNormal) -> f64 {
    let step = tn.level().map_or(false, |l| l <= 0.0);
    if std <= 0.0 || step {
        if level < mean {
            1.0
        } else {
            0.0
        }
    } else {
        tn.sf((level - mean) / std)
    }
}

/// Coefficients of [`LinearAttenuation`] for one IMT
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coefficients {
    /// Constant term
    pub c0: f64,
    /// Magnitude scaling around M6
    pub c1: f64,
    /// Geometric spreading
    pub c2: f64,
    /// Anelastic attenuation per km
    pub c3: f64,
    /// Site term on ln(vs30 / 760)
    pub c4: f64,
    /// Fictitious depth in km
    pub h: f64,
    /// Total standard deviation
    pub sigma: f64,
}

/// Coefficient-driven attenuation relation:
///
/// `ln Y = c0 + c1 (M - 6) + c2 ln sqrt(R² + h²) + c3 R + c4 ln(vs30 / 760)`
#[derive(Debug, Clone)]
pub struct LinearAttenuation {
    name: String,
    metric: DistanceParam,
    distances: Vec<&'static str>,
    coeffs: Vec<(Imt, Coefficients)>,
    mag_range: (f64, f64),
}

const SITE_PARAMS: &[&str] = &["vs30"];
const RUPTURE_PARAMS: &[&str] = &["mag"];

impl LinearAttenuation {
    /// Model measuring distance with `metric`
    pub fn new(name: impl Into<String>, metric: DistanceParam, coeffs: Vec<(Imt, Coefficients)>) -> Self {
        Self {
            name: name.into(),
            metric,
            distances: vec![metric.name()],
            coeffs,
            mag_range: (0.0, 10.0),
        }
    }

    /// Model with coefficients for PGA and a few spectral periods
    pub fn generic(name: impl Into<String>, metric: DistanceParam) -> Self {
        let row = |c0: f64, c1: f64, c2: f64, sigma: f64| Coefficients {
            c0,
            c1,
            c2,
            c3: -0.003,
            c4: -0.4,
            h: 6.0,
            sigma,
        };
        Self::new(
            name,
            metric,
            vec![
                (Imt::Pga, row(1.0, 0.9, -1.2, 0.6)),
                (Imt::Sa(0.2), row(1.6, 0.85, -1.15, 0.65)),
                (Imt::Sa(0.5), row(1.1, 1.0, -1.1, 0.7)),
                (Imt::Sa(1.0), row(0.4, 1.2, -1.05, 0.75)),
                (Imt::Mmi, row(7.0, 1.5, -1.8, 0.7)),
            ],
        )
    }

    /// Reject magnitudes outside `[min, max]`
    pub fn with_mag_range(mut self, min: f64, max: f64) -> Self {
        self.mag_range = (min, max);
        self
    }

    fn coefficients(&self, imt: &Imt) -> Result<&Coefficients> {
        self.coeffs
            .iter()
            .find(|(i, _)| i == imt)
            .map(|(_, c)| c)
            .ok_or_else(|| HazardError::gsim(&self.name, format!("unsupported IMT {imt}")))
    }
}

impl GroundMotionModel for LinearAttenuation {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_distances(&self) -> &[&'static str] {
        &self.distances
    }

    fn requires_sites_parameters(&self) -> &[&'static str] {
        SITE_PARAMS
    }

    fn requires_rupture_parameters(&self) -> &[&'static str] {
        RUPTURE_PARAMS
    }

    fn mean_std(&self, ctx: &RuptureContext, imt: &Imt) -> Result<(Vec<f64>, Vec<f64>)> {
        let (lo, hi) = self.mag_range;
        if ctx.mag < lo || ctx.mag > hi {
            return Err(HazardError::gsim(
                &self.name,
                format!("magnitude {} outside [{lo}, {hi}]", ctx.mag),
            ));
        }
        let c = self.coefficients(imt)?;
        let dists = ctx.distance(self.metric)?;
        let vs30 = ctx.site_param(SiteParam::Vs30)?;
        let mean = dists
            .iter()
            .zip(vs30)
            .map(|(&r, &v)| {
                c.c0 + c.c1 * (ctx.mag - 6.0)
                    + c.c2 * (r * r + c.h * c.h).sqrt().ln()
                    + c.c3 * r
                    + c.c4 * (v / 760.0).ln()
            })
            .collect();
        Ok((mean, vec![c.sigma; dists.len()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_exceedance_limits() {
        let tn = TruncatedNormal::new(None);
        assert_abs_diff_eq!(exceedance(0.0, 0.0, 1.0, &tn), 0.5, epsilon = 1e-12);
        assert_eq!(exceedance(-1.0, 0.0, 0.0, &tn), 1.0);
        assert_eq!(exceedance(1.0, 0.0, 0.0, &tn), 0.0);
        let step = TruncatedNormal::new(Some(0.0));
        assert_eq!(exceedance(-0.5, 0.0, 1.0, &step), 1.0);
        let tn3 = TruncatedNormal::new(Some(3.0));
        assert_eq!(exceedance(3.5, 0.0, 1.0, &tn3), 0.0);
    }

    #[test]
    fn test_unsupported_imt() {
        let gsim = LinearAttenuation::generic("LA", DistanceParam::Rrup);
        let err = gsim.coefficients(&Imt::Pgd).unwrap_err();
        assert!(err.to_string().contains("unsupported IMT PGD"));
    }
}
