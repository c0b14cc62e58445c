//! Intensity measure types and their levels

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};

/// An intensity measure type
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Imt {
    /// Peak ground acceleration (g)
    Pga,
    /// Peak ground velocity (cm/s)
    Pgv,
    /// Peak ground displacement (cm)
    Pgd,
    /// Spectral acceleration at the given period (g)
    Sa(f64),
    /// Modified Mercalli intensity
    Mmi,
}

impl Imt {
    /// Intensities of this type are modelled in log space, except MMI
    pub fn is_logarithmic(&self) -> bool {
        !matches!(self, Imt::Mmi)
    }

    /// Period for spectral accelerations, 0 for PGA
    pub fn period(&self) -> Option<f64> {
        match self {
            Imt::Pga => Some(0.0),
            Imt::Sa(t) => Some(*t),
            _ => None,
        }
    }
}

impl FromStr for Imt {
    type Err = HazardError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || HazardError::InvalidImt(s.to_string());
        match s.trim() {
            "PGA" => Ok(Imt::Pga),
            "PGV" => Ok(Imt::Pgv),
            "PGD" => Ok(Imt::Pgd),
            "MMI" => Ok(Imt::Mmi),
            other => {
                let period = other
                    .strip_prefix("SA(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(bad)?;
                let period: f64 = period.trim().parse().map_err(|_| bad())?;
                if period <= 0.0 || !period.is_finite() {
                    return Err(bad());
                }
                Ok(Imt::Sa(period))
            }
        }
    }
}

impl fmt::Display for Imt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Imt::Pga => f.write_str("PGA"),
            Imt::Pgv => f.write_str("PGV"),
            Imt::Pgd => f.write_str("PGD"),
            Imt::Mmi => f.write_str("MMI"),
            Imt::Sa(t) => write!(f, "SA({t})"),
        }
    }
}

/// Convert an intensity level to the space the ground motion distribution lives in
pub fn to_distribution_value(iml: f64, imt: &Imt) -> f64 {
    if imt.is_logarithmic() {
        iml.ln()
    } else {
        iml
    }
}

/// Ordered mapping IMT → intensity levels, flattened into a single level axis
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Imtls {
    imts: Vec<Imt>,
    levels: Vec<Vec<f64>>,
}

impl Imtls {
    /// Build from (imt, levels) pairs; levels must be positive and increasing
    pub fn new(pairs: Vec<(Imt, Vec<f64>)>) -> Result<Self> {
        let mut imtls = Imtls::default();
        for (imt, levels) in pairs {
            if levels.is_empty() {
                return Err(HazardError::config(format!("no levels for {imt}")));
            }
            if levels.windows(2).any(|w| w[1] <= w[0]) {
                return Err(HazardError::config(format!(
                    "the levels for {imt} are not strictly increasing"
                )));
            }
            if imtls.imts.contains(&imt) {
                return Err(HazardError::config(format!("duplicated IMT {imt}")));
            }
            imtls.imts.push(imt);
            imtls.levels.push(levels);
        }
        Ok(imtls)
    }

    /// Parse from (string, levels) pairs
    pub fn from_strs<'a>(pairs: impl IntoIterator<Item = (&'a str, Vec<f64>)>) -> Result<Self> {
        let pairs = pairs
            .into_iter()
            .map(|(s, lv)| Ok((s.parse::<Imt>()?, lv)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(pairs)
    }

    /// The intensity measure types, in order
    pub fn imts(&self) -> &[Imt] {
        &self.imts
    }

    /// Number of IMTs (M)
    pub fn num_imts(&self) -> usize {
        self.imts.len()
    }

    /// Total number of levels across all IMTs (L)
    pub fn num_levels(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Levels of the m-th IMT
    pub fn levels(&self, m: usize) -> &[f64] {
        &self.levels[m]
    }

    /// Slice of the flattened level axis belonging to the m-th IMT
    pub fn slice(&self, m: usize) -> Range<usize> {
        let start: usize = self.levels[..m].iter().map(Vec::len).sum();
        start..start + self.levels[m].len()
    }

    /// Flattened levels
    pub fn array(&self) -> Vec<f64> {
        self.levels.iter().flatten().copied().collect()
    }

    /// Flattened levels in distribution space (natural log except for MMI)
    pub fn loglevels(&self) -> Vec<f64> {
        self.imts
            .iter()
            .zip(&self.levels)
            .flat_map(|(imt, lv)| lv.iter().map(move |&x| to_distribution_value(x, imt)))
            .collect()
    }

    /// Iterate over (imt, levels)
    pub fn iter(&self) -> impl Iterator<Item = (&Imt, &[f64])> {
        self.imts.iter().zip(self.levels.iter().map(Vec::as_slice))
    }

    /// Same IMTs, one level each
    pub fn with_single_levels(&self, levels: &[f64]) -> Result<Self> {
        Self::new(
            self.imts
                .iter()
                .zip(levels)
                .map(|(&imt, &l)| (imt, vec![l]))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("PGA".parse::<Imt>().unwrap(), Imt::Pga);
        assert_eq!("SA(0.5)".parse::<Imt>().unwrap(), Imt::Sa(0.5));
        assert_eq!(Imt::Sa(0.5).to_string(), "SA(0.5)");
        assert!("SA(-1)".parse::<Imt>().is_err());
        assert!("XYZ".parse::<Imt>().is_err());
    }

    #[test]
    fn test_imtls_slices() {
        let imtls = Imtls::from_strs([
            ("PGA", vec![0.1, 0.2, 0.3, 0.4]),
            ("SA(0.5)", vec![0.1, 0.2, 0.3, 0.4, 0.5]),
            ("MMI", vec![5.0, 6.0]),
        ])
        .unwrap();
        assert_eq!(imtls.num_levels(), 11);
        assert_eq!(imtls.slice(1), 4..9);
        assert_eq!(imtls.slice(2), 9..11);
        let log = imtls.loglevels();
        assert!((log[0] - 0.1f64.ln()).abs() < 1e-12);
        assert_eq!(log[10], 6.0);
    }

    #[test]
    fn test_levels_must_increase() {
        assert!(Imtls::from_strs([("PGA", vec![0.2, 0.1])]).is_err());
    }
}
