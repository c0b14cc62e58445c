//! # Job Configuration
//!
//! Parses the job file shared by the classical and disaggregation
//! calculators and converts it into the parameters consumed by hazardlib.
//!
//! ## Table of Contents
//! 1. JobConfig: top-level job parameters
//! 2. Distance and point-source specifications
//! 3. Parsing and validation
//! 4. Conversions

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use seisma_hazardlib::contexts::{ContextParams, PointSourceDistance, ReqvTable};
use seisma_hazardlib::disagg::{BinWidths, PmfKind};
use seisma_hazardlib::filters::MagDepDistance;
use seisma_hazardlib::imt::{Imt, Imtls};
use seisma_hazardlib::tom::PoissonTom;

use crate::error::{CalcError, Result};

// ============================================================================
// 1. JobConfig
// ============================================================================

/// Job parameters, parsed from a TOML or JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Investigation time in years
    #[serde(default = "default_investigation_time")]
    pub investigation_time: f64,
    /// Truncation level of the ground motion distribution
    #[serde(default)]
    pub truncation_level: Option<f64>,
    /// IMT string → intensity levels
    pub imtls: BTreeMap<String, Vec<f64>>,
    /// TRT (or "default") → integration distance
    #[serde(default)]
    pub maximum_distance: BTreeMap<String, DistanceSpec>,
    /// Point-source distance: a number in km or "suggested"
    #[serde(default)]
    pub pointsource_distance: Option<PointSourceSpec>,
    /// TRT → equivalent distance table
    #[serde(default)]
    pub reqv: BTreeMap<String, ReqvSpec>,
    /// Distances below this are raised to it
    #[serde(default)]
    pub minimum_distance: f64,
    /// Intensity below which ruptures are ignored; derives the integration
    /// distance when positive
    #[serde(default)]
    pub minimum_intensity: f64,
    /// 0 or 1: no collapsing; 2: all parameters; 3+: magnitude only
    #[serde(default)]
    pub collapse_level: u8,
    /// Maximum number of distance buckets for point ruptures
    #[serde(default = "default_point_rupture_bins")]
    pub point_rupture_bins: usize,
    /// Few-sites threshold; also the largest disaggregated site count
    #[serde(default = "default_max_sites_disagg")]
    pub max_sites_disagg: usize,
    /// Target number of tasks
    #[serde(default = "default_concurrent_tasks")]
    pub concurrent_tasks: usize,
    /// Blocks lighter than this are computed without fan-out
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    /// Disaggregation block size in ruptures
    #[serde(default = "default_ruptures_per_block")]
    pub ruptures_per_block: usize,
    /// Re-split the source blocks inside the tasks
    #[serde(default = "default_true")]
    pub split_sources: bool,
    /// One task per source, for source-level disaggregation
    #[serde(default)]
    pub disagg_by_src: bool,

    /// Magnitude bin width
    #[serde(default)]
    pub mag_bin_width: Option<f64>,
    /// Distance bin width in km
    #[serde(default)]
    pub distance_bin_width: Option<f64>,
    /// Coordinate bin width in degrees
    #[serde(default)]
    pub coordinate_bin_width: Option<f64>,
    /// Number of epsilon bins
    #[serde(default = "default_num_epsilon_bins")]
    pub num_epsilon_bins: usize,
    /// Probabilities of exceedance to disaggregate
    #[serde(default)]
    pub poes_disagg: Vec<f64>,
    /// IMT string → intensity to disaggregate, instead of `poes_disagg`
    #[serde(default)]
    pub iml_disagg: BTreeMap<String, f64>,
    /// Names of the PMF kinds to extract
    #[serde(default = "default_disagg_outputs")]
    pub disagg_outputs: Vec<String>,
    /// Realizations to disaggregate, one per site or one for all sites
    #[serde(default)]
    pub rlz_index: Option<Vec<usize>>,
    /// Realizations closest to the mean curve when `rlz_index` is not given
    #[serde(default = "default_num_rlzs_disagg")]
    pub num_rlzs_disagg: usize,
    /// Largest accepted estimated data transfer in bytes
    #[serde(default = "default_max_data_transfer")]
    pub max_data_transfer: f64,
}

fn default_investigation_time() -> f64 { 50.0 }
fn default_point_rupture_bins() -> usize { 20 }
fn default_max_sites_disagg() -> usize { 10 }
fn default_concurrent_tasks() -> usize { (rayon::current_num_threads() * 2).max(1) }
fn default_min_weight() -> f64 { 200.0 }
fn default_ruptures_per_block() -> usize { 1000 }
fn default_true() -> bool { true }
fn default_num_epsilon_bins() -> usize { 1 }
fn default_num_rlzs_disagg() -> usize { 1 }
fn default_max_data_transfer() -> f64 { 2e11 }

fn default_disagg_outputs() -> Vec<String> {
    PmfKind::ALL.iter().map(|k| k.name().to_string()).collect()
}

// ============================================================================
// 2. Distance and point-source specifications
// ============================================================================

/// Integration distance: a constant or (magnitude, distance) pairs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DistanceSpec {
    Constant(f64),
    ByMag(Vec<(f64, f64)>),
}

impl DistanceSpec {
    fn pairs(&self) -> Vec<(f64, f64)> {
        match self {
            DistanceSpec::Constant(d) => vec![(0.0, *d)],
            DistanceSpec::ByMag(pairs) => pairs.clone(),
        }
    }
}

/// Point-source distance as written in the job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointSourceSpec {
    Distance(f64),
    Keyword(String),
}

/// Interpreted point-source distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointSourceMode {
    /// Keep every finite rupture
    Off,
    /// Collapse to point ruptures beyond a constant distance; 0 always
    Distance(f64),
    /// Derive distances per magnitude from the effect of the ruptures
    Suggested,
}

/// Equivalent distance table as written in the job file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqvSpec {
    pub mags: Vec<f64>,
    pub repi: Vec<f64>,
    pub reqv: Vec<Vec<f64>>,
}

// ============================================================================
// 3. Parsing and validation
// ============================================================================

impl JobConfig {
    /// Load and validate a job file, TOML or JSON by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            let config: JobConfig = serde_json::from_str(&content)?;
            config.validate()?;
            return Ok(config);
        }
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: JobConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// True when any disaggregation setting is present
    pub fn is_disaggregation(&self) -> bool {
        !self.poes_disagg.is_empty()
            || !self.iml_disagg.is_empty()
            || self.mag_bin_width.is_some()
            || self.distance_bin_width.is_some()
            || self.coordinate_bin_width.is_some()
    }

    /// Fail fast on inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.investigation_time <= 0.0 || self.investigation_time.is_nan() {
            return Err(CalcError::config(format!(
                "investigation_time must be positive, got {}",
                self.investigation_time
            )));
        }
        if self.imtls.is_empty() {
            return Err(CalcError::config("no intensity measure types"));
        }
        let imtls = self.imtls()?;
        self.maximum_distance()?;
        self.pointsource_mode()?;
        if self.minimum_distance < 0.0 || self.minimum_intensity < 0.0 {
            return Err(CalcError::config(
                "minimum_distance and minimum_intensity cannot be negative",
            ));
        }
        if self.concurrent_tasks == 0 || self.ruptures_per_block == 0 {
            return Err(CalcError::config(
                "concurrent_tasks and ruptures_per_block must be positive",
            ));
        }
        if self.is_disaggregation() {
            self.validate_disaggregation(&imtls)?;
        }
        Ok(())
    }

    fn validate_disaggregation(&self, imtls: &Imtls) -> Result<()> {
        if !self.truncation_level.is_some_and(|tl| tl > 0.0) {
            return Err(CalcError::config(
                "disaggregation requires a positive truncation_level",
            ));
        }
        match (self.poes_disagg.is_empty(), self.iml_disagg.is_empty()) {
            (true, true) => {
                return Err(CalcError::config(
                    "disaggregation requires poes_disagg or iml_disagg",
                ))
            }
            (false, false) => {
                return Err(CalcError::config(
                    "poes_disagg and iml_disagg cannot be given together",
                ))
            }
            _ => {}
        }
        if let Some(poe) = self.poes_disagg.iter().find(|&&p| p <= 0.0 || p >= 1.0 || p.is_nan()) {
            return Err(CalcError::config(format!("poes_disagg must be in (0, 1), got {poe}")));
        }
        for (imt, iml) in &self.iml_disagg {
            let parsed: Imt = imt.parse()?;
            if !imtls.imts().contains(&parsed) {
                return Err(CalcError::config(format!("iml_disagg has {imt}, which is not in imtls")));
            }
            if *iml <= 0.0 || iml.is_nan() {
                return Err(CalcError::config(format!("iml_disagg for {imt} must be positive")));
            }
        }
        self.bin_widths()?;
        self.disagg_outputs()?;
        if self.num_rlzs_disagg == 0 && self.rlz_index.is_none() {
            return Err(CalcError::config("num_rlzs_disagg must be positive"));
        }
        Ok(())
    }

    // ========================================================================
    // 4. Conversions
    // ========================================================================

    /// Intensity measure types and levels
    pub fn imtls(&self) -> Result<Imtls> {
        Ok(Imtls::from_strs(
            self.imtls.iter().map(|(imt, levels)| (imt.as_str(), levels.clone())),
        )?)
    }

    /// Integration distance; unbounded when not configured
    pub fn maximum_distance(&self) -> Result<MagDepDistance> {
        let magdist = self
            .maximum_distance
            .iter()
            .map(|(trt, spec)| (trt.clone(), spec.pairs()))
            .collect();
        Ok(MagDepDistance::new(magdist)?)
    }

    /// Temporal occurrence model
    pub fn tom(&self) -> Result<PoissonTom> {
        Ok(PoissonTom::new(self.investigation_time)?)
    }

    /// Interpreted point-source distance
    pub fn pointsource_mode(&self) -> Result<PointSourceMode> {
        match &self.pointsource_distance {
            None => Ok(PointSourceMode::Off),
            Some(PointSourceSpec::Distance(d)) if *d >= 0.0 => Ok(PointSourceMode::Distance(*d)),
            Some(PointSourceSpec::Keyword(k)) if k == "suggested" => Ok(PointSourceMode::Suggested),
            Some(other) => Err(CalcError::config(format!(
                "invalid pointsource_distance {other:?}"
            ))),
        }
    }

    /// Parameters of the context maker of a TRT; "suggested" point-source
    /// distances are filled in by the classical calculator
    pub fn context_params(&self, trt: &str) -> Result<ContextParams> {
        let pointsource_distance = match self.pointsource_mode()? {
            PointSourceMode::Distance(d) if d == 0.0 => Some(PointSourceDistance::Zero),
            PointSourceMode::Distance(d) => Some(PointSourceDistance::Constant(d)),
            PointSourceMode::Off | PointSourceMode::Suggested => None,
        };
        let reqv = match self.reqv.get(trt) {
            Some(spec) => Some(ReqvTable::new(spec.mags.clone(), spec.repi.clone(), spec.reqv.clone())?),
            None => None,
        };
        Ok(ContextParams {
            imtls: self.imtls()?,
            tom: self.tom()?,
            truncation_level: self.truncation_level,
            maximum_distance: self.maximum_distance()?,
            pointsource_distance,
            reqv,
            minimum_distance: self.minimum_distance,
            collapse_level: self.collapse_level,
            point_rupture_bins: self.point_rupture_bins,
            max_sites_disagg: self.max_sites_disagg,
        })
    }

    /// Disaggregation bin widths
    pub fn bin_widths(&self) -> Result<BinWidths> {
        let (Some(mag), Some(distance), Some(coordinate)) =
            (self.mag_bin_width, self.distance_bin_width, self.coordinate_bin_width)
        else {
            return Err(CalcError::config(
                "disaggregation requires mag_bin_width, distance_bin_width and coordinate_bin_width",
            ));
        };
        let widths = BinWidths {
            mag,
            distance,
            coordinate,
            num_epsilon_bins: self.num_epsilon_bins,
            truncation_level: self.truncation_level.unwrap_or(0.0),
        };
        widths.validate()?;
        Ok(widths)
    }

    /// Requested PMF kinds, in canonical order
    pub fn disagg_outputs(&self) -> Result<Vec<PmfKind>> {
        let mut kinds = self
            .disagg_outputs
            .iter()
            .map(|name| name.parse::<PmfKind>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        kinds.sort();
        kinds.dedup();
        Ok(kinds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB: &str = r#"
        description = "classical and disaggregation"
        investigation_time = 50.0
        truncation_level = 3.0
        collapse_level = 2

        [imtls]
        PGA = [0.005, 0.05, 0.2, 0.5]
        "SA(0.5)" = [0.01, 0.1, 0.4]

        [maximum_distance]
        default = 200.0
        "Stable Continental Crust" = [[5.0, 100.0], [7.0, 300.0]]
    "#;

    #[test]
    fn test_parse_classical_job() {
        let config = JobConfig::from_toml_str(JOB).unwrap();
        assert_eq!(config.imtls().unwrap().num_levels(), 7);
        assert_eq!(config.point_rupture_bins, 20);
        assert!(!config.is_disaggregation());

        let md = config.maximum_distance().unwrap();
        assert_eq!(md.get("Active Shallow Crust", 6.0), 200.0);
        assert_eq!(md.get("Stable Continental Crust", 6.0), 200.0);
        assert_eq!(md.get("Stable Continental Crust", 7.5), 300.0);

        let params = config.context_params("Active Shallow Crust").unwrap();
        assert_eq!(params.collapse_level, 2);
        assert_eq!(params.truncation_level, Some(3.0));
        assert!(params.pointsource_distance.is_none());
    }

    #[test]
    fn test_pointsource_distance() {
        let job = format!("pointsource_distance = 0.0\n{JOB}");
        let params = JobConfig::from_toml_str(&job).unwrap().context_params("x").unwrap();
        assert_eq!(params.pointsource_distance, Some(PointSourceDistance::Zero));

        let job = format!("pointsource_distance = 40.0\n{JOB}");
        let params = JobConfig::from_toml_str(&job).unwrap().context_params("x").unwrap();
        assert_eq!(params.pointsource_distance.unwrap().get(6.35), 40.0);

        let job = format!("pointsource_distance = \"suggested\"\n{JOB}");
        let config = JobConfig::from_toml_str(&job).unwrap();
        assert_eq!(config.pointsource_mode().unwrap(), PointSourceMode::Suggested);

        let job = format!("pointsource_distance = \"far\"\n{JOB}");
        assert!(JobConfig::from_toml_str(&job).is_err());
    }

    #[test]
    fn test_disaggregation_settings() {
        let disagg = "mag_bin_width = 0.5\ndistance_bin_width = 10.0\ncoordinate_bin_width = 0.2\nnum_epsilon_bins = 4\n";
        let job = format!("{disagg}poes_disagg = [0.1]\n{JOB}");
        let config = JobConfig::from_toml_str(&job).unwrap();
        assert!(config.is_disaggregation());
        assert_eq!(config.bin_widths().unwrap().num_epsilon_bins, 4);
        assert_eq!(config.disagg_outputs().unwrap().len(), PmfKind::ALL.len());

        // neither poes_disagg nor iml_disagg
        assert!(JobConfig::from_toml_str(&format!("{disagg}{JOB}")).is_err());

        // no truncation level
        let job = format!("{disagg}poes_disagg = [0.1]\n{}", JOB.replace("truncation_level = 3.0", ""));
        assert!(JobConfig::from_toml_str(&job).is_err());

        // unknown output kind
        let job = format!("{disagg}poes_disagg = [0.1]\ndisagg_outputs = [\"Mag\", \"Foo\"]\n{JOB}");
        assert!(JobConfig::from_toml_str(&job).is_err());

        // iml_disagg on an IMT without levels
        let job = format!("{disagg}\n{JOB}\n[iml_disagg]\n\"SA(1.0)\" = 0.1\n");
        assert!(JobConfig::from_toml_str(&job).is_err());
        let job = format!("{disagg}\n{JOB}\n[iml_disagg]\nPGA = 0.1\n");
        assert_eq!(JobConfig::from_toml_str(&job).unwrap().iml_disagg["PGA"], 0.1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(&path, JOB).unwrap();
        let config = JobConfig::load(&path).unwrap();
        assert_eq!(config.description, "classical and disaggregation");
        assert!(JobConfig::load(dir.path().join("missing.toml")).is_err());
        assert!(matches!(JobConfig::from_toml_str("imtls = 3"), Err(CalcError::Toml(_))));

        let json = dir.path().join("job.json");
        std::fs::write(&json, serde_json::to_string(&config).unwrap()).unwrap();
        let reloaded = JobConfig::load(&json).unwrap();
        assert_eq!(reloaded.imtls, config.imtls);
        assert_eq!(reloaded.maximum_distance, config.maximum_distance);
        std::fs::write(&json, "{").unwrap();
        assert!(matches!(JobConfig::load(&json), Err(CalcError::Json(_))));
    }
}
