//! # Rupture data store
//!
//! Columnar record of few-sites contexts, keyed by magnitude, written by the
//! classical calculator and read back by disaggregation.
//!
//! ## Table of Contents
//! 1. RupData: columnar contexts
//! 2. RuptureStore trait
//! 3. MemoryRuptureStore
//! 4. FileRuptureStore: MAGIC + VERSION + HASH + ZSTD(bincode)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contexts::{DistanceParam, Requirements, RuptureContext, RuptureParam};
use crate::error::{HazardError, Result};
use crate::filters::MagKey;
use crate::site::SiteParam;
use crate::source::Occurrence;
use crate::tom::PoissonTom;

// ============================================================================
// 1. RupData
// ============================================================================

/// One column per context field; variable-length fields hold one vector per
/// context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RupData {
    pub rup_id: Vec<u64>,
    pub src_id: Vec<u32>,
    pub mag: Vec<f64>,
    /// NaN for non-parametric ruptures
    pub occurrence_rate: Vec<f64>,
    /// Empty for parametric ruptures
    pub probs_occur: Vec<Vec<f64>>,
    pub time_span: Vec<f64>,
    pub weight: Vec<f64>,
    pub rupture: BTreeMap<RuptureParam, Vec<f64>>,
    pub sids: Vec<Vec<u32>>,
    pub distances: BTreeMap<DistanceParam, Vec<Vec<f64>>>,
    pub sites: BTreeMap<SiteParam, Vec<Vec<f64>>>,
    pub clon: Vec<Vec<f64>>,
    pub clat: Vec<Vec<f64>>,
}

impl RupData {
    /// Number of stored contexts
    pub fn len(&self) -> usize {
        self.mag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mag.is_empty()
    }

    /// Column the contexts; they must all carry the same fields
    pub fn from_contexts<'a>(ctxs: impl IntoIterator<Item = &'a RuptureContext>) -> Result<Self> {
        let mut data = RupData::default();
        for ctx in ctxs {
            data.push(ctx);
        }
        data.check()?;
        Ok(data)
    }

    fn push(&mut self, ctx: &RuptureContext) {
        self.rup_id.push(ctx.rup_id);
        self.src_id.push(ctx.src_id);
        self.mag.push(ctx.mag);
        match &ctx.occurrence {
            Occurrence::Rate(rate) => {
                self.occurrence_rate.push(*rate);
                self.probs_occur.push(Vec::new());
            }
            Occurrence::Pmf(probs) => {
                self.occurrence_rate.push(f64::NAN);
                self.probs_occur.push(probs.to_vec());
            }
        }
        self.time_span.push(ctx.tom.time_span);
        self.weight.push(ctx.weight);
        for (param, value) in ctx.rupture_params() {
            self.rupture.entry(param).or_default().push(value);
        }
        self.sids.push(ctx.sids().to_vec());
        for (param, values) in ctx.distances().iter() {
            self.distances.entry(param).or_default().push(values.to_vec());
        }
        for (param, values) in ctx.site_params() {
            self.sites.entry(param).or_default().push(values.to_vec());
        }
        self.clon.push(ctx.clon().map(<[f64]>::to_vec).unwrap_or_default());
        self.clat.push(ctx.clat().map(<[f64]>::to_vec).unwrap_or_default());
    }

    /// Every column has one entry per context
    fn check(&self) -> Result<()> {
        let n = self.len();
        let lengths = [
            ("rup_id", self.rup_id.len()),
            ("src_id", self.src_id.len()),
            ("occurrence_rate", self.occurrence_rate.len()),
            ("probs_occur", self.probs_occur.len()),
            ("time_span", self.time_span.len()),
            ("weight", self.weight.len()),
            ("sids", self.sids.len()),
            ("clon", self.clon.len()),
            ("clat", self.clat.len()),
        ]
        .into_iter()
        .chain(self.rupture.iter().map(|(p, c)| (p.name(), c.len())))
        .chain(self.distances.iter().map(|(p, c)| (p.name(), c.len())))
        .chain(self.sites.iter().map(|(p, c)| (p.name(), c.len())));
        for (field, got) in lengths {
            if got != n {
                return Err(HazardError::store(format!(
                    "column {field} has {got} rows, expected {n}: heterogeneous contexts"
                )));
            }
        }
        Ok(())
    }

    /// Append the rows of `other`
    pub fn extend(&mut self, other: RupData) -> Result<()> {
        if self.is_empty() {
            *self = other;
            return Ok(());
        }
        if other.is_empty() {
            return Ok(());
        }
        let same_columns = self.rupture.keys().eq(other.rupture.keys())
            && self.distances.keys().eq(other.distances.keys())
            && self.sites.keys().eq(other.sites.keys());
        if !same_columns {
            return Err(HazardError::store("cannot merge rupture data with different columns"));
        }
        self.rup_id.extend(other.rup_id);
        self.src_id.extend(other.src_id);
        self.mag.extend(other.mag);
        self.occurrence_rate.extend(other.occurrence_rate);
        self.probs_occur.extend(other.probs_occur);
        self.time_span.extend(other.time_span);
        self.weight.extend(other.weight);
        self.sids.extend(other.sids);
        self.clon.extend(other.clon);
        self.clat.extend(other.clat);
        for (param, col) in other.rupture {
            self.rupture.entry(param).or_default().extend(col);
        }
        for (param, col) in other.distances {
            self.distances.entry(param).or_default().extend(col);
        }
        for (param, col) in other.sites {
            self.sites.entry(param).or_default().extend(col);
        }
        Ok(())
    }

    /// Rebuild the contexts, validated against `req`
    pub fn to_contexts(&self, req: &Requirements) -> Result<Vec<RuptureContext>> {
        self.check()?;
        (0..self.len()).map(|i| self.context(i, req)).collect()
    }

    fn context(&self, i: usize, req: &Requirements) -> Result<RuptureContext> {
        let occurrence = if self.probs_occur[i].is_empty() {
            Occurrence::Rate(self.occurrence_rate[i])
        } else {
            Occurrence::Pmf(self.probs_occur[i].clone().into())
        };
        let tom = PoissonTom::new(self.time_span[i])?;
        let mut builder = RuptureContext::builder(req, self.rup_id[i], self.mag[i], occurrence, tom)
            .src_id(self.src_id[i])
            .weight(self.weight[i])
            .sids(self.sids[i].clone());
        for (&param, col) in &self.rupture {
            builder = builder.rupture_param(param, col[i])?;
        }
        for (&param, col) in &self.distances {
            builder = builder.distance(param, col[i].clone())?;
        }
        for (&param, col) in &self.sites {
            builder = builder.site_param(param, col[i].clone())?;
        }
        if !self.clon[i].is_empty() {
            builder = builder.closest_points(self.clon[i].clone(), self.clat[i].clone());
        }
        builder.build()
    }
}

/// Store key of a magnitude, two decimals
pub fn mag_key(mag: f64) -> String {
    MagKey::new(mag).to_string()
}

// ============================================================================
// 2. RuptureStore trait
// ============================================================================

/// Append-only storage of rupture data grouped by magnitude
pub trait RuptureStore: Send + Sync {
    /// Append rows under a magnitude key
    fn append(&self, mag: &str, data: RupData) -> Result<()>;

    /// Rows stored under a magnitude key
    fn get(&self, mag: &str) -> Result<Option<RupData>>;

    /// Stored magnitude keys, sorted
    fn mags(&self) -> Result<Vec<String>>;

    /// Total number of stored contexts
    fn num_ruptures(&self) -> Result<usize> {
        let mut total = 0;
        for mag in self.mags()? {
            total += self.get(&mag)?.map_or(0, |d| d.len());
        }
        Ok(total)
    }
}

/// Group the contexts by magnitude and append them; returns the number of
/// stored contexts
pub fn store_contexts(store: &dyn RuptureStore, ctxs: &[RuptureContext]) -> Result<usize> {
    let mut by_mag: BTreeMap<String, Vec<&RuptureContext>> = BTreeMap::new();
    for ctx in ctxs {
        by_mag.entry(mag_key(ctx.mag)).or_default().push(ctx);
    }
    for (mag, group) in by_mag {
        store.append(&mag, RupData::from_contexts(group)?)?;
    }
    Ok(ctxs.len())
}

// ============================================================================
// 3. MemoryRuptureStore
// ============================================================================

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryRuptureStore {
    data: RwLock<BTreeMap<String, RupData>>,
}

impl MemoryRuptureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuptureStore for MemoryRuptureStore {
    fn append(&self, mag: &str, data: RupData) -> Result<()> {
        self.data.write().entry(mag.to_string()).or_default().extend(data)
    }

    fn get(&self, mag: &str) -> Result<Option<RupData>> {
        Ok(self.data.read().get(mag).cloned())
    }

    fn mags(&self) -> Result<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }
}

// ============================================================================
// 4. FileRuptureStore
// ============================================================================

/// Current binary format version
const FORMAT_VERSION: u32 = 1;

/// Magic bytes identifying a rupture data file
const MAGIC: &[u8; 4] = b"SRUP";

/// MAGIC (4) + VERSION (4) + HASH (32)
const HEADER_LEN: usize = 40;

const FILE_PREFIX: &str = "rupdata_";
const FILE_SUFFIX: &str = ".bin";

/// One file per magnitude in a directory.
///
/// Format: MAGIC (4 bytes) + VERSION (4 bytes) + HASH (32 bytes) + ZSTD(bincode(data))
#[derive(Debug)]
pub struct FileRuptureStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileRuptureStore {
    /// Open a store in `dir`, creating the directory if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, mag: &str) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{mag}{FILE_SUFFIX}"))
    }

    fn read(&self, path: &Path) -> Result<Option<RupData>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        decode(&bytes).map(Some)
    }
}

impl RuptureStore for FileRuptureStore {
    fn append(&self, mag: &str, data: RupData) -> Result<()> {
        let _guard = self.lock.lock();
        let path = self.path(mag);
        let mut current = self.read(&path)?.unwrap_or_default();
        current.extend(data)?;
        let bytes = encode(&current)?;
        debug!(mag, rows = current.len(), bytes = bytes.len(), "writing rupture data");
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    fn get(&self, mag: &str) -> Result<Option<RupData>> {
        let _guard = self.lock.lock();
        self.read(&self.path(mag))
    }

    fn mags(&self) -> Result<Vec<String>> {
        let mut mags = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(mag) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
            {
                mags.push(mag.to_string());
            }
        }
        mags.sort();
        Ok(mags)
    }
}

/// Serialize rupture data to MAGIC + VERSION + HASH + ZSTD(bincode)
pub fn encode(data: &RupData) -> Result<Vec<u8>> {
    let bincode_bytes = bincode::serialize(data)?;
    let compressed = zstd::encode_all(bincode_bytes.as_slice(), 3)?;
    let hash = blake3::hash(&compressed);

    let mut output = Vec::with_capacity(HEADER_LEN + compressed.len());
    output.extend_from_slice(MAGIC);
    output.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    output.extend_from_slice(hash.as_bytes());
    output.extend_from_slice(&compressed);
    Ok(output)
}

/// Inverse of [`encode`], verifying magic, version and hash
pub fn decode(bytes: &[u8]) -> Result<RupData> {
    if bytes.len() < HEADER_LEN {
        return Err(HazardError::Integrity("file too small to hold rupture data".into()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(HazardError::Integrity("invalid magic bytes".into()));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(HazardError::Integrity(format!(
            "version mismatch: expected {FORMAT_VERSION}, found {version}"
        )));
    }
    let compressed = &bytes[HEADER_LEN..];
    if blake3::hash(compressed).as_bytes() != &bytes[8..HEADER_LEN] {
        return Err(HazardError::Integrity("hash mismatch, file may be corrupted".into()));
    }
    let decompressed = zstd::decode_all(compressed)?;
    Ok(bincode::deserialize(&decompressed)?)
}
