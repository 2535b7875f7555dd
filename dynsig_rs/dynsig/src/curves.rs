use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDateTime;
use ndarray::{Array1, ArrayView1};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::store::CurveRepository;
use crate::{DsError, EngineConfig, NormalizationTolerance, TICK_MINUTES};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum CurveCategory {
    Insulin,
    Rescue,
    Brunch,
    Dinner,
}

impl CurveCategory {
    pub const ALL: [CurveCategory; 4] = [
        CurveCategory::Insulin,
        CurveCategory::Rescue,
        CurveCategory::Brunch,
        CurveCategory::Dinner,
    ];

    /// Carb categories in the order their contributions are summed.
    pub const CARBS: [CurveCategory; 3] = [
        CurveCategory::Rescue,
        CurveCategory::Brunch,
        CurveCategory::Dinner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CurveCategory::Insulin => "insulin",
            CurveCategory::Rescue => "rescue",
            CurveCategory::Brunch => "brunch",
            CurveCategory::Dinner => "dinner",
        }
    }

    pub(crate) fn carb_slot(&self) -> Option<usize> {
        CurveCategory::CARBS.iter().position(|c| c == self)
    }
}

impl fmt::Display for CurveCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurveCategory {
    type Err = DsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CurveCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| DsError::InvalidParameter(format!("unknown curve category '{}'", s)))
    }
}

fn check_values(seq: &[f64]) -> Result<(), DsError> {
    if seq.is_empty() {
        return Err(DsError::EmptyCurve);
    }
    if let Some(bad) = seq.iter().find(|v| !v.is_finite() || **v < 0.0) {
        return Err(DsError::Normalization(format!(
            "weight {} is not a finite non-negative number",
            bad
        )));
    }
    Ok(())
}

/// Return weights summing to 1.0, renormalizing when the sum is off by more
/// than `unit_slack`.
pub fn normalize_to_unit(seq: &[f64], tol: &NormalizationTolerance) -> Result<Vec<f64>, DsError> {
    check_values(seq)?;
    let total: f64 = seq.iter().sum();
    if (total - 1.0).abs() <= tol.unit_slack {
        return Ok(seq.to_vec());
    }
    if total <= 0.0 {
        return Err(DsError::Normalization(format!("weights sum to {}", total)));
    }
    let out: Vec<f64> = seq.iter().map(|v| v / total).collect();
    let check: f64 = out.iter().sum();
    if (check - 1.0).abs() > tol.renormalized_slack {
        return Err(DsError::Normalization(format!(
            "renormalized weights sum to {}",
            check
        )));
    }
    Ok(out)
}

/// Return integer weights summing to `scaled_total` within `scaled_slack`.
pub fn normalize_to_scaled(seq: &[f64], tol: &NormalizationTolerance) -> Result<Vec<u32>, DsError> {
    check_values(seq)?;
    let target = f64::from(tol.scaled_total);
    let slack = f64::from(tol.scaled_slack);
    let total: f64 = seq.iter().sum();
    if (total - target).abs() <= slack && seq.iter().all(|v| v.fract() == 0.0) {
        return Ok(seq.iter().map(|v| *v as u32).collect());
    }
    if total <= 0.0 {
        return Err(DsError::Normalization(format!("weights sum to {}", total)));
    }
    let out: Vec<u32> = seq
        .iter()
        .map(|v| (target * v / total).round() as u32)
        .collect();
    let check: u64 = out.iter().map(|v| u64::from(*v)).sum();
    if (check as f64 - target).abs() > slack {
        return Err(DsError::Normalization(format!(
            "scaled weights sum to {}, expected {} +/- {}",
            check, tol.scaled_total, tol.scaled_slack
        )));
    }
    Ok(out)
}

/// Convert stored integer weights back to fractions of 1.0.
pub fn to_percent(seq: &[u32], tol: &NormalizationTolerance) -> Result<Vec<f64>, DsError> {
    let floats: Vec<f64> = seq.iter().map(|v| f64::from(*v)).collect();
    normalize_to_unit(&floats, tol)
}

pub fn reverse(seq: &[f64]) -> Vec<f64> {
    seq.iter().rev().copied().collect()
}

/// Sample `t^a * (1-t)^b` at `t = n / length` and normalize.
pub fn compute_beta_curve(
    a: f64,
    b: f64,
    length: usize,
    tol: &NormalizationTolerance,
) -> Result<Vec<f64>, DsError> {
    if length == 0 {
        return Err(DsError::EmptyCurve);
    }
    if !(a.is_finite() && b.is_finite()) || a < 0.0 || b < 0.0 {
        return Err(DsError::InvalidParameter(format!(
            "beta shape parameters must be finite and >= 0 (a={}, b={})",
            a, b
        )));
    }
    let n = length as f64;
    let values: Vec<f64> = (0..length)
        .map(|i| {
            let t = i as f64 / n;
            t.powf(a) * (1.0 - t).powf(b)
        })
        .collect();
    normalize_to_unit(&values, tol)
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
pub struct CurveStats {
    pub peak: f64,
    pub peak_offset_minutes: i64,
    pub duration_minutes: i64,
}

impl CurveStats {
    pub fn of(weights: &[f64]) -> Option<Self> {
        let (index, peak) = weights
            .iter()
            .enumerate()
            .max_by_key(|(i, w)| (OrderedFloat(**w), Reverse(*i)))?;
        Some(Self {
            peak: *peak,
            peak_offset_minutes: index as i64 * TICK_MINUTES,
            duration_minutes: weights.len() as i64 * TICK_MINUTES,
        })
    }
}

/// A normalized curve, held both oldest-first and reversed for dot products.
#[derive(Clone, Debug)]
pub struct ActionCurve {
    category: CurveCategory,
    weights: Array1<f64>,
    reversed: Array1<f64>,
}

impl ActionCurve {
    pub fn new(
        category: CurveCategory,
        weights: &[f64],
        tol: &NormalizationTolerance,
    ) -> Result<Self, DsError> {
        let normalized = normalize_to_unit(weights, tol)?;
        let reversed = Array1::from(reverse(&normalized));
        Ok(Self {
            category,
            weights: Array1::from(normalized),
            reversed,
        })
    }

    pub fn from_record(record: &CurveRecord, tol: &NormalizationTolerance) -> Result<Self, DsError> {
        let fractions = to_percent(&record.weights, tol)?;
        Self::new(record.category, &fractions, tol)
    }

    pub fn category(&self) -> CurveCategory {
        self.category
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> ArrayView1<'_, f64> {
        self.weights.view()
    }

    pub fn reversed(&self) -> ArrayView1<'_, f64> {
        self.reversed.view()
    }

    pub fn stats(&self) -> CurveStats {
        // Construction rejects empty curves, so the fallback is never taken.
        CurveStats::of(self.weights.as_slice().unwrap_or(&[])).unwrap_or(CurveStats {
            peak: 0.0,
            peak_offset_minutes: 0,
            duration_minutes: 0,
        })
    }
}

/// A stored curve version: integer weights summing to `scaled_total`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CurveRecord {
    pub category: CurveCategory,
    pub curated_at: NaiveDateTime,
    pub weights: Vec<u32>,
    #[serde(default)]
    pub notes: String,
}

impl CurveRecord {
    /// Scale `weights` to integers and check the serialized length.
    pub fn curate(
        category: CurveCategory,
        curated_at: NaiveDateTime,
        weights: &[f64],
        notes: impl Into<String>,
        config: &EngineConfig,
    ) -> Result<Self, DsError> {
        let scaled = normalize_to_scaled(weights, &config.tolerance)?;
        let json = serde_json::to_string(&scaled).map_err(|e| DsError::Store(e.to_string()))?;
        if json.len() > config.max_curve_json_len {
            return Err(DsError::CurveTooLong {
                len: json.len(),
                max: config.max_curve_json_len,
            });
        }
        Ok(Self {
            category,
            curated_at,
            weights: scaled,
            notes: notes.into(),
        })
    }

    /// Hex SHA-256 of the weight list as stored.
    pub fn fingerprint(&self) -> String {
        let mut bytes = Vec::with_capacity(self.weights.len() * 4);
        for w in &self.weights {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        sha256_hex(&bytes)
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

/// The four curves one computation uses.
#[derive(Clone, Debug)]
pub struct CurveSet {
    pub insulin: Arc<ActionCurve>,
    pub rescue: Arc<ActionCurve>,
    pub brunch: Arc<ActionCurve>,
    pub dinner: Arc<ActionCurve>,
}

impl CurveSet {
    pub fn new(
        insulin: Arc<ActionCurve>,
        rescue: Arc<ActionCurve>,
        brunch: Arc<ActionCurve>,
        dinner: Arc<ActionCurve>,
    ) -> Result<Self, DsError> {
        let set = Self {
            insulin,
            rescue,
            brunch,
            dinner,
        };
        for category in CurveCategory::ALL {
            let held = set.get(category).category();
            if held != category {
                return Err(DsError::InvalidParameter(format!(
                    "{} curve supplied in the {} slot",
                    held, category
                )));
            }
        }
        Ok(set)
    }

    pub fn get(&self, category: CurveCategory) -> &ActionCurve {
        match category {
            CurveCategory::Insulin => &self.insulin,
            CurveCategory::Rescue => &self.rescue,
            CurveCategory::Brunch => &self.brunch,
            CurveCategory::Dinner => &self.dinner,
        }
    }

    pub fn carbs(&self) -> [&ActionCurve; 3] {
        [&self.rescue, &self.brunch, &self.dinner]
    }

    pub fn longest_len(&self) -> usize {
        CurveCategory::ALL
            .iter()
            .map(|c| self.get(*c).len())
            .max()
            .unwrap_or(0)
    }
}

struct CachedCurve {
    curve: Arc<ActionCurve>,
    fingerprint: String,
}

/// Serves the latest curated curve per category, cached until reloaded.
///
/// Curating a new version does not touch the cache; callers pick it up with
/// [`ActionCurveStore::reload`].
pub struct ActionCurveStore<R> {
    repository: R,
    tolerance: NormalizationTolerance,
    cache: HashMap<CurveCategory, CachedCurve>,
}

impl<R: CurveRepository> ActionCurveStore<R> {
    pub fn new(repository: R, tolerance: NormalizationTolerance) -> Self {
        Self {
            repository,
            tolerance,
            cache: HashMap::new(),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    pub fn is_cached(&self, category: CurveCategory) -> bool {
        self.cache.contains_key(&category)
    }

    pub fn load(&mut self, category: CurveCategory) -> Result<Arc<ActionCurve>, DsError> {
        if let Some(cached) = self.cache.get(&category) {
            return Ok(Arc::clone(&cached.curve));
        }
        let record = self
            .repository
            .latest_curve(category)?
            .ok_or(DsError::MissingCurve(category))?;
        let curve = Arc::new(ActionCurve::from_record(&record, &self.tolerance)?);
        let stats = curve.stats();
        info!(
            "Loaded {} curve curated {}: {} ticks, peak {:.4} at {} min, lasts {} min",
            category,
            record.curated_at,
            curve.len(),
            stats.peak,
            stats.peak_offset_minutes,
            stats.duration_minutes
        );
        self.cache.insert(
            category,
            CachedCurve {
                curve: Arc::clone(&curve),
                fingerprint: record.fingerprint(),
            },
        );
        Ok(curve)
    }

    pub fn load_all(&mut self) -> Result<CurveSet, DsError> {
        CurveSet::new(
            self.load(CurveCategory::Insulin)?,
            self.load(CurveCategory::Rescue)?,
            self.load(CurveCategory::Brunch)?,
            self.load(CurveCategory::Dinner)?,
        )
    }

    pub fn curate(&mut self, record: CurveRecord) -> Result<(), DsError> {
        debug!(
            "curating {} curve of {} ticks at {}",
            record.category,
            record.weights.len(),
            record.curated_at
        );
        self.repository.insert_curve(record)
    }

    pub fn reload(&mut self) {
        self.cache.clear();
    }

    pub fn reload_category(&mut self, category: CurveCategory) {
        self.cache.remove(&category);
    }

    /// True when the repository holds a different latest curve than the cached one.
    pub fn is_stale(&self, category: CurveCategory) -> Result<bool, DsError> {
        let Some(cached) = self.cache.get(&category) else {
            return Ok(false);
        };
        let latest = self.repository.latest_curve(category)?;
        Ok(latest.map_or(true, |r| r.fingerprint() != cached.fingerprint))
    }
}

/// Read one weight per line from the first column, skipping `skip_lines` leading lines.
pub fn read_curve_text<R: Read>(
    reader: R,
    skip_lines: usize,
    tol: &NormalizationTolerance,
) -> Result<Vec<f64>, DsError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut values = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| DsError::CurveParse(e.to_string()))?;
        if line < skip_lines {
            continue;
        }
        let field = record.get(0).map(str::trim).unwrap_or("");
        if field.is_empty() {
            continue;
        }
        let value: f64 = field.parse().map_err(|_| {
            DsError::CurveParse(format!("line {}: '{}' is not a number", line + 1, field))
        })?;
        values.push(value);
    }
    normalize_to_unit(&values, tol)
}

/// Write the curve as integer weights, one per line.
pub fn write_curve_text<W: Write>(
    writer: W,
    weights: &[f64],
    tol: &NormalizationTolerance,
) -> Result<(), DsError> {
    let scaled = normalize_to_scaled(weights, tol)?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    for value in scaled {
        wtr.write_record([value.to_string()])
            .map_err(|e| DsError::Store(e.to_string()))?;
    }
    wtr.flush().map_err(|e| DsError::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_support::at;

    fn tol() -> NormalizationTolerance {
        NormalizationTolerance::default()
    }

    fn record(category: CurveCategory, weights: &[f64], hour: u32) -> CurveRecord {
        CurveRecord::curate(category, at(hour, 0), weights, "", &EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_normalize_to_unit_is_idempotent() {
        let once = normalize_to_unit(&[2.0, 3.0, 5.0], &tol()).unwrap();
        assert!((once.iter().sum::<f64>() - 1.0).abs() <= 1e-5);
        let twice = normalize_to_unit(&once, &tol()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_rejects_empty_and_zero() {
        assert!(matches!(normalize_to_unit(&[], &tol()), Err(DsError::EmptyCurve)));
        assert!(matches!(
            normalize_to_unit(&[0.0, 0.0], &tol()),
            Err(DsError::Normalization(_))
        ));
        assert!(matches!(
            normalize_to_scaled(&[1.0, -1.0, 2.0], &tol()),
            Err(DsError::Normalization(_))
        ));
    }

    #[test]
    fn test_scaled_accepts_integer_curves_within_slack() {
        let curve = [50_000.0, 30_000.0, 20_005.0];
        assert_eq!(
            normalize_to_scaled(&curve, &tol()).unwrap(),
            vec![50_000, 30_000, 20_005]
        );
    }

    #[test]
    fn test_scaled_round_trip_is_close() {
        let curve = compute_beta_curve(2.0, 5.0, 40, &tol()).unwrap();
        let scaled = normalize_to_scaled(&curve, &tol()).unwrap();
        let total: u32 = scaled.iter().sum();
        assert!((99_990..=100_010).contains(&total));
        let back = to_percent(&scaled, &tol()).unwrap();
        for (a, b) in curve.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1e-3);
        }
    }

    #[test]
    fn test_reverse_twice_is_identity() {
        let curve = [0.1, 0.4, 0.3, 0.2];
        assert_eq!(reverse(&reverse(&curve)), curve.to_vec());
        let action = ActionCurve::new(CurveCategory::Insulin, &curve, &tol()).unwrap();
        assert_eq!(action.reversed().to_vec(), reverse(&curve));
    }

    #[test]
    fn test_beta_curve_shape() {
        let curve = compute_beta_curve(2.0, 6.0, 36, &tol()).unwrap();
        assert_eq!(curve.len(), 36);
        assert_eq!(curve[0], 0.0);
        let stats = CurveStats::of(&curve).unwrap();
        // Mode of t^2 (1-t)^6 is at t = 0.25.
        assert_eq!(stats.peak_offset_minutes, 9 * TICK_MINUTES);
        assert_eq!(stats.duration_minutes, 180);
        assert!(compute_beta_curve(-1.0, 2.0, 10, &tol()).is_err());
        assert!(matches!(
            compute_beta_curve(1.0, 1.0, 0, &tol()),
            Err(DsError::EmptyCurve)
        ));
    }

    #[test]
    fn test_stats_takes_first_peak() {
        let stats = CurveStats::of(&[0.1, 0.4, 0.1, 0.4]).unwrap();
        assert_eq!(stats.peak_offset_minutes, 5);
        assert_eq!(stats.peak, 0.4);
    }

    #[test]
    fn test_curate_rejects_long_curves() {
        let config = EngineConfig {
            max_curve_json_len: 30,
            ..EngineConfig::default()
        };
        let weights = vec![1.0; 20];
        let err = CurveRecord::curate(CurveCategory::Rescue, at(0, 0), &weights, "", &config)
            .unwrap_err();
        assert!(matches!(err, DsError::CurveTooLong { max: 30, .. }));
    }

    #[test]
    fn test_store_reports_missing_curve() {
        let mut store = ActionCurveStore::new(MemoryStore::new(), tol());
        let err = store.load(CurveCategory::Dinner).unwrap_err();
        assert!(matches!(err, DsError::MissingCurve(CurveCategory::Dinner)));
    }

    #[test]
    fn test_store_cache_refreshes_only_on_reload() {
        let mut store = ActionCurveStore::new(MemoryStore::new(), tol());
        store
            .curate(record(CurveCategory::Insulin, &[0.5, 0.3, 0.2], 1))
            .unwrap();
        let first = store.load(CurveCategory::Insulin).unwrap();
        assert_eq!(first.len(), 3);
        assert!(!store.is_stale(CurveCategory::Insulin).unwrap());

        store
            .curate(record(CurveCategory::Insulin, &[0.25, 0.25, 0.25, 0.25], 2))
            .unwrap();
        assert!(store.is_stale(CurveCategory::Insulin).unwrap());
        assert_eq!(store.load(CurveCategory::Insulin).unwrap().len(), 3);

        store.reload_category(CurveCategory::Insulin);
        assert_eq!(store.load(CurveCategory::Insulin).unwrap().len(), 4);
        assert!(!store.is_stale(CurveCategory::Insulin).unwrap());
    }

    #[test]
    fn test_load_all_needs_every_category() {
        let mut store = ActionCurveStore::new(MemoryStore::new(), tol());
        for category in [CurveCategory::Insulin, CurveCategory::Rescue, CurveCategory::Brunch] {
            store.curate(record(category, &[0.6, 0.4], 0)).unwrap();
        }
        assert!(matches!(
            store.load_all(),
            Err(DsError::MissingCurve(CurveCategory::Dinner))
        ));
        store
            .curate(record(CurveCategory::Dinner, &[0.2, 0.3, 0.5], 0))
            .unwrap();
        store.reload();
        let set = store.load_all().unwrap();
        assert_eq!(set.longest_len(), 3);
        assert_eq!(set.get(CurveCategory::Dinner).category(), CurveCategory::Dinner);
    }

    #[test]
    fn test_curve_text_round_trip() {
        let text = "weights\n# exported\n25\n50\n\n25\n";
        let curve = read_curve_text(text.as_bytes(), 2, &tol()).unwrap();
        assert_eq!(curve, vec![0.25, 0.5, 0.25]);

        let mut out = Vec::new();
        write_curve_text(&mut out, &curve, &tol()).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "25000\n50000\n25000\n");

        let err = read_curve_text("1\nx\n".as_bytes(), 0, &tol()).unwrap_err();
        assert!(matches!(err, DsError::CurveParse(_)));
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("Dinner".parse::<CurveCategory>().unwrap(), CurveCategory::Dinner);
        assert!("lunch".parse::<CurveCategory>().is_err());
    }
}
