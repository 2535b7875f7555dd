//! Reconstruction of actual basal rate and convolution of insulin/carb inputs
//! against action curves, on a fixed 5-minute grid.

use std::fmt;

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod basal;
pub mod convolve;
pub mod curves;
pub mod meals;
pub mod queue;
pub mod store;

pub use basal::{
    clean_commands, BasalReconstructor, BasalSample, OverrideCommand, OverrideKind,
    OverrideState, ScheduledRateEntry,
};
pub use convolve::{
    bucket_inputs, convolve, convolve_batch, dynamic_carbs, DenseInputs, HistoryRing,
    IncrementalConvolver, StreamingSignals,
};
pub use curves::{
    compute_beta_curve, normalize_to_scaled, normalize_to_unit, read_curve_text, reverse,
    to_percent, write_curve_text, ActionCurve, ActionCurveStore, CurveCategory, CurveRecord,
    CurveSet, CurveStats,
};
pub use meals::{categorize_carbs, InputKind, MealCode, RawInput};
pub use queue::{Advance, EventQueueMerger, TimedEvent};
pub use store::{CurveRepository, EventSource, MemoryStore, SignalSink};

/// Width of one grid tick in minutes.
pub const TICK_MINUTES: i64 = 5;
pub const TICKS_PER_HOUR: i64 = 60 / TICK_MINUTES;

#[derive(Error, Debug)]
pub enum DsError {
    #[error("action curve is empty")]
    EmptyCurve,
    #[error("no {0} action curve has been curated")]
    MissingCurve(CurveCategory),
    #[error("curve could not be normalized: {0}")]
    Normalization(String),
    #[error("no basal schedule is in force at {start}")]
    NoSchedule { start: NaiveDateTime },
    #[error("history window has {actual} values but the curve has {expected}")]
    WindowLength { expected: usize, actual: usize },
    #[error("{stream} events are not in timestamp order at {at}")]
    OrderingViolation {
        stream: &'static str,
        at: NaiveDateTime,
    },
    #[error("serialized curve is {len} characters, limit is {max}")]
    CurveTooLong { len: usize, max: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to parse curve text: {0}")]
    CurveParse(String),
    #[error("store failure: {0}")]
    Store(String),
}

/// Acceptance windows for the two curve representations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizationTolerance {
    /// A float curve within this distance of 1.0 is accepted unchanged.
    pub unit_slack: f64,
    /// Required distance from 1.0 after dividing through by the sum.
    pub renormalized_slack: f64,
    pub scaled_total: u32,
    /// Accepted distance of the integer sum from `scaled_total`.
    pub scaled_slack: u32,
}

impl Default for NormalizationTolerance {
    fn default() -> Self {
        Self {
            unit_slack: 1e-4,
            renormalized_slack: 1e-5,
            scaled_total: 100_000,
            scaled_slack: 10,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvolutionMode {
    Batch,
    Incremental,
}

impl Default for ConvolutionMode {
    fn default() -> Self {
        ConvolutionMode::Batch
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub tolerance: NormalizationTolerance,
    pub max_curve_json_len: usize,
    pub meal_window_minutes: i64,
    pub mode: ConvolutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tolerance: NormalizationTolerance::default(),
            max_curve_json_len: 1000,
            meal_window_minutes: 30,
            mode: ConvolutionMode::Batch,
        }
    }
}

/// Widest bolus/carb pairing window accepted, one day.
pub const MAX_MEAL_WINDOW_MINUTES: i64 = 24 * 60;

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), DsError> {
        meal_window(self.meal_window_minutes)?;
        if self.max_curve_json_len == 0 {
            return Err(DsError::InvalidParameter(
                "max_curve_json_len must be > 0".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn meal_window(minutes: i64) -> Result<Duration, DsError> {
    if !(0..=MAX_MEAL_WINDOW_MINUTES).contains(&minutes) {
        return Err(DsError::InvalidParameter(format!(
            "meal window of {} min is outside 0..={}",
            minutes, MAX_MEAL_WINDOW_MINUTES
        )));
    }
    Duration::try_minutes(minutes)
        .ok_or_else(|| DsError::InvalidParameter(format!("meal window of {} min", minutes)))
}

/// A timestamp snapped down to a 5-minute boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GridTick(NaiveDateTime);

impl<'de> Deserialize<'de> for GridTick {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ts = NaiveDateTime::deserialize(deserializer)?;
        let tick = GridTick::floor(ts);
        if tick.0 != ts {
            return Err(serde::de::Error::custom(format!(
                "{} is not on the {}-minute grid",
                ts, TICK_MINUTES
            )));
        }
        Ok(tick)
    }
}

impl GridTick {
    pub fn floor(ts: NaiveDateTime) -> Self {
        let excess = Duration::minutes(i64::from(ts.minute()) % TICK_MINUTES)
            + Duration::seconds(i64::from(ts.second()))
            + Duration::nanoseconds(i64::from(ts.nanosecond()));
        GridTick(ts - excess)
    }

    /// First tick at or after `ts`.
    pub fn ceil(ts: NaiveDateTime) -> Self {
        let floor = Self::floor(ts);
        if floor.0 == ts {
            floor
        } else {
            floor.next()
        }
    }

    pub fn time(&self) -> NaiveDateTime {
        self.0
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn next(self) -> Self {
        self.offset(1)
    }

    pub fn prev(self) -> Self {
        self.offset(-1)
    }

    pub fn offset(self, ticks: i64) -> Self {
        GridTick(self.0 + Duration::minutes(ticks * TICK_MINUTES))
    }

    /// Number of ticks in `[self, end)`; negative when `end` precedes `self`.
    pub fn ticks_until(self, end: GridTick) -> i64 {
        (end.0 - self.0).num_minutes() / TICK_MINUTES
    }

    pub fn range(start: GridTick, end: GridTick) -> impl Iterator<Item = GridTick> {
        let count = start.ticks_until(end).max(0);
        (0..count).map(move |i| start.offset(i))
    }
}

impl fmt::Display for GridTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M"))
    }
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Parse a wall-clock timestamp such as `2024-06-15 23:00` or `2024-06-15T23:00:00`.
pub fn parse_timestamp(token: &str) -> Result<NaiveDateTime, DsError> {
    let trimmed = token.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| DsError::InvalidParameter(format!("unrecognized timestamp '{}'", trimmed)))
}

/// One persisted row of derived signals.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DerivedSignalRow {
    pub tick: GridTick,
    pub actual_basal_rate: f64,
    pub basal_units: f64,
    pub dynamic_insulin: f64,
    pub dynamic_carbs: f64,
    pub notes: String,
}

/// Reconstruct the basal rate for `[start, end)` from the event source.
pub fn reconstruct_basal<S: EventSource + ?Sized>(
    source: &S,
    start: GridTick,
    end: GridTick,
) -> Result<Vec<BasalSample>, DsError> {
    check_range(start, end)?;
    let schedules = source.schedules_between(start.time(), end.time())?;
    let commands = clean_commands(source.overrides_between(start.time(), end.time())?);
    BasalReconstructor::new(schedules, commands, start)?.run_until(end)
}

/// Compute derived rows for `[start, end)`.
///
/// The convolution is primed with the ticks that precede `start` by up to the
/// longest curve length, so any partition of a range computes the same rows as
/// a single pass over it.
pub fn compute_signals<S: EventSource + ?Sized>(
    source: &S,
    curves: &CurveSet,
    start: GridTick,
    end: GridTick,
    config: &EngineConfig,
) -> Result<Vec<DerivedSignalRow>, DsError> {
    check_range(start, end)?;
    let window = meal_window(config.meal_window_minutes)?;
    let priming = curves.longest_len().saturating_sub(1) as i64;
    let prime_start = start.offset(-priming);
    let total = prime_start.ticks_until(end) as usize;
    debug!(
        "computing signals {} .. {} ({} priming ticks)",
        start, end, priming
    );

    let schedules = source.schedules_between(prime_start.time(), end.time())?;
    let basal_start = match schedules.first() {
        Some(first) if first.effective_at > prime_start.time() => {
            GridTick::ceil(first.effective_at)
        }
        Some(_) => prime_start,
        None => return Err(DsError::NoSchedule { start: start.time() }),
    };
    if basal_start > start {
        return Err(DsError::NoSchedule { start: start.time() });
    }
    if basal_start > prime_start {
        warn!(
            "no basal schedule before {}; priming ticks before it carry no basal",
            basal_start
        );
    }
    let commands = clean_commands(source.overrides_between(prime_start.time(), end.time())?);
    let basal = BasalReconstructor::new(schedules, commands, basal_start)?.run_until(end)?;

    let fetch_start = prime_start
        .time()
        .checked_sub_signed(window)
        .ok_or_else(|| DsError::InvalidParameter(format!("meal window before {}", prime_start)))?;
    let fetch_end = end
        .time()
        .checked_add_signed(window)
        .ok_or_else(|| DsError::InvalidParameter(format!("meal window after {}", end)))?;
    let raw = source.inputs_between(fetch_start, fetch_end)?;
    let categorized = categorize_carbs(&raw, config.meal_window_minutes)?;
    let dense = bucket_inputs(&categorized, prime_start, total);

    let basal_offset = prime_start.ticks_until(basal_start) as usize;
    let mut insulin = dense.bolus.clone();
    for (slot, sample) in insulin[basal_offset..].iter_mut().zip(basal.iter()) {
        *slot += sample.units;
    }

    let (dynamic_insulin, dynamic_carb_values) = match config.mode {
        ConvolutionMode::Batch => (
            convolve_batch(&curves.insulin, &insulin)?,
            dynamic_carbs(curves, &dense.carbs)?,
        ),
        ConvolutionMode::Incremental => {
            let mut streaming = StreamingSignals::new(curves);
            let mut di = Vec::with_capacity(total);
            let mut dc = Vec::with_capacity(total);
            for (i, tick) in GridTick::range(prime_start, end).enumerate() {
                let carbs = [dense.carbs[0][i], dense.carbs[1][i], dense.carbs[2][i]];
                let (ins, carb) = streaming.push(tick, insulin[i], carbs)?;
                di.push(ins);
                dc.push(carb);
            }
            (di, dc)
        }
    };

    let mut rows = Vec::with_capacity(total - priming as usize);
    for (i, tick) in GridTick::range(prime_start, end).enumerate() {
        if tick < start {
            continue;
        }
        let sample = &basal[i - basal_offset];
        rows.push(DerivedSignalRow {
            tick,
            actual_basal_rate: sample.actual_rate,
            basal_units: sample.units,
            dynamic_insulin: dynamic_insulin[i],
            dynamic_carbs: dynamic_carb_values[i],
            notes: sample.notes.clone(),
        });
    }
    Ok(rows)
}

/// Compute `[start, end)` and write it to the sink as one batch.
pub fn persist_signals<S, K>(
    source: &S,
    sink: &mut K,
    curves: &CurveSet,
    start: GridTick,
    end: GridTick,
    config: &EngineConfig,
) -> Result<usize, DsError>
where
    S: EventSource + ?Sized,
    K: SignalSink + ?Sized,
{
    let rows = compute_signals(source, curves, start, end, config)?;
    sink.upsert_signals(&rows)?;
    info!("persisted {} ticks from {} to {}", rows.len(), start, end);
    Ok(rows.len())
}

/// Contiguous half-open partitions of `[start, end)`, each at most `chunk_ticks` long.
pub fn split_range(
    start: GridTick,
    end: GridTick,
    chunk_ticks: usize,
) -> Result<Vec<(GridTick, GridTick)>, DsError> {
    check_range(start, end)?;
    if chunk_ticks == 0 {
        return Err(DsError::InvalidParameter("chunk size must be > 0".into()));
    }
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor.offset(chunk_ticks as i64).min(end);
        out.push((cursor, next));
        cursor = next;
    }
    Ok(out)
}

fn check_range(start: GridTick, end: GridTick) -> Result<(), DsError> {
    if end <= start {
        return Err(DsError::InvalidParameter(format!(
            "empty tick range {} .. {}",
            start, end
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{at, curve_set, tick};
    use super::*;
    use chrono::NaiveDate;

    fn yesterday(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 14)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid test time")
    }

    fn sample_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        let mut rates = [0.8; 24];
        rates[1] = 1.2;
        store.insert_schedule(ScheduledRateEntry::new(yesterday(0, 0), rates));
        store.insert_override(OverrideCommand::cancel(yesterday(22, 0)));
        store.insert_override(OverrideCommand::temporary_rate(at(0, 10), 40.0, 60));
        store.insert_override(OverrideCommand::suspend(at(2, 3)));
        store.insert_override(OverrideCommand::cancel(at(2, 30)));
        store.insert_input(RawInput::bolus(at(0, 20), 3.0));
        store.insert_input(RawInput::carbs(at(0, 25), 40.0, None));
        store.insert_input(RawInput::carbs(at(1, 40), 15.0, None));
        store.insert_input(RawInput::carbs(at(3, 0), 30.0, Some(MealCode::Dinner)));
        store
    }

    fn sample_curves() -> CurveSet {
        curve_set(
            &[0.1, 0.2, 0.3, 0.2, 0.1, 0.05, 0.05],
            &[0.3, 0.4, 0.2, 0.1],
            &[0.2, 0.3, 0.4, 0.05, 0.05],
            &[0.1, 0.2, 0.3, 0.2, 0.1, 0.05, 0.05],
        )
    }

    #[test]
    fn test_grid_tick_floor_and_ceil() {
        let ts = at(0, 7) + Duration::seconds(42);
        assert_eq!(GridTick::floor(ts).time(), at(0, 5));
        assert_eq!(GridTick::ceil(ts).time(), at(0, 10));
        assert_eq!(GridTick::ceil(at(0, 10)).time(), at(0, 10));
        assert_eq!(tick(0, 55).next().time(), at(1, 0));
        assert_eq!(tick(0, 0).ticks_until(tick(1, 0)), 12);
        assert_eq!(GridTick::range(tick(0, 0), tick(0, 15)).count(), 3);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2024-06-15 00:10").unwrap(), at(0, 10));
        assert_eq!(parse_timestamp("2024-06-15T00:10:00").unwrap(), at(0, 10));
        assert!(matches!(
            parse_timestamp("15/06/2024"),
            Err(DsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_end_to_end_basal_scenario() {
        let mut store = MemoryStore::new();
        store.insert_schedule(ScheduledRateEntry::flat(at(0, 0), 1.0));
        store.insert_override(OverrideCommand::temporary_rate(at(0, 10), 40.0, 60));
        store.insert_override(OverrideCommand::cancel(at(1, 0)));
        let samples = reconstruct_basal(&store, tick(0, 0), tick(1, 30)).unwrap();
        for sample in &samples {
            let minutes = tick(0, 0).ticks_until(sample.tick) * TICK_MINUTES;
            let expected = if (10..60).contains(&minutes) { 0.4 } else { 1.0 };
            assert!(
                (sample.actual_rate - expected).abs() < 1e-12,
                "{} -> {}",
                sample.tick,
                sample.actual_rate
            );
        }
    }

    #[test]
    fn test_compute_signals_is_deterministic() {
        let store = sample_store();
        let curves = sample_curves();
        let config = EngineConfig::default();
        let first = compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &config).unwrap();
        let second = compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 48);
    }

    #[test]
    fn test_partitioned_ranges_match_single_pass() {
        let store = sample_store();
        let curves = sample_curves();
        let config = EngineConfig::default();
        let whole = compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &config).unwrap();
        let mut pieces = Vec::new();
        for (s, e) in split_range(tick(0, 0), tick(4, 0), 7).unwrap() {
            pieces.extend(compute_signals(&store, &curves, s, e, &config).unwrap());
        }
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_incremental_mode_matches_batch() {
        let store = sample_store();
        let curves = sample_curves();
        let batch = compute_signals(
            &store,
            &curves,
            tick(0, 0),
            tick(4, 0),
            &EngineConfig::default(),
        )
        .unwrap();
        let incremental_config = EngineConfig {
            mode: ConvolutionMode::Incremental,
            ..EngineConfig::default()
        };
        let incremental =
            compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &incremental_config).unwrap();
        assert_eq!(batch, incremental);
    }

    #[test]
    fn test_bolus_and_basal_feed_dynamic_insulin() {
        let store = sample_store();
        let curves = sample_curves();
        let rows =
            compute_signals(&store, &curves, tick(0, 0), tick(1, 0), &EngineConfig::default())
                .unwrap();
        // The newest tick is weighted by the first curve value.
        let row = rows.iter().find(|r| r.tick == tick(0, 20)).unwrap();
        let basal_part = row.dynamic_insulin - 3.0 * 0.1;
        assert!(basal_part > 0.32 / 12.0 - 1e-12);
        assert!(basal_part < 0.8 / 12.0 + 1e-12);
        assert!((row.actual_basal_rate - 0.32).abs() < 1e-12);
    }

    #[test]
    fn test_carbs_with_bolus_are_meals() {
        let store = sample_store();
        let curves = sample_curves();
        let rows =
            compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &EngineConfig::default())
                .unwrap();
        // 40 g at 0:25 sits next to the 0:20 bolus: a before-6 meal on the brunch curve.
        let meal = rows.iter().find(|r| r.tick == tick(0, 25)).unwrap();
        assert!((meal.dynamic_carbs - 40.0 * 0.2).abs() < 1e-9);
        // 15 g at 1:40 has no bolus nearby, so it is rescue carbs.
        let rescue = rows.iter().find(|r| r.tick == tick(1, 40)).unwrap();
        assert!((rescue.dynamic_carbs - 15.0 * 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_missing_schedule_is_fatal() {
        let mut store = MemoryStore::new();
        store.insert_schedule(ScheduledRateEntry::flat(at(2, 0), 1.0));
        let curves = sample_curves();
        let err = compute_signals(&store, &curves, tick(0, 0), tick(4, 0), &EngineConfig::default())
            .unwrap_err();
        assert!(matches!(err, DsError::NoSchedule { .. }));
    }

    #[test]
    fn test_oversized_meal_window_is_rejected() {
        let store = sample_store();
        let curves = sample_curves();
        let config = EngineConfig {
            meal_window_minutes: i64::MAX / 2,
            ..EngineConfig::default()
        };
        let err = compute_signals(&store, &curves, tick(0, 0), tick(0, 10), &config).unwrap_err();
        assert!(matches!(err, DsError::InvalidParameter(_)));
        assert!(config.validate().is_err());

        let negative = EngineConfig {
            meal_window_minutes: -1,
            ..EngineConfig::default()
        };
        assert!(negative.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_schedule_inside_priming_window_is_accepted() {
        let mut store = MemoryStore::new();
        store.insert_schedule(ScheduledRateEntry::flat(at(0, 0), 1.0));
        let curves = sample_curves();
        let rows = compute_signals(&store, &curves, tick(0, 10), tick(0, 30), &EngineConfig::default())
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| (r.actual_basal_rate - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_persist_signals_is_idempotent() {
        let store = sample_store();
        let curves = sample_curves();
        let config = EngineConfig::default();
        let mut sink = MemoryStore::new();
        persist_signals(&store, &mut sink, &curves, tick(0, 0), tick(2, 0), &config).unwrap();
        let first: Vec<_> = sink.signals().cloned().collect();
        persist_signals(&store, &mut sink, &curves, tick(0, 0), tick(2, 0), &config).unwrap();
        let second: Vec<_> = sink.signals().cloned().collect();
        assert_eq!(first, second);
        assert_eq!(second.len(), 24);
    }

    #[test]
    fn test_split_range_rejects_bad_input() {
        assert!(split_range(tick(1, 0), tick(0, 0), 4).is_err());
        assert!(split_range(tick(0, 0), tick(1, 0), 0).is_err());
        let parts = split_range(tick(0, 0), tick(1, 0), 5).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], (tick(0, 50), tick(1, 0)));
    }

    #[test]
    fn test_grid_tick_deserializes_only_on_grid() {
        let ok: GridTick = serde_json::from_str(r#""2024-06-15T00:10:00""#).unwrap();
        assert_eq!(ok, tick(0, 10));
        assert_eq!(serde_json::to_string(&ok).unwrap(), r#""2024-06-15T00:10:00""#);
        assert!(serde_json::from_str::<GridTick>(r#""2024-06-15T00:12:00""#).is_err());
        assert!(serde_json::from_str::<GridTick>(r#""2024-06-15T00:10:30""#).is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let json = r#"{"tolerance": {"scaled_slack": 5}, "mode": "incremental"}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.tolerance.scaled_slack, 5);
        assert_eq!(config.tolerance.unit_slack, 1e-4);
        assert_eq!(config.mode, ConvolutionMode::Incremental);
        assert_eq!(config.max_curve_json_len, 1000);
    }
}
