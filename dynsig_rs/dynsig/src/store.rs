//! Persistence seams and an in-memory implementation of all of them.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use crate::basal::{OverrideCommand, ScheduledRateEntry};
use crate::curves::{CurveCategory, CurveRecord};
use crate::meals::RawInput;
use crate::queue::TimedEvent;
use crate::{DerivedSignalRow, DsError, GridTick};

/// Read side of the event log.
///
/// The schedule and override queries return the latest row strictly before
/// `start` (if any) followed by every row in `[start, end)`, ordered by
/// timestamp. Inputs are only returned from `[start, end)`.
pub trait EventSource {
    fn schedules_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<ScheduledRateEntry>, DsError>;

    fn overrides_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<OverrideCommand>, DsError>;

    fn inputs_between(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<RawInput>, DsError>;
}

pub trait SignalSink {
    /// Insert or replace rows by tick. A failed call leaves no row written.
    fn upsert_signals(&mut self, rows: &[DerivedSignalRow]) -> Result<(), DsError>;
}

pub trait CurveRepository {
    fn latest_curve(&self, category: CurveCategory) -> Result<Option<CurveRecord>, DsError>;
    fn insert_curve(&mut self, record: CurveRecord) -> Result<(), DsError>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    schedules: Vec<ScheduledRateEntry>,
    overrides: Vec<OverrideCommand>,
    inputs: Vec<RawInput>,
    curves: Vec<CurveRecord>,
    signals: BTreeMap<GridTick, DerivedSignalRow>,
}

fn insert_ordered<E: TimedEvent>(events: &mut Vec<E>, event: E) {
    let at = event.at();
    let index = events.partition_point(|e| e.at() <= at);
    events.insert(index, event);
}

fn prior_and_range<E: TimedEvent + Clone>(events: &[E], start: NaiveDateTime, end: NaiveDateTime) -> Vec<E> {
    let first = events.partition_point(|e| e.at() < start);
    let last = events.partition_point(|e| e.at() < end).max(first);
    let mut out = Vec::with_capacity(last - first + 1);
    if first > 0 {
        out.push(events[first - 1].clone());
    }
    out.extend_from_slice(&events[first..last]);
    out
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_schedule(&mut self, entry: ScheduledRateEntry) {
        insert_ordered(&mut self.schedules, entry);
    }

    pub fn insert_override(&mut self, command: OverrideCommand) {
        insert_ordered(&mut self.overrides, command);
    }

    pub fn insert_input(&mut self, input: RawInput) {
        insert_ordered(&mut self.inputs, input);
    }

    pub fn curves(&self) -> &[CurveRecord] {
        &self.curves
    }

    pub fn signals(&self) -> impl Iterator<Item = &DerivedSignalRow> {
        self.signals.values()
    }

    pub fn signal(&self, tick: GridTick) -> Option<&DerivedSignalRow> {
        self.signals.get(&tick)
    }
}

impl EventSource for MemoryStore {
    fn schedules_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<ScheduledRateEntry>, DsError> {
        Ok(prior_and_range(&self.schedules, start, end))
    }

    fn overrides_between(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<OverrideCommand>, DsError> {
        Ok(prior_and_range(&self.overrides, start, end))
    }

    fn inputs_between(&self, start: NaiveDateTime, end: NaiveDateTime) -> Result<Vec<RawInput>, DsError> {
        let first = self.inputs.partition_point(|i| i.at < start);
        let last = self.inputs.partition_point(|i| i.at < end).max(first);
        Ok(self.inputs[first..last].to_vec())
    }
}

impl SignalSink for MemoryStore {
    fn upsert_signals(&mut self, rows: &[DerivedSignalRow]) -> Result<(), DsError> {
        let bad = rows.iter().find(|r| {
            !(r.actual_basal_rate.is_finite()
                && r.basal_units.is_finite()
                && r.dynamic_insulin.is_finite()
                && r.dynamic_carbs.is_finite())
        });
        if let Some(row) = bad {
            return Err(DsError::Store(format!("non-finite signal at {}", row.tick)));
        }
        for row in rows {
            self.signals.insert(row.tick, row.clone());
        }
        Ok(())
    }
}

impl CurveRepository for MemoryStore {
    fn latest_curve(&self, category: CurveCategory) -> Result<Option<CurveRecord>, DsError> {
        Ok(self
            .curves
            .iter()
            .filter(|r| r.category == category)
            .max_by_key(|r| r.curated_at)
            .cloned())
    }

    fn insert_curve(&mut self, record: CurveRecord) -> Result<(), DsError> {
        self.curves.push(record);
        Ok(())
    }
}
