//! Actual basal rate per tick from programmed schedules and override commands.

use chrono::{Duration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::queue::{EventQueueMerger, TimedEvent};
use crate::{DsError, GridTick, TICKS_PER_HOUR};

/// A 24-entry hourly rate table (units/hour) effective from `effective_at`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScheduledRateEntry {
    pub effective_at: NaiveDateTime,
    pub hourly_rates: [f64; 24],
}

impl ScheduledRateEntry {
    pub fn new(effective_at: NaiveDateTime, hourly_rates: [f64; 24]) -> Self {
        Self {
            effective_at,
            hourly_rates,
        }
    }

    pub fn flat(effective_at: NaiveDateTime, rate: f64) -> Self {
        Self::new(effective_at, [rate; 24])
    }

    pub fn rate_at_hour(&self, hour: u32) -> f64 {
        self.hourly_rates[(hour % 24) as usize]
    }
}

impl TimedEvent for ScheduledRateEntry {
    fn at(&self) -> NaiveDateTime {
        self.effective_at
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideKind {
    Suspend,
    TemporaryRate {
        /// Percent of the programmed rate.
        ratio: f64,
        duration_minutes: i64,
    },
    CancelTemporaryRate,
}

impl OverrideKind {
    pub fn name(&self) -> &'static str {
        match self {
            OverrideKind::Suspend => "suspend",
            OverrideKind::TemporaryRate { .. } => "temporary_rate",
            OverrideKind::CancelTemporaryRate => "cancel_temporary_rate",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct OverrideCommand {
    pub at: NaiveDateTime,
    #[serde(flatten)]
    pub kind: OverrideKind,
}

impl OverrideCommand {
    pub fn suspend(at: NaiveDateTime) -> Self {
        Self {
            at,
            kind: OverrideKind::Suspend,
        }
    }

    pub fn temporary_rate(at: NaiveDateTime, ratio: f64, duration_minutes: i64) -> Self {
        Self {
            at,
            kind: OverrideKind::TemporaryRate {
                ratio,
                duration_minutes,
            },
        }
    }

    pub fn cancel(at: NaiveDateTime) -> Self {
        Self {
            at,
            kind: OverrideKind::CancelTemporaryRate,
        }
    }

    /// Build a command from flat columns as they appear in exported pump logs.
    pub fn from_parts(
        at: NaiveDateTime,
        kind: &str,
        ratio: Option<f64>,
        duration_minutes: Option<i64>,
    ) -> Result<Self, DsError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "suspend" => Ok(Self::suspend(at)),
            "cancel_temporary_rate" | "cancel_temporary_basal" | "cancel" => Ok(Self::cancel(at)),
            "temporary_rate" | "temporary_basal" => {
                let ratio = ratio.ok_or_else(|| {
                    DsError::InvalidParameter(format!("temporary rate at {} has no ratio", at))
                })?;
                let duration = duration_minutes.ok_or_else(|| {
                    DsError::InvalidParameter(format!("temporary rate at {} has no duration", at))
                })?;
                Ok(Self::temporary_rate(at, ratio, duration))
            }
            other => Err(DsError::InvalidParameter(format!(
                "unknown override kind '{}'",
                other
            ))),
        }
    }

    fn validate(&self) -> Result<(), DsError> {
        if let OverrideKind::TemporaryRate {
            ratio,
            duration_minutes,
        } = self.kind
        {
            if !ratio.is_finite() || ratio < 0.0 {
                return Err(DsError::InvalidParameter(format!(
                    "temporary rate at {} has ratio {}",
                    self.at, ratio
                )));
            }
            if duration_minutes <= 0 {
                return Err(DsError::InvalidParameter(format!(
                    "temporary rate at {} has duration {} min",
                    self.at, duration_minutes
                )));
            }
            expiry(self.at, duration_minutes).ok_or_else(|| {
                DsError::InvalidParameter(format!(
                    "temporary rate at {} with duration {} min ends out of range",
                    self.at, duration_minutes
                ))
            })?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match self.kind {
            OverrideKind::Suspend => "suspended".to_string(),
            OverrideKind::TemporaryRate {
                ratio,
                duration_minutes,
            } => format!("temporary rate {}% for {} min", ratio, duration_minutes),
            OverrideKind::CancelTemporaryRate => "override cancelled".to_string(),
        }
    }
}

fn expiry(at: NaiveDateTime, duration_minutes: i64) -> Option<NaiveDateTime> {
    Duration::try_minutes(duration_minutes).and_then(|d| at.checked_add_signed(d))
}

impl TimedEvent for OverrideCommand {
    fn at(&self) -> NaiveDateTime {
        self.at
    }
}

/// Drop exact repeats and any cancel immediately followed by a temporary
/// rate at the same timestamp.
pub fn clean_commands(commands: Vec<OverrideCommand>) -> Vec<OverrideCommand> {
    let mut out: Vec<OverrideCommand> = Vec::with_capacity(commands.len());
    for command in commands {
        if let Some(prev) = out.last() {
            if *prev == command {
                continue;
            }
            if prev.at == command.at
                && prev.kind == OverrideKind::CancelTemporaryRate
                && matches!(command.kind, OverrideKind::TemporaryRate { .. })
            {
                out.pop();
            }
        }
        out.push(command);
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OverrideState {
    Off,
    Suspended,
    Temporary {
        factor: f64,
        expires_at: NaiveDateTime,
    },
}

impl OverrideState {
    pub fn factor(&self) -> f64 {
        match self {
            OverrideState::Off => 1.0,
            OverrideState::Suspended => 0.0,
            OverrideState::Temporary { factor, .. } => *factor,
        }
    }

    fn after(command: &OverrideCommand) -> Self {
        match command.kind {
            OverrideKind::Suspend => OverrideState::Suspended,
            OverrideKind::TemporaryRate {
                ratio,
                duration_minutes,
            } => OverrideState::Temporary {
                factor: ratio / 100.0,
                // Checked in `validate`.
                expires_at: expiry(command.at, duration_minutes).unwrap_or(NaiveDateTime::MAX),
            },
            OverrideKind::CancelTemporaryRate => OverrideState::Off,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BasalSample {
    pub tick: GridTick,
    pub programmed_rate: f64,
    pub factor: f64,
    pub actual_rate: f64,
    /// Units delivered over this tick.
    pub units: f64,
    pub notes: String,
}

/// Steps tick by tick through a schedule stream and an override stream.
///
/// Notes on a sample only mention transitions whose own timestamp rounds up
/// to that tick, so the same tick gets the same notes whichever tick the
/// reconstruction started from.
pub struct BasalReconstructor {
    schedule: EventQueueMerger<ScheduledRateEntry>,
    overrides: EventQueueMerger<OverrideCommand>,
    state: OverrideState,
    programmed_rate: f64,
    last_hour: Option<u32>,
    next_tick: GridTick,
}

impl BasalReconstructor {
    pub fn new(
        schedules: Vec<ScheduledRateEntry>,
        commands: Vec<OverrideCommand>,
        start: GridTick,
    ) -> Result<Self, DsError> {
        if schedules
            .first()
            .map_or(true, |s| s.effective_at > start.time())
        {
            return Err(DsError::NoSchedule { start: start.time() });
        }
        for command in &commands {
            command.validate()?;
        }
        if commands.first().map_or(true, |c| c.at > start.time()) {
            warn!(
                "no override command at or before {}; assuming no override in force",
                start
            );
        }
        Ok(Self {
            schedule: EventQueueMerger::new("schedule", schedules)?,
            overrides: EventQueueMerger::new("override", commands)?,
            state: OverrideState::Off,
            programmed_rate: 0.0,
            last_hour: None,
            next_tick: start,
        })
    }

    pub fn next_tick(&self) -> GridTick {
        self.next_tick
    }

    pub fn state(&self) -> OverrideState {
        self.state
    }

    pub fn step(&mut self) -> Result<BasalSample, DsError> {
        let tick = self.next_tick;
        let now = tick.time();
        let mut notes: Vec<String> = Vec::new();

        let mut schedule_started = false;
        let advance = self.schedule.advance_with(now, |entry| {
            if GridTick::ceil(entry.effective_at) == tick {
                schedule_started = true;
            }
        })?;
        let schedule_updated = advance.updated();
        let entry = advance
            .current
            .ok_or(DsError::NoSchedule { start: now })?;
        let hour = tick.hour();
        if schedule_updated || self.last_hour != Some(hour) {
            let rate = entry.rate_at_hour(hour);
            if schedule_started {
                notes.push(format!("new basal schedule, programmed rate {}", rate));
            } else if now.minute() == 0 && rate != entry.rate_at_hour(hour + 23) {
                notes.push(format!("programmed rate {}", rate));
            }
            self.programmed_rate = rate;
            self.last_hour = Some(hour);
        }

        let mut state = self.state;
        self.overrides.advance_with(now, |command| {
            state = OverrideState::after(command);
            if GridTick::ceil(command.at) == tick {
                notes.push(command.describe());
            }
        })?;
        if let OverrideState::Temporary { expires_at, .. } = state {
            if now >= expires_at {
                state = OverrideState::Off;
                if GridTick::ceil(expires_at) == tick {
                    notes.push("temporary rate expired".to_string());
                }
            }
        }
        self.state = state;

        let factor = state.factor();
        let actual_rate = self.programmed_rate * factor;
        self.next_tick = tick.next();
        Ok(BasalSample {
            tick,
            programmed_rate: self.programmed_rate,
            factor,
            actual_rate,
            units: actual_rate / TICKS_PER_HOUR as f64,
            notes: notes.join("; "),
        })
    }

    /// Step up to but excluding `end`.
    pub fn run_until(mut self, end: GridTick) -> Result<Vec<BasalSample>, DsError> {
        let mut out = Vec::with_capacity(self.next_tick.ticks_until(end).max(0) as usize);
        while self.next_tick < end {
            out.push(self.step()?);
        }
        debug!("reconstructed {} basal ticks up to {}", out.len(), end);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, tick};

    fn run(
        schedules: Vec<ScheduledRateEntry>,
        commands: Vec<OverrideCommand>,
        start: GridTick,
        end: GridTick,
    ) -> Vec<BasalSample> {
        BasalReconstructor::new(schedules, commands, start)
            .unwrap()
            .run_until(end)
            .unwrap()
    }

    #[test]
    fn test_flat_schedule_without_overrides() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.2)],
            vec![],
            tick(0, 0),
            tick(1, 0),
        );
        assert_eq!(samples.len(), 12);
        for s in &samples {
            assert_eq!(s.actual_rate, 1.2);
            assert!((s.units - 0.1).abs() < 1e-12);
        }
    }

    #[test]
    fn test_temporary_rate_expires_after_duration() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![OverrideCommand::temporary_rate(at(0, 0), 50.0, 60)],
            tick(0, 0),
            tick(1, 30),
        );
        for s in &samples {
            let expected = if s.tick < tick(1, 0) { 0.5 } else { 1.0 };
            assert_eq!(s.actual_rate, expected, "at {}", s.tick);
        }
        assert_eq!(samples[12].notes, "temporary rate expired");
    }

    #[test]
    fn test_off_grid_temporary_rate_expires_on_next_tick() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![OverrideCommand::temporary_rate(at(0, 12), 50.0, 60)],
            tick(0, 0),
            tick(1, 30),
        );
        for s in &samples {
            let expected = if s.tick < tick(0, 15) {
                1.0
            } else if s.tick < tick(1, 15) {
                0.5
            } else {
                1.0
            };
            assert_eq!(s.factor, expected, "at {}", s.tick);
        }
        let by_tick = |h, m| samples.iter().find(|s| s.tick == tick(h, m)).unwrap();
        assert_eq!(by_tick(0, 15).notes, "temporary rate 50% for 60 min");
        assert_eq!(by_tick(1, 10).factor, 0.5);
        assert_eq!(by_tick(1, 15).notes, "temporary rate expired");
    }

    #[test]
    fn test_suspend_takes_effect_on_next_tick() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![OverrideCommand::suspend(at(0, 12))],
            tick(0, 0),
            tick(0, 30),
        );
        let rates: Vec<f64> = samples.iter().map(|s| s.actual_rate).collect();
        assert_eq!(rates, vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0]);
        assert_eq!(samples[3].notes, "suspended");
    }

    #[test]
    fn test_suspend_overrides_temporary_rate_until_cancel() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![
                OverrideCommand::temporary_rate(at(0, 0), 150.0, 240),
                OverrideCommand::suspend(at(0, 20)),
                OverrideCommand::cancel(at(2, 0)),
            ],
            tick(0, 0),
            tick(2, 10),
        );
        for s in &samples {
            let expected = if s.tick < tick(0, 20) {
                1.5
            } else if s.tick < tick(2, 0) {
                0.0
            } else {
                1.0
            };
            assert_eq!(s.actual_rate, expected, "at {}", s.tick);
        }
    }

    #[test]
    fn test_command_at_expiry_tick_wins() {
        let samples = run(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![
                OverrideCommand::temporary_rate(at(0, 0), 50.0, 30),
                OverrideCommand::temporary_rate(at(0, 30), 150.0, 30),
            ],
            tick(0, 0),
            tick(1, 5),
        );
        assert_eq!(samples[5].actual_rate, 0.5);
        assert_eq!(samples[6].actual_rate, 1.5);
        assert_eq!(samples[12].actual_rate, 1.0);
    }

    #[test]
    fn test_hourly_table_and_schedule_change() {
        let mut rates = [1.0; 24];
        rates[1] = 2.0;
        let samples = run(
            vec![
                ScheduledRateEntry::new(at(0, 0), rates),
                ScheduledRateEntry::flat(at(1, 32), 0.5),
            ],
            vec![OverrideCommand::temporary_rate(at(0, 50), 50.0, 120)],
            tick(0, 45),
            tick(1, 45),
        );
        let by_tick = |h, m| samples.iter().find(|s| s.tick == tick(h, m)).unwrap();
        assert_eq!(by_tick(0, 55).actual_rate, 0.5);
        assert_eq!(by_tick(1, 0).actual_rate, 1.0);
        assert_eq!(by_tick(1, 0).notes, "programmed rate 2");
        assert_eq!(by_tick(1, 30).actual_rate, 1.0);
        // Schedule from 1:32 applies from the 1:35 tick.
        assert_eq!(by_tick(1, 35).actual_rate, 0.25);
        assert!(by_tick(1, 35).notes.starts_with("new basal schedule"));
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let schedules = vec![ScheduledRateEntry::flat(at(0, 0), 0.9)];
        let commands = vec![
            OverrideCommand::temporary_rate(at(0, 20), 70.0, 45),
            OverrideCommand::suspend(at(1, 40)),
            OverrideCommand::cancel(at(2, 10)),
        ];
        let first = run(schedules.clone(), commands.clone(), tick(0, 0), tick(3, 0));
        let second = run(schedules, commands, tick(0, 0), tick(3, 0));
        assert_eq!(first, second);
    }

    #[test]
    fn test_late_start_matches_full_run() {
        let schedules = vec![ScheduledRateEntry::flat(at(0, 0), 0.9)];
        let commands = vec![
            OverrideCommand::temporary_rate(at(0, 20), 70.0, 45),
            OverrideCommand::suspend(at(1, 40)),
        ];
        let full = run(schedules.clone(), commands.clone(), tick(0, 0), tick(2, 0));
        let late = run(schedules, commands, tick(0, 30), tick(2, 0));
        assert_eq!(&full[6..], &late[..]);
    }

    #[test]
    fn test_missing_schedule_and_bad_commands() {
        let err = BasalReconstructor::new(
            vec![ScheduledRateEntry::flat(at(1, 0), 1.0)],
            vec![],
            tick(0, 0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DsError::NoSchedule { .. }));

        let err = BasalReconstructor::new(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![OverrideCommand::temporary_rate(at(0, 0), 50.0, 0)],
            tick(0, 0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DsError::InvalidParameter(_)));

        let err = BasalReconstructor::new(
            vec![ScheduledRateEntry::flat(at(0, 0), 1.0)],
            vec![OverrideCommand::temporary_rate(at(0, 0), 50.0, 1_000_000_000_000)],
            tick(0, 0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DsError::InvalidParameter(_)));

        let err = BasalReconstructor::new(
            vec![
                ScheduledRateEntry::flat(at(1, 0), 1.0),
                ScheduledRateEntry::flat(at(0, 0), 1.0),
            ],
            vec![],
            tick(2, 0),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DsError::OrderingViolation { .. }));
    }

    #[test]
    fn test_clean_commands() {
        let cleaned = clean_commands(vec![
            OverrideCommand::suspend(at(0, 0)),
            OverrideCommand::suspend(at(0, 0)),
            OverrideCommand::cancel(at(0, 30)),
            OverrideCommand::temporary_rate(at(0, 30), 80.0, 30),
            OverrideCommand::cancel(at(1, 0)),
        ]);
        assert_eq!(
            cleaned,
            vec![
                OverrideCommand::suspend(at(0, 0)),
                OverrideCommand::temporary_rate(at(0, 30), 80.0, 30),
                OverrideCommand::cancel(at(1, 0)),
            ]
        );
    }

    #[test]
    fn test_command_parts_and_json() {
        let cmd = OverrideCommand::from_parts(at(0, 0), "temporary_basal", Some(40.0), Some(60))
            .unwrap();
        assert_eq!(cmd, OverrideCommand::temporary_rate(at(0, 0), 40.0, 60));
        assert!(OverrideCommand::from_parts(at(0, 0), "temporary_rate", None, Some(60)).is_err());
        let json = serde_json::to_string(&OverrideCommand::suspend(at(0, 0))).unwrap();
        assert_eq!(json, r#"{"at":"2024-06-15T00:00:00","kind":"suspend"}"#);
    }
}
