//! Replay of a time-ordered event stream against a monotonically advancing clock.

use std::collections::VecDeque;

use chrono::NaiveDateTime;

use crate::DsError;

pub trait TimedEvent {
    fn at(&self) -> NaiveDateTime;
}

/// Fails with `OrderingViolation` at the first event older than its predecessor.
pub fn ensure_ordered<E: TimedEvent>(stream: &'static str, events: &[E]) -> Result<(), DsError> {
    for pair in events.windows(2) {
        if pair[1].at() < pair[0].at() {
            return Err(DsError::OrderingViolation {
                stream,
                at: pair[1].at(),
            });
        }
    }
    Ok(())
}

/// Result of moving the clock forward.
#[derive(Debug)]
pub struct Advance<'a, E> {
    /// Most recent event with timestamp at or before the clock.
    pub current: Option<&'a E>,
    /// Number of events that became due on this step.
    pub applied: usize,
}

impl<E> Advance<'_, E> {
    pub fn updated(&self) -> bool {
        self.applied > 0
    }
}

#[derive(Clone, Debug)]
pub struct EventQueueMerger<E> {
    stream: &'static str,
    pending: VecDeque<E>,
    current: Option<E>,
    clock: Option<NaiveDateTime>,
}

impl<E: TimedEvent> EventQueueMerger<E> {
    pub fn new(stream: &'static str, events: Vec<E>) -> Result<Self, DsError> {
        ensure_ordered(stream, &events)?;
        Ok(Self {
            stream,
            pending: events.into(),
            current: None,
            clock: None,
        })
    }

    pub fn current(&self) -> Option<&E> {
        self.current.as_ref()
    }

    pub fn peek(&self) -> Option<&E> {
        self.pending.front()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn advance_to(&mut self, now: NaiveDateTime) -> Result<Advance<'_, E>, DsError> {
        self.advance_with(now, |_| {})
    }

    /// Apply every event due at `now`, calling `on_apply` for each in order.
    /// Events sharing a timestamp keep their input order; the last one wins.
    pub fn advance_with<F>(&mut self, now: NaiveDateTime, mut on_apply: F) -> Result<Advance<'_, E>, DsError>
    where
        F: FnMut(&E),
    {
        if let Some(clock) = self.clock {
            if now < clock {
                return Err(DsError::OrderingViolation {
                    stream: self.stream,
                    at: now,
                });
            }
        }
        self.clock = Some(now);
        let mut applied = 0;
        while self.pending.front().map_or(false, |e| e.at() <= now) {
            if let Some(event) = self.pending.pop_front() {
                on_apply(&event);
                self.current = Some(event);
                applied += 1;
            }
        }
        Ok(Advance {
            current: self.current.as_ref(),
            applied,
        })
    }
}
