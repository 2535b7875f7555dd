//! Convolution of per-tick inputs against action curves.
//!
//! Every path ends in the same contiguous `ArrayView1::dot` against the
//! reversed curve, so batch and incremental results are bit-identical.

use std::sync::Arc;

use ndarray::{s, Array1, ArrayView1};

use crate::curves::{ActionCurve, CurveSet};
use crate::meals::{InputKind, RawInput};
use crate::{DsError, GridTick};

/// Dot product of an oldest-first window with a reversed curve.
pub fn convolve(window: ArrayView1<'_, f64>, curve_reversed: ArrayView1<'_, f64>) -> Result<f64, DsError> {
    if window.len() != curve_reversed.len() {
        return Err(DsError::WindowLength {
            expected: curve_reversed.len(),
            actual: window.len(),
        });
    }
    Ok(window.dot(&curve_reversed))
}

/// Output at every tick of `inputs`, with ticks before the first treated as zero.
pub fn convolve_batch(curve: &ActionCurve, inputs: &[f64]) -> Result<Vec<f64>, DsError> {
    let n = curve.len();
    let mut padded = Array1::<f64>::zeros(inputs.len() + n - 1);
    padded
        .slice_mut(s![n - 1..])
        .assign(&ArrayView1::from(inputs));
    let reversed = curve.reversed();
    padded
        .windows(n)
        .into_iter()
        .map(|window| convolve(window, reversed))
        .collect()
}

/// Summed carb output across the three carb curves, indexed like
/// [`CurveCategory::CARBS`](crate::curves::CurveCategory::CARBS).
pub fn dynamic_carbs(curves: &CurveSet, carbs: &[Vec<f64>; 3]) -> Result<Vec<f64>, DsError> {
    let len = carbs.iter().map(Vec::len).max().unwrap_or(0);
    let mut total = vec![0.0; len];
    for (curve, series) in curves.carbs().into_iter().zip(carbs.iter()) {
        for (slot, value) in total.iter_mut().zip(convolve_batch(curve, series)?) {
            *slot += value;
        }
    }
    Ok(total)
}

/// Fixed-length history of the most recent values.
#[derive(Clone, Debug)]
pub struct HistoryRing {
    slots: Vec<f64>,
    head: usize,
    scratch: Array1<f64>,
}

impl HistoryRing {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![0.0; len],
            head: 0,
            scratch: Array1::zeros(len),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Overwrite the oldest slot.
    pub fn push(&mut self, value: f64) {
        if self.slots.is_empty() {
            return;
        }
        self.slots[self.head] = value;
        self.head = (self.head + 1) % self.slots.len();
    }

    /// Contents oldest-first.
    pub fn window(&mut self) -> ArrayView1<'_, f64> {
        let len = self.slots.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = self.slots[(self.head + i) % len];
        }
        self.scratch.view()
    }
}

/// Convolves one value per tick as it arrives.
#[derive(Clone, Debug)]
pub struct IncrementalConvolver {
    curve: Arc<ActionCurve>,
    ring: HistoryRing,
}

impl IncrementalConvolver {
    pub fn new(curve: Arc<ActionCurve>) -> Self {
        let ring = HistoryRing::new(curve.len());
        Self { curve, ring }
    }

    pub fn push(&mut self, value: f64) -> Result<f64, DsError> {
        self.ring.push(value);
        let reversed = self.curve.reversed();
        convolve(self.ring.window(), reversed)
    }

    /// Advance past `ticks` ticks of zero input without computing outputs.
    /// Once the whole ring is zero, further ticks change nothing.
    pub fn skip(&mut self, ticks: usize) {
        for _ in 0..ticks.min(self.ring.len()) {
            self.ring.push(0.0);
        }
    }
}

/// Incremental dynamic insulin and dynamic carbs for consecutive ticks.
#[derive(Clone, Debug)]
pub struct StreamingSignals {
    insulin: IncrementalConvolver,
    carbs: [IncrementalConvolver; 3],
    last_tick: Option<GridTick>,
}

impl StreamingSignals {
    pub fn new(curves: &CurveSet) -> Self {
        Self {
            insulin: IncrementalConvolver::new(Arc::clone(&curves.insulin)),
            carbs: [
                IncrementalConvolver::new(Arc::clone(&curves.rescue)),
                IncrementalConvolver::new(Arc::clone(&curves.brunch)),
                IncrementalConvolver::new(Arc::clone(&curves.dinner)),
            ],
            last_tick: None,
        }
    }

    /// Feed one tick of insulin units and carb grams (rescue, brunch, dinner)
    /// and return `(dynamic_insulin, dynamic_carbs)`.
    ///
    /// Skipped ticks are filled with zero input.
    pub fn push(&mut self, tick: GridTick, insulin: f64, carbs: [f64; 3]) -> Result<(f64, f64), DsError> {
        if let Some(last) = self.last_tick {
            if tick <= last {
                return Err(DsError::OrderingViolation {
                    stream: "signal",
                    at: tick.time(),
                });
            }
            let gap = (last.ticks_until(tick) - 1) as usize;
            self.insulin.skip(gap);
            for convolver in self.carbs.iter_mut() {
                convolver.skip(gap);
            }
        }
        self.last_tick = Some(tick);
        let dynamic_insulin = self.insulin.push(insulin)?;
        let mut dynamic_carbs = 0.0;
        for (convolver, value) in self.carbs.iter_mut().zip(carbs) {
            dynamic_carbs += convolver.push(value)?;
        }
        Ok((dynamic_insulin, dynamic_carbs))
    }
}

/// Per-tick input totals over `len` ticks from `start`.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseInputs {
    pub start: GridTick,
    pub bolus: Vec<f64>,
    pub carbs: [Vec<f64>; 3],
}

/// Sum inputs into the tick their timestamp floors to; entries outside the
/// range are ignored.
pub fn bucket_inputs(inputs: &[RawInput], start: GridTick, len: usize) -> DenseInputs {
    let mut dense = DenseInputs {
        start,
        bolus: vec![0.0; len],
        carbs: [vec![0.0; len], vec![0.0; len], vec![0.0; len]],
    };
    for input in inputs {
        let offset = start.ticks_until(GridTick::floor(input.at));
        if offset < 0 || offset as usize >= len {
            continue;
        }
        let index = offset as usize;
        match input.kind {
            InputKind::Bolus => dense.bolus[index] += input.amount,
            InputKind::Carbs { .. } => {
                let slot = input
                    .curve_category()
                    .carb_slot()
                    .unwrap_or(0);
                dense.carbs[slot][index] += input.amount;
            }
        }
    }
    dense
}
