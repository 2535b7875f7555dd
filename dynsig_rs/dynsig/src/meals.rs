use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::curves::CurveCategory;
use crate::queue::{ensure_ordered, TimedEvent};
use crate::DsError;

/// Meal label attached to a carb entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MealCode {
    Before6,
    Breakfast,
    Lunch,
    Snack,
    Dinner,
    After9,
    Rescue,
}

impl MealCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MealCode::Before6 => "before6",
            MealCode::Breakfast => "breakfast",
            MealCode::Lunch => "lunch",
            MealCode::Snack => "snack",
            MealCode::Dinner => "dinner",
            MealCode::After9 => "after9",
            MealCode::Rescue => "rescue",
        }
    }

    pub fn curve_category(&self) -> CurveCategory {
        match self {
            MealCode::Before6 | MealCode::Breakfast | MealCode::Lunch | MealCode::Snack => {
                CurveCategory::Brunch
            }
            MealCode::Dinner | MealCode::After9 => CurveCategory::Dinner,
            MealCode::Rescue => CurveCategory::Rescue,
        }
    }

    /// Meal name for a bolus-covered carb entry eaten at `time`.
    pub fn from_time_of_day(time: NaiveTime) -> Self {
        let minutes = time.hour() * 60 + time.minute();
        match minutes {
            m if m < 6 * 60 => MealCode::Before6,
            m if m < 11 * 60 => MealCode::Breakfast,
            m if m < 15 * 60 => MealCode::Lunch,
            m if m < 17 * 60 + 30 => MealCode::Snack,
            m if m < 21 * 60 => MealCode::Dinner,
            _ => MealCode::After9,
        }
    }
}

impl fmt::Display for MealCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MealCode {
    type Err = DsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "before6" => Ok(MealCode::Before6),
            "breakfast" => Ok(MealCode::Breakfast),
            "lunch" => Ok(MealCode::Lunch),
            "snack" => Ok(MealCode::Snack),
            "dinner" => Ok(MealCode::Dinner),
            "after9" => Ok(MealCode::After9),
            "rescue" => Ok(MealCode::Rescue),
            other => Err(DsError::InvalidParameter(format!(
                "unknown meal code '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    Bolus,
    Carbs { meal: Option<MealCode> },
}

/// A bolus (units) or carb entry (grams).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawInput {
    pub at: NaiveDateTime,
    #[serde(flatten)]
    pub kind: InputKind,
    pub amount: f64,
}

impl RawInput {
    pub fn bolus(at: NaiveDateTime, units: f64) -> Self {
        Self {
            at,
            kind: InputKind::Bolus,
            amount: units,
        }
    }

    pub fn carbs(at: NaiveDateTime, grams: f64, meal: Option<MealCode>) -> Self {
        Self {
            at,
            kind: InputKind::Carbs { meal },
            amount: grams,
        }
    }

    /// Curve the entry is convolved against.
    pub fn curve_category(&self) -> CurveCategory {
        match self.kind {
            InputKind::Bolus => CurveCategory::Insulin,
            InputKind::Carbs { meal } => meal.map_or(CurveCategory::Rescue, |m| m.curve_category()),
        }
    }
}

impl TimedEvent for RawInput {
    fn at(&self) -> NaiveDateTime {
        self.at
    }
}

/// Label unlabelled carb entries: a bolus within `window_minutes` either side
/// makes it a meal named by time of day, otherwise it is rescue carbs.
/// Entries that already carry a meal code are kept as they are.
pub fn categorize_carbs(inputs: &[RawInput], window_minutes: i64) -> Result<Vec<RawInput>, DsError> {
    ensure_ordered("input", inputs)?;
    let window = crate::meal_window(window_minutes)?;
    let boluses: Vec<NaiveDateTime> = inputs
        .iter()
        .filter(|i| i.kind == InputKind::Bolus && i.amount > 0.0)
        .map(|i| i.at)
        .collect();
    let covered = |at: NaiveDateTime| {
        let lo = at.checked_sub_signed(window).unwrap_or(NaiveDateTime::MIN);
        let hi = at.checked_add_signed(window).unwrap_or(NaiveDateTime::MAX);
        let first = boluses.partition_point(|b| *b < lo);
        boluses.get(first).map_or(false, |b| *b <= hi)
    };
    Ok(inputs
        .iter()
        .map(|input| match input.kind {
            InputKind::Carbs { meal: None } => {
                let meal = if covered(input.at) {
                    MealCode::from_time_of_day(input.at.time())
                } else {
                    MealCode::Rescue
                };
                RawInput::carbs(input.at, input.amount, Some(meal))
            }
            _ => *input,
        })
        .collect())
}
