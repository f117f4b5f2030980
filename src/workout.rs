//! Canonical workout model produced by the workout-file parsers
//!
//! A `Workout` is built exactly once by a parser and handed wholesale to the
//! scheduler; it is never mutated in place. The parsers guarantee that every
//! emitted step has a positive duration and at least one resolved target, so
//! downstream consumers never re-validate.

use serde::Serialize;

/// One step of a workout: how long, and what the treadmill should do
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkoutStep {
    /// Step length in seconds, always positive
    pub duration_s: u32,
    /// Target belt speed in km/h
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    /// Target incline in percent grade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incline_pct: Option<f64>,
    /// Source-format intensity (fraction of threshold power), kept for display
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
}

impl WorkoutStep {
    /// True once the step carries at least one treadmill target
    pub fn has_target(&self) -> bool {
        self.speed_kmh.is_some() || self.incline_pct.is_some()
    }
}

/// A named, ordered, non-empty sequence of workout steps
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Workout {
    pub name: String,
    pub description: String,
    pub steps: Vec<WorkoutStep>,
}

impl Workout {
    /// Total planned duration in seconds
    pub fn total_duration_s(&self) -> u32 {
        self.steps.iter().map(|s| s.duration_s).sum()
    }
}
