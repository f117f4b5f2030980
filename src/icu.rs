//! Intervals.icu workout text parser
//!
//! Parses the plain-text interval notation exported by Intervals.icu into
//! the canonical [`Workout`] model. The grammar is line oriented:
//!
//! - `Nx` opens a repeat block; the `- ` lines that follow, up to the next
//!   blank line, form a template appended N times
//! - a `- ` line outside a block is a single step
//! - the first remaining non-blank line becomes the workout name
//!
//! Step lines look like `- 4m 80% Pace @ 1.5% Incline`. Percentage paces
//! are relative to the configured threshold pace.

use crate::types::{FtmsError, Result};
use crate::workout::{Workout, WorkoutStep};

const DEFAULT_NAME: &str = "Intervals.icu Workout";

/// Parser settings for relative intensities
#[derive(Debug, Clone)]
pub struct IcuSettings {
    /// Threshold pace per km as "mm:ss"
    pub threshold_pace: String,
}

impl Default for IcuSettings {
    fn default() -> Self {
        Self {
            threshold_pace: "4:30".to_string(),
        }
    }
}

/// Parse an Intervals.icu text document into a workout
pub fn parse_icu(content: &str, settings: &IcuSettings) -> Result<Workout> {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();

    let name = lines
        .iter()
        .find(|l| !l.is_empty() && !l.starts_with('-') && repeat_count(l).is_none())
        .map_or(DEFAULT_NAME, |l| *l)
        .to_string();

    let mut steps = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if line.is_empty() {
            i += 1;
            continue;
        }

        if let Some(repeats) = repeat_count(line) {
            let mut template = Vec::new();
            i += 1;

            while i < lines.len() && !lines[i].is_empty() {
                if lines[i].starts_with("- ") {
                    template.push(parse_step_line(lines[i], settings)?);
                }
                i += 1;
            }

            if template.is_empty() {
                return Err(FtmsError::EmptyIntervalBlock(line.to_string()));
            }
            for _ in 0..repeats {
                steps.extend(template.iter().cloned());
            }
        } else if line.starts_with("- ") {
            steps.push(parse_step_line(line, settings)?);
            i += 1;
        } else {
            // Title or comment line, not part of any step
            i += 1;
        }
    }

    if steps.is_empty() {
        return Err(FtmsError::EmptyWorkout);
    }

    Ok(Workout {
        description: name.clone(),
        name,
        steps,
    })
}

/// Match a repeat-block opener like "4x", returning the count
fn repeat_count(line: &str) -> Option<u32> {
    let digits = line
        .strip_suffix('x')
        .or_else(|| line.strip_suffix('X'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse one `- <duration> <intensity>` step line
fn parse_step_line(line: &str, settings: &IcuSettings) -> Result<WorkoutStep> {
    let content = line[2..].trim();
    let (duration_str, intensity_str) = content
        .split_once(' ')
        .ok_or_else(|| FtmsError::InvalidStep(line.to_string()))?;

    let duration_s = parse_duration(duration_str)?;
    let (speed_kmh, incline_pct) = parse_intensity(intensity_str.trim(), settings)?;

    Ok(WorkoutStep {
        duration_s,
        speed_kmh: Some(speed_kmh),
        incline_pct: Some(incline_pct),
        power: None,
    })
}

/// Parse "4m" or "30s" into seconds
fn parse_duration(duration_str: &str) -> Result<u32> {
    let (value_str, unit_factor) = if let Some(v) = duration_str.strip_suffix('m') {
        (v, 60)
    } else if let Some(v) = duration_str.strip_suffix('s') {
        (v, 1)
    } else {
        return Err(FtmsError::UnknownDurationUnit(duration_str.to_string()));
    };

    let value: u32 = value_str.parse().map_err(|_| {
        FtmsError::InvalidStep(format!("invalid duration value in \"{}\"", duration_str))
    })?;
    if value == 0 {
        return Err(FtmsError::InvalidStep(format!(
            "duration must be positive in \"{}\"",
            duration_str
        )));
    }

    Ok(value * unit_factor)
}

/// Parse an intensity like "120% Pace", "4:30 Pace" or either form followed
/// by "@ 2% Incline", into (speed km/h, incline %)
fn parse_intensity(intensity_str: &str, settings: &IcuSettings) -> Result<(f64, f64)> {
    let mut pace_part = intensity_str;
    let mut incline = 0.0;

    // Lowercasing only touches the keywords, never the digits, so the
    // numeric parts can be parsed straight out of the lowered string
    if let Some(at) = intensity_str.find('@') {
        let tail = intensity_str[at + 1..].trim().to_ascii_lowercase();
        let percent = tail
            .strip_suffix("incline")
            .map(str::trim_end)
            .and_then(|t| t.strip_suffix('%'))
            .ok_or_else(|| {
                FtmsError::InvalidStep(format!(
                    "unsupported incline suffix in \"{}\"",
                    intensity_str
                ))
            })?;
        incline = percent.trim().parse::<f64>().map_err(|_| {
            FtmsError::InvalidStep(format!("invalid incline value in \"{}\"", intensity_str))
        })?;
        pace_part = intensity_str[..at].trim();
    }

    let lowered = pace_part.to_ascii_lowercase();
    let value_part = lowered
        .strip_suffix("pace")
        .map(str::trim_end)
        .ok_or_else(|| {
            FtmsError::InvalidStep(format!(
                "unsupported intensity \"{}\", expected \"X% Pace\" or \"mm:ss Pace\"",
                intensity_str
            ))
        })?;

    if let Some(percent_str) = value_part.strip_suffix('%') {
        let percentage: i64 = percent_str.trim().parse().map_err(|_| {
            FtmsError::InvalidStep(format!("invalid pace percentage in \"{}\"", intensity_str))
        })?;
        if percentage <= 0 {
            return Err(FtmsError::NonPositivePercentage(percentage));
        }

        let threshold_s = parse_pace_to_seconds(&settings.threshold_pace)?;
        let target_s = threshold_s as f64 / (percentage as f64 / 100.0);
        Ok((pace_to_speed(target_s), incline))
    } else if value_part.contains(':') {
        let target_s = parse_pace_to_seconds(value_part)?;
        Ok((pace_to_speed(target_s as f64), incline))
    } else {
        Err(FtmsError::InvalidStep(format!(
            "unsupported intensity \"{}\", expected \"X% Pace\" or \"mm:ss Pace\"",
            intensity_str
        )))
    }
}

/// Convert "mm:ss" into total seconds
fn parse_pace_to_seconds(pace: &str) -> Result<u32> {
    let invalid = || FtmsError::InvalidPace(pace.to_string());

    let (minutes, seconds) = pace.split_once(':').ok_or_else(invalid)?;
    let minutes: u32 = minutes.trim().parse().map_err(|_| invalid())?;
    let seconds: u32 = seconds.trim().parse().map_err(|_| invalid())?;

    Ok(minutes * 60 + seconds)
}

/// Convert pace in seconds/km into km/h
fn pace_to_speed(pace_s_per_km: f64) -> f64 {
    if pace_s_per_km <= 0.0 {
        return 0.0;
    }
    3600.0 / pace_s_per_km
}
