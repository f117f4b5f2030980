//! Zwift workout (.zwo) interval-XML parser
//!
//! Translates a `.zwo` document into the canonical [`Workout`] model. The
//! reader below handles the XML subset these files use (prolog, comments,
//! elements with quoted attributes, self-closing tags, text content); there
//! is no entity decoding. Intensities are resolved to treadmill targets at
//! parse time: explicit pace for running workouts, otherwise power as a
//! fraction of threshold power mapped onto speed and incline.

use crate::types::{FtmsError, Result};
use crate::workout::{Workout, WorkoutStep};
use std::collections::HashMap;

/// Power fraction to km/h for running workouts: 1.0 of threshold ~ 14 km/h
const RUN_POWER_TO_SPEED: f64 = 14.0;
/// Power fraction to km/h for non-running workouts
const POWER_TO_SPEED: f64 = 10.0;
/// Power fraction to percent grade for non-running workouts
const POWER_TO_INCLINE: f64 = 2.0;
/// Pace attributes are metres per second; targets are km/h
const MPS_TO_KMH: f64 = 3.6;

const DEFAULT_NAME: &str = "Untitled Workout";

/// Sport type declared in the document metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SportType {
    Run,
    Other,
}

impl SportType {
    fn from_text(text: &str) -> Self {
        if text.eq_ignore_ascii_case("run") {
            SportType::Run
        } else {
            SportType::Other
        }
    }
}

/// Parse a `.zwo` document into a workout
pub fn parse_zwo(content: &str) -> Result<Workout> {
    let root = parse_document(content)?;

    let workout_file = if root.name == "workout_file" {
        &root
    } else {
        root.find_descendant("workout_file")
            .ok_or(FtmsError::MissingElement("workout_file"))?
    };

    let name = workout_file
        .child_text("name")
        .unwrap_or(DEFAULT_NAME)
        .to_string();
    let description = workout_file
        .child_text("description")
        .unwrap_or("")
        .to_string();
    let sport = SportType::from_text(workout_file.child_text("sportType").unwrap_or("bike"));

    let workout_node = workout_file
        .child("workout")
        .ok_or(FtmsError::MissingElement("workout"))?;

    let mut steps = Vec::new();
    for element in &workout_node.children {
        if element.name == "IntervalsT" {
            expand_intervals(element, sport, &mut steps)?;
        } else if let Some(step) = parse_single_step(element, sport)? {
            steps.push(step);
        }
    }

    if steps.is_empty() {
        return Err(FtmsError::EmptyWorkout);
    }

    Ok(Workout { name, description, steps })
}

/// Expand an `<IntervalsT>` block into `Repeat` copies of an (On, Off) pair
fn expand_intervals(element: &XmlElement, sport: SportType, steps: &mut Vec<WorkoutStep>) -> Result<()> {
    let repeat = element.attr_u32("Repeat")?.unwrap_or(1);
    let on_duration = element.attr_u32("OnDuration")?.unwrap_or(0);
    let off_duration = element.attr_u32("OffDuration")?.unwrap_or(0);

    let on_pace = element.attr_f64("OnPace")?;
    let off_pace = element.attr_f64("OffPace")?;
    let on_power = element.attr_f64("OnPower")?;
    let off_power = element.attr_f64("OffPower")?;

    for _ in 0..repeat {
        if let Some(step) = interval_half(on_duration, on_pace, on_power, sport) {
            steps.push(step);
        }
        if let Some(step) = interval_half(off_duration, off_pace, off_power, sport) {
            steps.push(step);
        }
    }

    Ok(())
}

/// Resolve one half of an interval pair; None when the half has no duration
/// or no resolvable intensity
fn interval_half(
    duration_s: u32,
    pace: Option<f64>,
    power: Option<f64>,
    sport: SportType,
) -> Option<WorkoutStep> {
    if duration_s == 0 {
        return None;
    }

    let mut step = WorkoutStep {
        duration_s,
        speed_kmh: None,
        incline_pct: None,
        power: None,
    };

    if sport == SportType::Run && pace.is_some() {
        step.speed_kmh = pace.map(|p| p * MPS_TO_KMH);
    } else if let Some(power) = power {
        step.power = Some(power);
        if sport == SportType::Run {
            step.speed_kmh = Some(power * RUN_POWER_TO_SPEED);
        } else {
            step.speed_kmh = Some(power * POWER_TO_SPEED);
            step.incline_pct = Some(power * POWER_TO_INCLINE);
        }
    }

    if !step.has_target() {
        return None;
    }
    if step.incline_pct.is_none() {
        step.incline_pct = Some(0.0);
    }
    Some(step)
}

/// Parse a single-step element (Warmup, SteadyState, Cooldown, Ramp, ...)
///
/// Resolution order: explicit pace (run only) first, then power-derived
/// values, with explicit Speed/Incline attributes overriding both. Returns
/// None for zero-duration steps and steps without any resolved target.
fn parse_single_step(element: &XmlElement, sport: SportType) -> Result<Option<WorkoutStep>> {
    let duration_s = element.attr_u32("Duration")?.unwrap_or(0);
    if duration_s == 0 {
        return Ok(None);
    }

    let mut step = WorkoutStep {
        duration_s,
        speed_kmh: None,
        incline_pct: None,
        power: None,
    };

    let power_value = match element.attr_f64("Power")? {
        Some(power) => Some(power),
        None => {
            let low = element.attr_f64("PowerLow")?;
            let high = element.attr_f64("PowerHigh")?;
            match (low, high) {
                (Some(low), Some(high)) => Some((low + high) / 2.0),
                _ => None,
            }
        }
    };

    if sport == SportType::Run {
        if let Some(pace) = element.attr_f64("Pace")? {
            if pace > 0.0 {
                step.speed_kmh = Some(pace * MPS_TO_KMH);
            }
        }
    }

    if let Some(power) = power_value {
        if step.speed_kmh.is_none() {
            step.power = Some(power);
            if sport == SportType::Run {
                step.speed_kmh = Some(power * RUN_POWER_TO_SPEED);
            } else {
                step.speed_kmh = Some(power * POWER_TO_SPEED);
                step.incline_pct = Some(power * POWER_TO_INCLINE);
            }
        }
    }

    if let Some(speed) = element.attr_f64("Speed")? {
        step.speed_kmh = Some(speed);
    }
    if let Some(incline) = element.attr_f64("Incline")? {
        step.incline_pct = Some(incline);
    }

    if !step.has_target() {
        return Ok(None);
    }
    if step.incline_pct.is_none() {
        step.incline_pct = Some(0.0);
    }
    Ok(Some(step))
}

// ============================================================================
// Minimal XML reader
// ============================================================================

/// One parsed element: name, attributes, child elements and trimmed text
#[derive(Debug)]
struct XmlElement {
    name: String,
    attributes: HashMap<String, String>,
    children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    fn find_descendant(&self, name: &str) -> Option<&XmlElement> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(name) {
                return Some(found);
            }
        }
        None
    }

    fn attr_f64(&self, name: &str) -> Result<Option<f64>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<f64>().map(Some).map_err(|_| {
                FtmsError::InvalidStep(format!("attribute {}=\"{}\" is not a number", name, raw))
            }),
        }
    }

    fn attr_u32(&self, name: &str) -> Result<Option<u32>> {
        match self.attributes.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<u32>().map(Some).map_err(|_| {
                FtmsError::InvalidStep(format!("attribute {}=\"{}\" is not an integer", name, raw))
            }),
        }
    }
}

struct Reader<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn starts_with(&self, pattern: &str) -> bool {
        self.rest().starts_with(pattern)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Advance past the next occurrence of `pattern`
    fn skip_past(&mut self, pattern: &str) -> Result<()> {
        match self.rest().find(pattern) {
            Some(index) => {
                self.pos += index + pattern.len();
                Ok(())
            }
            None => Err(FtmsError::MalformedXml(format!("unterminated {}", pattern))),
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(FtmsError::MalformedXml(format!(
                "expected '{}' at byte {}",
                byte as char, self.pos
            )))
        }
    }

    fn read_name(&mut self) -> Result<String> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b) if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' || b == b':'
        ) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(FtmsError::MalformedXml(format!(
                "expected a name at byte {}",
                start
            )));
        }
        Ok(self.input[start..self.pos].to_string())
    }
}

/// Parse a document: prolog, comments and doctype are skipped, then exactly
/// one root element is read
fn parse_document(input: &str) -> Result<XmlElement> {
    let mut reader = Reader::new(input);

    loop {
        reader.skip_whitespace();
        if reader.starts_with("<?") {
            reader.skip_past("?>")?;
        } else if reader.starts_with("<!--") {
            reader.skip_past("-->")?;
        } else if reader.starts_with("<!") {
            reader.skip_past(">")?;
        } else {
            break;
        }
    }

    if reader.peek() != Some(b'<') {
        return Err(FtmsError::MalformedXml("no root element".to_string()));
    }
    parse_element(&mut reader)
}

fn parse_element(reader: &mut Reader<'_>) -> Result<XmlElement> {
    reader.expect(b'<')?;
    let name = reader.read_name()?;
    let mut attributes = HashMap::new();

    // Attribute list up to '>' or '/>'
    loop {
        reader.skip_whitespace();
        match reader.peek() {
            Some(b'/') => {
                reader.pos += 1;
                reader.expect(b'>')?;
                return Ok(XmlElement {
                    name,
                    attributes,
                    children: Vec::new(),
                    text: String::new(),
                });
            }
            Some(b'>') => {
                reader.pos += 1;
                break;
            }
            Some(_) => {
                let (key, value) = parse_attribute(reader)?;
                attributes.insert(key, value);
            }
            None => {
                return Err(FtmsError::MalformedXml(format!("unclosed <{}> tag", name)));
            }
        }
    }

    // Element content: children, text and comments until the closing tag
    let mut children = Vec::new();
    let mut text = String::new();
    loop {
        if reader.starts_with("<!--") {
            reader.skip_past("-->")?;
        } else if reader.starts_with("</") {
            reader.pos += 2;
            let closing = reader.read_name()?;
            if closing != name {
                return Err(FtmsError::MalformedXml(format!(
                    "mismatched </{}> inside <{}>",
                    closing, name
                )));
            }
            reader.skip_whitespace();
            reader.expect(b'>')?;
            return Ok(XmlElement {
                name,
                attributes,
                children,
                text: text.trim().to_string(),
            });
        } else if reader.peek() == Some(b'<') {
            children.push(parse_element(reader)?);
        } else {
            let start = reader.pos;
            while reader.peek().is_some_and(|b| b != b'<') {
                reader.pos += 1;
            }
            if reader.peek().is_none() {
                return Err(FtmsError::MalformedXml(format!("<{}> never closed", name)));
            }
            text.push_str(&reader.input[start..reader.pos]);
        }
    }
}

fn parse_attribute(reader: &mut Reader<'_>) -> Result<(String, String)> {
    let key = reader.read_name()?;
    reader.skip_whitespace();
    reader.expect(b'=')?;
    reader.skip_whitespace();

    let quote = match reader.peek() {
        Some(b @ (b'"' | b'\'')) => b,
        _ => {
            return Err(FtmsError::MalformedXml(format!(
                "attribute {} is not quoted",
                key
            )));
        }
    };
    reader.pos += 1;

    let start = reader.pos;
    while reader.peek().is_some_and(|b| b != quote) {
        reader.pos += 1;
    }
    if reader.peek().is_none() {
        return Err(FtmsError::MalformedXml(format!(
            "unterminated value for attribute {}",
            key
        )));
    }
    let value = reader.input[start..reader.pos].to_string();
    reader.pos += 1;

    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bike_intervals_expand() {
        let content = r#"<?xml version="1.0"?>
            <workout_file>
                <name>VO2 Repeats</name>
                <description>Short and sharp</description>
                <sportType>bike</sportType>
                <workout>
                    <IntervalsT Repeat="3" OnDuration="30" OffDuration="30" OnPower="1.0" OffPower="0.5"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.name, "VO2 Repeats");
        assert_eq!(workout.steps.len(), 6);

        for pair in workout.steps.chunks(2) {
            let on = &pair[0];
            let off = &pair[1];
            assert_eq!(on.duration_s, 30);
            assert_eq!(on.speed_kmh, Some(10.0));
            assert_eq!(on.incline_pct, Some(2.0));
            assert_eq!(off.duration_s, 30);
            assert_eq!(off.speed_kmh, Some(5.0));
            assert_eq!(off.incline_pct, Some(1.0));
        }
    }

    #[test]
    fn test_run_pace_takes_priority_over_power() {
        // 3.0 m/s pace => 10.8 km/h, even with a power attribute present
        let content = r#"<workout_file>
                <sportType>run</sportType>
                <workout>
                    <SteadyState Duration="300" Pace="3.0" Power="0.8"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.steps.len(), 1);
        let step = &workout.steps[0];
        assert!((step.speed_kmh.unwrap() - 10.8).abs() < 1e-9);
        assert_eq!(step.incline_pct, Some(0.0));
        assert!(step.power.is_none());
    }

    #[test]
    fn test_run_power_fallback() {
        let content = r#"<workout_file>
                <sportType>run</sportType>
                <workout>
                    <SteadyState Duration="600" Power="1.0"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.steps[0].speed_kmh, Some(14.0));
        assert_eq!(workout.steps[0].power, Some(1.0));
    }

    #[test]
    fn test_power_range_is_averaged() {
        let content = r#"<workout_file>
                <workout>
                    <Warmup Duration="600" PowerLow="0.4" PowerHigh="0.8"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        let step = &workout.steps[0];
        // Average power 0.6: speed 6.0, incline 1.2
        assert!((step.speed_kmh.unwrap() - 6.0).abs() < 1e-9);
        assert!((step.incline_pct.unwrap() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_speed_and_incline_override() {
        let content = r#"<workout_file>
                <workout>
                    <SteadyState Duration="120" Power="0.5" Speed="7.5" Incline="4.0"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.steps[0].speed_kmh, Some(7.5));
        assert_eq!(workout.steps[0].incline_pct, Some(4.0));
    }

    #[test]
    fn test_zero_duration_and_targetless_steps_dropped() {
        let content = r#"<workout_file>
                <workout>
                    <SteadyState Duration="0" Power="0.8"/>
                    <SteadyState Duration="60"/>
                    <SteadyState Duration="60" Power="0.8"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.steps.len(), 1);
        assert_eq!(workout.steps[0].duration_s, 60);
    }

    #[test]
    fn test_defaults_for_missing_metadata() {
        let content = r#"<workout_file>
                <workout>
                    <SteadyState Duration="60" Power="0.5"/>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.name, "Untitled Workout");
        assert_eq!(workout.description, "");
    }

    #[test]
    fn test_missing_workout_element() {
        let content = r#"<workout_file><name>Broken</name></workout_file>"#;
        assert!(matches!(
            parse_zwo(content),
            Err(FtmsError::MissingElement("workout"))
        ));
    }

    #[test]
    fn test_missing_workout_file_element() {
        let content = r#"<something_else><workout/></something_else>"#;
        assert!(matches!(
            parse_zwo(content),
            Err(FtmsError::MissingElement("workout_file"))
        ));
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(
            parse_zwo("<workout_file><workout></workout_file>"),
            Err(FtmsError::MalformedXml(_))
        ));
        assert!(matches!(
            parse_zwo("not xml at all"),
            Err(FtmsError::MalformedXml(_))
        ));
    }

    #[test]
    fn test_empty_workout() {
        let content = r#"<workout_file><workout></workout></workout_file>"#;
        assert!(matches!(parse_zwo(content), Err(FtmsError::EmptyWorkout)));
    }

    #[test]
    fn test_comments_and_self_closing_tags() {
        let content = r#"<?xml version="1.0" encoding="UTF-8"?>
            <!-- exported workout -->
            <workout_file>
                <sportType>bike</sportType>
                <workout>
                    <!-- ramp up -->
                    <Warmup Duration="300" PowerLow="0.3" PowerHigh="0.6"/>
                    <Cooldown Duration="300" Power="0.4"></Cooldown>
                </workout>
            </workout_file>"#;

        let workout = parse_zwo(content).unwrap();
        assert_eq!(workout.steps.len(), 2);
    }
}
