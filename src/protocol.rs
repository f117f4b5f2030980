//! FTMS (Fitness Machine Service) wire protocol codec
//!
//! This module implements the subset of the FTMS GATT protocol spoken by
//! treadmills: decoding of Treadmill Data telemetry notifications, decoding
//! of Heart Rate Measurement notifications, and encoding of Fitness Machine
//! Control Point commands.

use crate::types::{FtmsError, Result, TelemetrySample};
use std::fmt;
use uuid::Uuid;

/// Fitness Machine Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Treadmill Data characteristic UUID (0x2ACD), notify-only
pub const TREADMILL_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2acd_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point UUID (0x2AD9), write-only
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic UUID (0x2A37), notify-only
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

// Treadmill Data flag bits (little-endian u16 at the start of each frame)
const FLAG_SPEED_PRESENT: u16 = 0x0002;
const FLAG_AVG_SPEED_PRESENT: u16 = 0x0004;
const FLAG_DISTANCE_PRESENT: u16 = 0x0008;
const FLAG_INCLINE_PRESENT: u16 = 0x0010;

/// Control point opcodes
const OPCODE_REQUEST_CONTROL: u8 = 0x00;
const OPCODE_SET_TARGET_SPEED: u8 = 0x02;
const OPCODE_SET_TARGET_INCLINE: u8 = 0x03;
const OPCODE_START_RESUME: u8 = 0x07;
const OPCODE_STOP_PAUSE: u8 = 0x08;

/// Parameter byte for Start/Stop: 0x01 is pause, 0x02 is stop/run
const STOP_PARAM_STOP: u8 = 0x02;
const START_PARAM_RUN: u8 = 0x02;

/// A command for the Fitness Machine Control Point, tagged by intent
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// Take control of the machine before issuing targets
    RequestControl,
    /// Target belt speed in km/h
    SetTargetSpeed(f64),
    /// Target incline in percent grade
    SetTargetIncline(f64),
    /// Start or resume the training session
    Start,
    /// Stop the training session
    Stop,
}

impl ControlCommand {
    /// Encode the command into a control point frame
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            ControlCommand::RequestControl => vec![OPCODE_REQUEST_CONTROL],
            ControlCommand::SetTargetSpeed(kmh) => {
                let raw = (kmh * 100.0).round() as u16;
                let mut frame = vec![OPCODE_SET_TARGET_SPEED];
                frame.extend_from_slice(&raw.to_le_bytes());
                frame
            }
            ControlCommand::SetTargetIncline(pct) => {
                let raw = (pct * 10.0).round() as i16;
                let mut frame = vec![OPCODE_SET_TARGET_INCLINE];
                frame.extend_from_slice(&raw.to_le_bytes());
                frame
            }
            ControlCommand::Start => vec![OPCODE_START_RESUME, START_PARAM_RUN],
            ControlCommand::Stop => vec![OPCODE_STOP_PAUSE, STOP_PARAM_STOP],
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::RequestControl => write!(f, "RequestControl"),
            ControlCommand::SetTargetSpeed(kmh) => write!(f, "SetTargetSpeed({:.1} km/h)", kmh),
            ControlCommand::SetTargetIncline(pct) => write!(f, "SetTargetIncline({:.1}%)", pct),
            ControlCommand::Start => write!(f, "Start"),
            ControlCommand::Stop => write!(f, "Stop"),
        }
    }
}

/// Stateful decoder for Treadmill Data notifications
///
/// The decoder owns the last known distance so that frames without the
/// distance-present bit carry the freshest decoded value forward. It is
/// reset whenever a connection is established or torn down.
#[derive(Debug, Default)]
pub struct TelemetryDecoder {
    last_distance_km: f64,
}

impl TelemetryDecoder {
    /// Create a decoder with no prior distance
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the carried-forward distance
    pub fn reset(&mut self) {
        self.last_distance_km = 0.0;
    }

    /// Decode one Treadmill Data frame
    ///
    /// Fields follow the flags word in a fixed order, each present only when
    /// its flag bit is set. Unknown trailing bytes are ignored. A frame
    /// shorter than its flags require fails with `TruncatedFrame`.
    pub fn decode(&mut self, data: &[u8]) -> Result<TelemetrySample> {
        let flags = u16::from_le_bytes([
            *data.first().ok_or(FtmsError::TruncatedFrame { needed: 2, got: data.len() })?,
            *data.get(1).ok_or(FtmsError::TruncatedFrame { needed: 2, got: data.len() })?,
        ]);
        let mut offset = 2usize;

        let speed_kmh = if flags & FLAG_SPEED_PRESENT != 0 {
            let raw = read_u16(data, offset)?;
            offset += 2;
            raw as f64 * 0.01
        } else {
            0.0
        };

        // Average speed is transmitted by some machines but unused here
        if flags & FLAG_AVG_SPEED_PRESENT != 0 {
            read_u16(data, offset)?;
            offset += 2;
        }

        let distance_km = if flags & FLAG_DISTANCE_PRESENT != 0 {
            let raw = read_u32(data, offset)?;
            offset += 4;
            raw as f64 * 0.1 / 1000.0
        } else {
            self.last_distance_km
        };

        let incline_pct = if flags & FLAG_INCLINE_PRESENT != 0 {
            let raw = read_i16(data, offset)?;
            raw as f64 * 0.1
        } else {
            0.0
        };

        self.last_distance_km = distance_km;

        Ok(TelemetrySample {
            speed_kmh,
            incline_pct,
            distance_km,
            heart_rate_bpm: None,
        })
    }
}

/// Decode a Heart Rate Measurement notification into bpm
///
/// Bit 0 of the flags byte selects an 8-bit or 16-bit little-endian value
/// starting at byte 1.
pub fn decode_heart_rate(data: &[u8]) -> Result<u16> {
    let flags = *data
        .first()
        .ok_or(FtmsError::TruncatedFrame { needed: 1, got: 0 })?;

    if flags & 0x01 != 0 {
        Ok(read_u16(data, 1)?)
    } else {
        data.get(1)
            .copied()
            .map(u16::from)
            .ok_or(FtmsError::TruncatedFrame { needed: 2, got: data.len() })
    }
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16> {
    match data.get(offset..offset + 2) {
        Some(bytes) => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
        None => Err(FtmsError::TruncatedFrame { needed: offset + 2, got: data.len() }),
    }
}

fn read_i16(data: &[u8], offset: usize) -> Result<i16> {
    read_u16(data, offset).map(|raw| raw as i16)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    match data.get(offset..offset + 4) {
        Some(bytes) => Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        None => Err(FtmsError::TruncatedFrame { needed: offset + 4, got: data.len() }),
    }
}
