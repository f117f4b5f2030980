//! FTMS Treadmill Control
//!
//! This library drives a Bluetooth FTMS (Fitness Machine Service) treadmill:
//! protocol encoding/decoding, serialized command dispatch, a tick-driven
//! workout scheduler, and parsers for two workout description formats.
//!
//! # Modules
//!
//! - `protocol`: FTMS telemetry/heart-rate decoding and control point encoding
//! - `dispatcher`: FIFO single-flight command queue
//! - `controller`: connection state machine over an abstract transport
//! - `simulator`: synthetic treadmill backend for running without hardware
//! - `scheduler`: 1 Hz workout execution engine
//! - `zwo` / `icu`: workout file parsers producing the canonical model
//! - `types`: common types and error definitions

pub mod controller;
pub mod dispatcher;
pub mod icu;
pub mod protocol;
pub mod scheduler;
pub mod simulator;
pub mod transport;
pub mod types;
pub mod workout;
pub mod zwo;

pub use controller::TreadmillController;
pub use dispatcher::CommandDispatcher;
pub use icu::{parse_icu, IcuSettings};
pub use protocol::{
    decode_heart_rate, ControlCommand, TelemetryDecoder, CONTROL_POINT_UUID, FTMS_SERVICE_UUID,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, TREADMILL_DATA_UUID,
};
pub use scheduler::{StepCallback, WorkoutScheduler};
pub use simulator::SimulatedTreadmill;
pub use transport::{FitnessMachine, NotificationCallback, NotificationSource, Transport};
pub use types::{
    ConnectionStatus, FtmsError, Result, StatusCallback, TelemetryCallback, TelemetrySample,
};
pub use workout::{Workout, WorkoutStep};
pub use zwo::parse_zwo;
