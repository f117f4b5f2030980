//! Capability traits separating treadmill logic from platform Bluetooth
//!
//! `Transport` abstracts the BLE operations the controller needs: discovery,
//! characteristic subscription and control point writes. The real BlueZ
//! implementation lives in the binary; tests substitute mocks. `FitnessMachine`
//! is the external surface shared by the real controller and the simulator,
//! so a frontend can hold either without caring which backend is active.

use crate::types::{ConnectionStatus, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Characteristics a transport can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationSource {
    /// Treadmill Data telemetry notifications
    TreadmillData,
    /// Heart Rate Measurement notifications, optional on most machines
    HeartRate,
}

/// Callback invoked with each raw notification payload
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Bluetooth operations required by the controller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Find the device and resolve its services and characteristics
    ///
    /// Returns `FtmsError::Cancelled` when discovery was abandoned by the
    /// user rather than failing.
    async fn discover(&self) -> Result<()>;

    /// Enable notifications on a characteristic and forward each payload
    async fn subscribe(
        &self,
        source: NotificationSource,
        callback: NotificationCallback,
    ) -> Result<()>;

    /// Write one frame to the control point
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Register the channel used to report device-initiated link loss
    fn set_link_lost_sender(&self, sender: mpsc::Sender<()>);

    /// Stop notification forwarding and drop the link
    async fn teardown(&self);
}

/// External surface of a treadmill backend
///
/// Implemented by both the real controller and the simulator; selected at
/// construction time, so nothing downstream branches on a test mode.
#[async_trait]
pub trait FitnessMachine: Send + Sync {
    /// Establish the connection; resolves once the machine is ready
    async fn connect(&self) -> Result<()>;

    /// Tear the connection down from any state
    async fn disconnect(&self);

    /// Current connection status
    fn status(&self) -> ConnectionStatus;

    /// Request a belt speed in km/h
    fn set_target_speed(&self, speed_kmh: f64);

    /// Request an incline in percent grade
    fn set_target_incline(&self, incline_pct: f64);

    /// Start or resume the training session
    fn start_workout(&self);

    /// Stop the training session
    fn stop_workout(&self);
}
