//! Simulated treadmill backend
//!
//! A drop-in [`FitnessMachine`] used when no physical device is available.
//! There is no codec and no command queue behind it: setters write straight
//! into the simulator's target state, and a 100 ms tick ramps the synthetic
//! belt toward those targets, emitting telemetry through the same callback
//! type the real controller uses. The missing queueing latency is a known,
//! intended difference from the real path.

use crate::transport::FitnessMachine;
use crate::types::{
    ConnectionStatus, Result, StatusCallback, TelemetryCallback, TelemetrySample,
};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Simulated connection handshake latency
const CONNECT_LATENCY: Duration = Duration::from_millis(500);
/// Telemetry tick period
const TICK_PERIOD: Duration = Duration::from_millis(100);
/// Per-tick ramp toward a target, in km/h or percent grade
const RAMP_STEP: f64 = 0.1;
/// Belt speed commanded by start_workout, a slow walk
const SLOW_WALK_KMH: f64 = 2.0;

struct SimState {
    status: ConnectionStatus,
    target_speed: f64,
    target_incline: f64,
    telemetry: TelemetrySample,
}

/// Synthetic treadmill with ramped telemetry
#[derive(Clone)]
pub struct SimulatedTreadmill {
    state: Arc<Mutex<SimState>>,
    on_telemetry: TelemetryCallback,
    on_status: Arc<Mutex<Option<StatusCallback>>>,
    tick_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SimulatedTreadmill {
    pub fn new(on_telemetry: TelemetryCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                status: ConnectionStatus::Disconnected,
                target_speed: 0.0,
                target_incline: 0.0,
                telemetry: TelemetrySample::default(),
            })),
            on_telemetry,
            on_status: Arc::new(Mutex::new(None)),
            tick_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a callback fired on every status transition
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.on_status.lock().unwrap() = Some(callback);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().unwrap().status
    }

    /// Latest synthetic telemetry values
    pub fn telemetry(&self) -> TelemetrySample {
        self.state.lock().unwrap().telemetry
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().unwrap().status = status;
        debug!("Simulator status: {}", status);
        if let Some(callback) = self.on_status.lock().unwrap().clone() {
            callback(status);
        }
    }

    /// Connect after the simulated handshake latency and start ticking
    pub async fn connect(&self) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);
        sleep(CONNECT_LATENCY).await;
        self.set_status(ConnectionStatus::Connected);
        info!("Simulated treadmill connected");

        let simulator = self.clone();
        *self.tick_task.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                sleep(TICK_PERIOD).await;
                if simulator.status() != ConnectionStatus::Connected {
                    break;
                }
                simulator.tick_once();
            }
        }));

        Ok(())
    }

    /// Stop ticking and zero the synthetic telemetry
    pub async fn disconnect(&self) {
        if let Some(task) = self.tick_task.lock().unwrap().take() {
            task.abort();
        }
        {
            let mut state = self.state.lock().unwrap();
            state.telemetry = TelemetrySample::default();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Ramp speed and incline toward their targets and emit one sample
    fn tick_once(&self) {
        let sample = {
            let mut state = self.state.lock().unwrap();
            let speed = approach(state.telemetry.speed_kmh, state.target_speed);
            let incline = approach(state.telemetry.incline_pct, state.target_incline);
            state.telemetry.speed_kmh = round_tenth(speed);
            state.telemetry.incline_pct = round_tenth(incline);
            state.telemetry.distance_km +=
                state.telemetry.speed_kmh / 3600.0 * TICK_PERIOD.as_secs_f64();
            state.telemetry
        };
        (self.on_telemetry)(&sample);
    }

    /// Set the belt speed target directly, bypassing any queueing
    pub fn set_target_speed(&self, speed_kmh: f64) {
        debug!("Simulator target speed {:.1} km/h", speed_kmh);
        self.state.lock().unwrap().target_speed = speed_kmh;
    }

    /// Set the incline target directly, bypassing any queueing
    pub fn set_target_incline(&self, incline_pct: f64) {
        debug!("Simulator target incline {:.1}%", incline_pct);
        self.state.lock().unwrap().target_incline = incline_pct;
    }

    /// Begin a session at a slow walking pace
    pub fn start_workout(&self) {
        self.set_target_speed(SLOW_WALK_KMH);
    }

    /// Bring the belt and incline back to rest
    pub fn stop_workout(&self) {
        let mut state = self.state.lock().unwrap();
        state.target_speed = 0.0;
        state.target_incline = 0.0;
    }
}

/// Move one ramp step toward the target, snapping when within a step
fn approach(current: f64, target: f64) -> f64 {
    let diff = target - current;
    if diff.abs() < RAMP_STEP {
        target
    } else {
        current + RAMP_STEP * diff.signum()
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[async_trait]
impl FitnessMachine for SimulatedTreadmill {
    async fn connect(&self) -> Result<()> {
        SimulatedTreadmill::connect(self).await
    }

    async fn disconnect(&self) {
        SimulatedTreadmill::disconnect(self).await
    }

    fn status(&self) -> ConnectionStatus {
        SimulatedTreadmill::status(self)
    }

    fn set_target_speed(&self, speed_kmh: f64) {
        SimulatedTreadmill::set_target_speed(self, speed_kmh)
    }

    fn set_target_incline(&self, incline_pct: f64) {
        SimulatedTreadmill::set_target_incline(self, incline_pct)
    }

    fn start_workout(&self) {
        SimulatedTreadmill::start_workout(self)
    }

    fn stop_workout(&self) {
        SimulatedTreadmill::stop_workout(self)
    }
}
