//! ftmsd: FTMS treadmill control daemon
//!
//! Connects to an FTMS treadmill over BlueZ (or the built-in simulator),
//! streams its telemetry, and optionally executes a workout file by feeding
//! scheduled setpoints to the machine. The BlueZ-specific plumbing lives
//! here; everything above it works against the `Transport` and
//! `FitnessMachine` traits from the library.

use bluer::{gatt::remote::Characteristic, Adapter, Address, Session};
use clap::Parser;
use ftmsd::{
    parse_icu, parse_zwo, FitnessMachine, FtmsError, IcuSettings, NotificationCallback,
    NotificationSource, SimulatedTreadmill, TelemetryCallback, TelemetrySample, Transport,
    TreadmillController, Workout, WorkoutScheduler, WorkoutStep, CONTROL_POINT_UUID,
    HEART_RATE_MEASUREMENT_UUID, TREADMILL_DATA_UUID,
};
use futures::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "ftmsd")]
#[command(about = "Control an FTMS treadmill over Bluetooth LE")]
struct Args {
    /// Bluetooth MAC address of the treadmill (format: AA:BB:CC:DD:EE:FF)
    #[arg(value_name = "MAC_ADDRESS", required_unless_present = "simulate")]
    mac_address: Option<String>,

    /// Run against the built-in simulator instead of a real device
    #[arg(long)]
    simulate: bool,

    /// Workout file to execute (.zwo interval XML or .txt interval text)
    #[arg(long)]
    workout: Option<PathBuf>,

    /// Threshold pace per km (mm:ss) for percentage-based text workouts
    #[arg(long, default_value = "4:30")]
    threshold_pace: String,

    /// Print telemetry as JSON lines instead of log output
    #[arg(long)]
    json: bool,

    /// Parse the workout file, print it as JSON and exit
    #[arg(long, requires = "workout")]
    dump: bool,
}

// ============================================================================
// Real Bluetooth Transport using BlueR
// ============================================================================

struct BlueZTransport {
    adapter: Adapter,
    address: Address,
    device: Mutex<Option<bluer::Device>>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    listener_shutdown: Mutex<Vec<mpsc::Sender<()>>>,
    link_lost_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl BlueZTransport {
    async fn new(mac_address: &str) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let address: Address = mac_address.parse().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid MAC address: {}", mac_address),
            )
        })?;

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        Ok(Self {
            adapter,
            address,
            device: Mutex::new(None),
            characteristics: Mutex::new(HashMap::new()),
            listener_shutdown: Mutex::new(Vec::new()),
            link_lost_tx: Mutex::new(None),
        })
    }
}

/// Map BlueZ errors onto the daemon taxonomy; an aborted discovery becomes
/// a cancellation rather than a hard failure
fn transport_error(error: bluer::Error) -> FtmsError {
    if error.kind == bluer::ErrorKind::NotFound {
        FtmsError::Cancelled
    } else {
        FtmsError::Transport(error.to_string())
    }
}

#[async_trait::async_trait]
impl Transport for BlueZTransport {
    async fn discover(&self) -> ftmsd::Result<()> {
        let device = self.adapter.device(self.address).map_err(transport_error)?;

        info!("Connecting to treadmill {}...", self.address);
        if !device.is_connected().await.map_err(transport_error)? {
            device.connect().await.map_err(transport_error)?;
        }

        // BlueZ resolves GATT services in the background after connecting
        let mut attempts = 0u32;
        while !device.is_services_resolved().await.map_err(transport_error)? {
            attempts += 1;
            if attempts >= 30 {
                return Err(FtmsError::Transport(
                    "timeout waiting for GATT services".to_string(),
                ));
            }
            sleep(Duration::from_secs(1)).await;
        }

        let mut found = HashMap::new();
        for service in device.services().await.map_err(transport_error)? {
            for characteristic in service.characteristics().await.map_err(transport_error)? {
                let uuid = characteristic.uuid().await.map_err(transport_error)?;
                found.insert(uuid, characteristic);
            }
        }
        debug!("Resolved {} characteristics", found.len());

        for (uuid, label) in [
            (TREADMILL_DATA_UUID, "treadmill data"),
            (CONTROL_POINT_UUID, "control point"),
        ] {
            if !found.contains_key(&uuid) {
                return Err(FtmsError::CharacteristicNotFound(format!(
                    "{} ({})",
                    uuid, label
                )));
            }
        }

        *self.characteristics.lock().unwrap() = found;
        *self.device.lock().unwrap() = Some(device);
        Ok(())
    }

    async fn subscribe(
        &self,
        source: NotificationSource,
        callback: NotificationCallback,
    ) -> ftmsd::Result<()> {
        let uuid = match source {
            NotificationSource::TreadmillData => TREADMILL_DATA_UUID,
            NotificationSource::HeartRate => HEART_RATE_MEASUREMENT_UUID,
        };
        let characteristic = self
            .characteristics
            .lock()
            .unwrap()
            .get(&uuid)
            .cloned()
            .ok_or_else(|| FtmsError::CharacteristicNotFound(uuid.to_string()))?;

        let stream = characteristic.notify().await.map_err(transport_error)?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.listener_shutdown.lock().unwrap().push(shutdown_tx);

        // A dying telemetry stream means the device dropped the link
        let link_lost = match source {
            NotificationSource::TreadmillData => self.link_lost_tx.lock().unwrap().clone(),
            NotificationSource::HeartRate => None,
        };

        tokio::spawn(async move {
            let mut stream = Box::pin(stream);
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(value) => callback(&value),
                        None => {
                            debug!("Notification stream for {} ended", uuid);
                            if let Some(tx) = &link_lost {
                                let _ = tx.try_send(());
                            }
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    async fn write(&self, data: &[u8]) -> ftmsd::Result<()> {
        let characteristic = self
            .characteristics
            .lock()
            .unwrap()
            .get(&CONTROL_POINT_UUID)
            .cloned()
            .ok_or_else(|| FtmsError::CharacteristicNotFound(CONTROL_POINT_UUID.to_string()))?;

        characteristic
            .write(data)
            .await
            .map_err(|e| FtmsError::CommandWrite(e.to_string()))
    }

    fn set_link_lost_sender(&self, sender: mpsc::Sender<()>) {
        *self.link_lost_tx.lock().unwrap() = Some(sender);
    }

    async fn teardown(&self) {
        for shutdown in self.listener_shutdown.lock().unwrap().drain(..) {
            let _ = shutdown.try_send(());
        }
        self.link_lost_tx.lock().unwrap().take();
        self.characteristics.lock().unwrap().clear();

        let device = self.device.lock().unwrap().take();
        if let Some(device) = device {
            if let Err(e) = device.disconnect().await {
                debug!("Device disconnect: {}", e);
            }
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn load_workout_file(path: &Path, threshold_pace: &str) -> ftmsd::Result<Workout> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("zwo") | Some("xml") => parse_zwo(&content),
        _ => parse_icu(
            &content,
            &IcuSettings {
                threshold_pace: threshold_pace.to_string(),
            },
        ),
    }
}

fn telemetry_printer(json: bool) -> TelemetryCallback {
    if json {
        Arc::new(|sample: &TelemetrySample| {
            let line = serde_json::json!({
                "timestamp": chrono::Local::now().to_rfc3339(),
                "speed_kmh": sample.speed_kmh,
                "incline_pct": sample.incline_pct,
                "distance_km": sample.distance_km,
                "heart_rate_bpm": sample.heart_rate_bpm,
            });
            println!("{}", line);
        })
    } else {
        Arc::new(|sample: &TelemetrySample| match sample.heart_rate_bpm {
            Some(bpm) => info!(
                "{:.1} km/h, {:.1}% incline, {:.3} km, {} bpm",
                sample.speed_kmh, sample.incline_pct, sample.distance_km, bpm
            ),
            None => info!(
                "{:.1} km/h, {:.1}% incline, {:.3} km",
                sample.speed_kmh, sample.incline_pct, sample.distance_km
            ),
        })
    }
}

/// Resolve once the loaded workout has run to completion
async fn wait_until_finished(scheduler: &WorkoutScheduler) {
    loop {
        sleep(Duration::from_millis(500)).await;
        if scheduler.workout().is_some() && scheduler.is_finished() {
            break;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let workout = match &args.workout {
        Some(path) => Some(load_workout_file(path, &args.threshold_pace)?),
        None => None,
    };

    if args.dump {
        let workout = workout.expect("clap enforces --workout with --dump");
        println!("{}", serde_json::to_string_pretty(&workout)?);
        return Ok(());
    }

    let machine: Arc<dyn FitnessMachine> = if args.simulate {
        info!("Using the simulated treadmill backend");
        let simulator = SimulatedTreadmill::new(telemetry_printer(args.json));
        simulator.set_status_callback(Arc::new(|status| info!("Connection status: {}", status)));
        Arc::new(simulator)
    } else {
        let mac_address = args
            .mac_address
            .as_deref()
            .expect("clap requires MAC_ADDRESS without --simulate");
        let transport = BlueZTransport::new(mac_address).await?;
        let controller =
            TreadmillController::new(Arc::new(transport), telemetry_printer(args.json));
        controller.set_status_callback(Arc::new(|status| info!("Connection status: {}", status)));
        Arc::new(controller)
    };

    machine.connect().await?;

    let setpoints = machine.clone();
    let scheduler = WorkoutScheduler::new(Arc::new(move |step: &WorkoutStep| {
        info!(
            "Workout step: {} s, speed {:?} km/h, incline {:?}%",
            step.duration_s, step.speed_kmh, step.incline_pct
        );
        if let Some(speed) = step.speed_kmh {
            setpoints.set_target_speed(speed);
        }
        if let Some(incline) = step.incline_pct {
            setpoints.set_target_incline(incline);
        }
    }));

    if let Some(workout) = workout {
        info!(
            "Executing workout \"{}\" ({} steps, {} s total)",
            workout.name,
            workout.steps.len(),
            workout.total_duration_s()
        );
        scheduler.load_workout(Some(workout));
        machine.start_workout();
        scheduler.play();
    } else {
        info!("No workout loaded, streaming telemetry only (Ctrl-C to exit)");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
        _ = wait_until_finished(&scheduler) => info!("Workout complete"),
    }

    scheduler.stop();
    machine.stop_workout();
    // Let the stop command drain before the link goes away
    sleep(Duration::from_millis(500)).await;
    machine.disconnect().await;

    Ok(())
}
