//! Treadmill connection state machine
//!
//! `TreadmillController` owns the lifecycle of one FTMS device link:
//! discovery, characteristic subscription, the RequestControl handshake,
//! teardown, and the Disconnected/Connecting/Connected/Error status value.
//! Telemetry notifications are decoded and forwarded to a callback; setter
//! calls are encoded and queued on the command dispatcher.

use crate::dispatcher::CommandDispatcher;
use crate::protocol::{self, ControlCommand, TelemetryDecoder};
use crate::transport::{FitnessMachine, NotificationSource, Transport};
use crate::types::{
    ConnectionStatus, FtmsError, Result, StatusCallback, TelemetryCallback,
};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// How long the transient Error status lasts before reverting to Disconnected
const ERROR_CLEAR_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection state machine over an abstract transport
#[derive(Clone)]
pub struct TreadmillController {
    transport: Arc<dyn Transport>,
    dispatcher: CommandDispatcher,
    status: Arc<Mutex<ConnectionStatus>>,
    decoder: Arc<Mutex<TelemetryDecoder>>,
    heart_rate: Arc<Mutex<Option<u16>>>,
    on_telemetry: TelemetryCallback,
    on_status: Arc<Mutex<Option<StatusCallback>>>,
}

impl TreadmillController {
    /// Create a controller over a transport; the dispatcher drain task starts
    /// immediately but stays idle until the connection is established
    pub fn new(transport: Arc<dyn Transport>, on_telemetry: TelemetryCallback) -> Self {
        let dispatcher = CommandDispatcher::new(transport.clone());
        Self {
            transport,
            dispatcher,
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            decoder: Arc::new(Mutex::new(TelemetryDecoder::new())),
            heart_rate: Arc::new(Mutex::new(None)),
            on_telemetry,
            on_status: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a callback fired on every status transition
    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.on_status.lock().unwrap() = Some(callback);
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut current = self.status.lock().unwrap();
            if *current == status {
                return;
            }
            *current = status;
        }
        debug!("Connection status: {}", status);
        if let Some(callback) = self.on_status.lock().unwrap().clone() {
            callback(status);
        }
    }

    /// Connect to the treadmill: discovery, subscriptions, RequestControl
    ///
    /// A user-cancelled discovery routes back to Disconnected; any other
    /// failure routes to the transient Error state, which reverts to
    /// Disconnected on its own after [`ERROR_CLEAR_TIMEOUT`].
    pub async fn connect(&self) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);

        match self.establish().await {
            Ok(()) => {
                self.dispatcher.set_connected(true);
                self.set_status(ConnectionStatus::Connected);
                info!("Treadmill connected");
                Ok(())
            }
            Err(FtmsError::Cancelled) => {
                info!("Connection attempt cancelled");
                self.set_status(ConnectionStatus::Disconnected);
                Err(FtmsError::Cancelled)
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                self.set_status(ConnectionStatus::Error);
                self.spawn_error_clear_task();
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.transport.discover().await?;
        self.decoder.lock().unwrap().reset();
        *self.heart_rate.lock().unwrap() = None;

        // Device-initiated disconnects route through the same teardown path
        // as an explicit disconnect() call
        let (link_lost_tx, mut link_lost_rx) = mpsc::channel::<()>(1);
        self.transport.set_link_lost_sender(link_lost_tx);
        let controller = self.clone();
        tokio::spawn(async move {
            if link_lost_rx.recv().await.is_some() {
                info!("Device closed the connection");
                controller.disconnect().await;
            }
        });

        let decoder = self.decoder.clone();
        let heart_rate = self.heart_rate.clone();
        let on_telemetry = self.on_telemetry.clone();
        self.transport
            .subscribe(
                NotificationSource::TreadmillData,
                Arc::new(move |data| {
                    let decoded = decoder.lock().unwrap().decode(data);
                    match decoded {
                        Ok(mut sample) => {
                            sample.heart_rate_bpm = *heart_rate.lock().unwrap();
                            on_telemetry(&sample);
                        }
                        // Malformed notification: drop the sample, keep going
                        Err(e) => debug!("Dropping telemetry frame: {}", e),
                    }
                }),
            )
            .await?;

        // Heart rate is best-effort; many treadmills do not expose it
        let heart_rate = self.heart_rate.clone();
        let heart_rate_result = self
            .transport
            .subscribe(
                NotificationSource::HeartRate,
                Arc::new(move |data| match protocol::decode_heart_rate(data) {
                    Ok(bpm) => *heart_rate.lock().unwrap() = Some(bpm),
                    Err(e) => debug!("Dropping heart rate frame: {}", e),
                }),
            )
            .await;
        if let Err(e) = heart_rate_result {
            warn!("Heart rate service not available: {}", e);
        }

        self.transport
            .write(&ControlCommand::RequestControl.encode())
            .await?;

        Ok(())
    }

    fn spawn_error_clear_task(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            sleep(ERROR_CLEAR_TIMEOUT).await;
            let still_error = {
                let mut status = controller.status.lock().unwrap();
                if *status == ConnectionStatus::Error {
                    *status = ConnectionStatus::Disconnected;
                    true
                } else {
                    false
                }
            };
            if still_error {
                debug!("Connection status: {}", ConnectionStatus::Disconnected);
                if let Some(callback) = controller.on_status.lock().unwrap().clone() {
                    callback(ConnectionStatus::Disconnected);
                }
            }
        });
    }

    /// Tear the connection down from any state
    ///
    /// Unsubscribes notifications, drops the link, and discards all pending
    /// commands together with the in-flight marker.
    pub async fn disconnect(&self) {
        self.dispatcher.set_connected(false);
        self.dispatcher.clear();
        self.transport.teardown().await;
        self.decoder.lock().unwrap().reset();
        *self.heart_rate.lock().unwrap() = None;
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Queue a target speed command
    pub fn set_target_speed(&self, speed_kmh: f64) {
        self.dispatcher.push(ControlCommand::SetTargetSpeed(speed_kmh));
    }

    /// Queue a target incline command
    pub fn set_target_incline(&self, incline_pct: f64) {
        self.dispatcher.push(ControlCommand::SetTargetIncline(incline_pct));
    }

    /// Queue a start command
    pub fn start_workout(&self) {
        self.dispatcher.push(ControlCommand::Start);
    }

    /// Queue a stop command
    pub fn stop_workout(&self) {
        self.dispatcher.push(ControlCommand::Stop);
    }

    /// Number of commands waiting to be written
    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending()
    }
}

#[async_trait]
impl FitnessMachine for TreadmillController {
    async fn connect(&self) -> Result<()> {
        TreadmillController::connect(self).await
    }

    async fn disconnect(&self) {
        TreadmillController::disconnect(self).await
    }

    fn status(&self) -> ConnectionStatus {
        TreadmillController::status(self)
    }

    fn set_target_speed(&self, speed_kmh: f64) {
        TreadmillController::set_target_speed(self, speed_kmh)
    }

    fn set_target_incline(&self, incline_pct: f64) {
        TreadmillController::set_target_incline(self, incline_pct)
    }

    fn start_workout(&self) {
        TreadmillController::start_workout(self)
    }

    fn stop_workout(&self) {
        TreadmillController::stop_workout(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NotificationCallback;
    use crate::types::TelemetrySample;

    #[derive(Default)]
    struct MockState {
        telemetry_callback: Option<NotificationCallback>,
        heart_rate_callback: Option<NotificationCallback>,
        writes: Vec<Vec<u8>>,
        link_lost_tx: Option<mpsc::Sender<()>>,
        torn_down: bool,
    }

    struct MockTransport {
        state: Mutex<MockState>,
        discover_result: Mutex<Option<FtmsError>>,
        heart_rate_available: bool,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState::default()),
                discover_result: Mutex::new(None),
                heart_rate_available: true,
            })
        }

        fn failing(error: FtmsError) -> Arc<Self> {
            let transport = Self::new();
            *transport.discover_result.lock().unwrap() = Some(error);
            transport
        }

        fn without_heart_rate() -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(MockState::default()),
                discover_result: Mutex::new(None),
                heart_rate_available: false,
            })
        }

        fn push_telemetry(&self, data: &[u8]) {
            let callback = self.state.lock().unwrap().telemetry_callback.clone();
            callback.expect("telemetry subscription missing")(data);
        }

        fn push_heart_rate(&self, data: &[u8]) {
            let callback = self.state.lock().unwrap().heart_rate_callback.clone();
            callback.expect("heart rate subscription missing")(data);
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn discover(&self) -> Result<()> {
            match self.discover_result.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn subscribe(
            &self,
            source: NotificationSource,
            callback: NotificationCallback,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            match source {
                NotificationSource::TreadmillData => state.telemetry_callback = Some(callback),
                NotificationSource::HeartRate => {
                    if !self.heart_rate_available {
                        return Err(FtmsError::CharacteristicNotFound("2a37".into()));
                    }
                    state.heart_rate_callback = Some(callback);
                }
            }
            Ok(())
        }

        async fn write(&self, data: &[u8]) -> Result<()> {
            self.state.lock().unwrap().writes.push(data.to_vec());
            Ok(())
        }

        fn set_link_lost_sender(&self, sender: mpsc::Sender<()>) {
            self.state.lock().unwrap().link_lost_tx = Some(sender);
        }

        async fn teardown(&self) {
            self.state.lock().unwrap().torn_down = true;
        }
    }

    fn sample_recorder() -> (TelemetryCallback, Arc<Mutex<Vec<TelemetrySample>>>) {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let callback: TelemetryCallback = Arc::new(move |sample: &TelemetrySample| {
            sink.lock().unwrap().push(*sample);
        });
        (callback, samples)
    }

    fn status_recorder(
        controller: &TreadmillController,
    ) -> Arc<Mutex<Vec<ConnectionStatus>>> {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        controller.set_status_callback(Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        }));
        statuses
    }

    #[tokio::test]
    async fn test_connect_success() {
        let transport = MockTransport::new();
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);
        let statuses = status_recorder(&controller);

        controller.connect().await.unwrap();

        assert_eq!(controller.status(), ConnectionStatus::Connected);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );

        // RequestControl was written directly during the handshake
        let writes = transport.state.lock().unwrap().writes.clone();
        assert_eq!(writes, vec![vec![0x00]]);
    }

    #[tokio::test]
    async fn test_telemetry_flows_with_heart_rate_merged() {
        let transport = MockTransport::new();
        let (callback, samples) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);

        controller.connect().await.unwrap();

        transport.push_heart_rate(&[0x00, 0x8C]);
        // Flags 0x0002: speed 5.00 km/h
        transport.push_telemetry(&[0x02, 0x00, 0xF4, 0x01]);

        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert!((samples[0].speed_kmh - 5.0).abs() < 0.01);
        assert_eq!(samples[0].heart_rate_bpm, Some(140));
    }

    #[tokio::test]
    async fn test_malformed_telemetry_is_dropped() {
        let transport = MockTransport::new();
        let (callback, samples) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);

        controller.connect().await.unwrap();
        transport.push_telemetry(&[0x02]);

        assert!(samples.lock().unwrap().is_empty());
        assert_eq!(controller.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_missing_heart_rate_service_does_not_fail_connect() {
        let transport = MockTransport::without_heart_rate();
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport, callback);

        controller.connect().await.unwrap();
        assert_eq!(controller.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_enters_error_then_auto_clears() {
        let transport = MockTransport::failing(FtmsError::Transport("no adapter".into()));
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport, callback);

        assert!(controller.connect().await.is_err());
        assert_eq!(controller.status(), ConnectionStatus::Error);

        sleep(ERROR_CLEAR_TIMEOUT + Duration::from_millis(100)).await;
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_discovery_goes_to_disconnected() {
        let transport = MockTransport::failing(FtmsError::Cancelled);
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport, callback);

        assert!(controller.connect().await.is_err());
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_clears_queue_and_tears_down() {
        let transport = MockTransport::new();
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);

        controller.connect().await.unwrap();
        controller.disconnect().await;

        controller.set_target_speed(9.0);
        controller.set_target_incline(2.0);
        assert_eq!(controller.pending_commands(), 2);

        controller.disconnect().await;
        assert_eq!(controller.pending_commands(), 0);
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
        assert!(transport.state.lock().unwrap().torn_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_driven_disconnect_routes_through_teardown() {
        let transport = MockTransport::new();
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);

        controller.connect().await.unwrap();

        let sender = transport.state.lock().unwrap().link_lost_tx.clone().unwrap();
        sender.send(()).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
        assert!(transport.state.lock().unwrap().torn_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setters_queue_in_order_and_write_fifo() {
        let transport = MockTransport::new();
        let (callback, _) = sample_recorder();
        let controller = TreadmillController::new(transport.clone(), callback);

        controller.connect().await.unwrap();
        controller.set_target_speed(8.5);
        controller.set_target_incline(1.5);
        controller.start_workout();

        sleep(Duration::from_secs(1)).await;

        let writes = transport.state.lock().unwrap().writes.clone();
        assert_eq!(
            writes,
            vec![
                ControlCommand::RequestControl.encode(),
                ControlCommand::SetTargetSpeed(8.5).encode(),
                ControlCommand::SetTargetIncline(1.5).encode(),
                ControlCommand::Start.encode(),
            ]
        );
    }
}
