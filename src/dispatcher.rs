//! Serialized command dispatch for the fitness machine control point
//!
//! FTMS control points reject overlapping writes, so every command goes
//! through a FIFO queue drained by a single background task. At most one
//! command is in flight at any time; producers append to the tail from any
//! task without waiting. A failed write is logged and the queue drains
//! onward; there are no retries.

use crate::protocol::ControlCommand;
use crate::transport::Transport;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

struct DispatcherState {
    queue: VecDeque<ControlCommand>,
    in_flight: bool,
    connected: bool,
}

/// FIFO command queue with a single-flight drain task
#[derive(Clone)]
pub struct CommandDispatcher {
    state: Arc<Mutex<DispatcherState>>,
    wakeup: Arc<Notify>,
    shutdown_tx: mpsc::Sender<()>,
}

impl CommandDispatcher {
    /// Create the dispatcher and spawn its drain task
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let state = Arc::new(Mutex::new(DispatcherState {
            queue: VecDeque::new(),
            in_flight: false,
            connected: false,
        }));
        let wakeup = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task_state = state.clone();
        let task_wakeup = wakeup.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_wakeup.notified() => {}
                    _ = shutdown_rx.recv() => {
                        debug!("Dispatcher drain task stopping");
                        break;
                    }
                }
                Self::drain(&task_state, &transport).await;
            }
        });

        Self {
            state,
            wakeup,
            shutdown_tx,
        }
    }

    /// Issue queued commands one at a time until the queue is empty, the
    /// connection drops, or another invocation holds the flight slot
    async fn drain(state: &Arc<Mutex<DispatcherState>>, transport: &Arc<dyn Transport>) {
        loop {
            let command = {
                let mut state = state.lock().unwrap();
                if state.in_flight || !state.connected {
                    return;
                }
                match state.queue.pop_front() {
                    Some(command) => {
                        state.in_flight = true;
                        command
                    }
                    None => return,
                }
            };

            let result = transport.write(&command.encode()).await;
            state.lock().unwrap().in_flight = false;

            match result {
                Ok(()) => debug!("Sent {}", command),
                Err(e) => warn!("{}, continuing with next command", e),
            }
        }
    }

    /// Append a command to the tail; accepted in any connection state
    pub fn push(&self, command: ControlCommand) {
        self.state.lock().unwrap().queue.push_back(command);
        self.wakeup.notify_one();
    }

    /// Gate draining on the connection state
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
        if connected {
            self.wakeup.notify_one();
        }
    }

    /// Drop all pending commands and the in-flight marker
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.in_flight = false;
    }

    /// Number of commands waiting in the queue
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Stop the drain task
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NotificationCallback, NotificationSource};
    use crate::types::{FtmsError, Result};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::sleep;

    /// Records write entry/exit so tests can assert ordering and exclusivity
    struct RecordingTransport {
        events: Mutex<Vec<(String, Vec<u8>)>>,
        fail_writes: Mutex<bool>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                fail_writes: Mutex::new(false),
            })
        }

        fn events(&self) -> Vec<(String, Vec<u8>)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn discover(&self) -> Result<()> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _source: NotificationSource,
            _callback: NotificationCallback,
        ) -> Result<()> {
            Ok(())
        }

        async fn write(&self, data: &[u8]) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(("start".into(), data.to_vec()));
            sleep(Duration::from_millis(10)).await;
            self.events
                .lock()
                .unwrap()
                .push(("end".into(), data.to_vec()));

            if *self.fail_writes.lock().unwrap() {
                Err(FtmsError::CommandWrite("device rejected write".into()))
            } else {
                Ok(())
            }
        }

        fn set_link_lost_sender(&self, _sender: mpsc::Sender<()>) {}

        async fn teardown(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_are_fifo_and_never_overlap() {
        let transport = RecordingTransport::new();
        let dispatcher = CommandDispatcher::new(transport.clone());
        dispatcher.set_connected(true);

        let commands = [
            ControlCommand::RequestControl,
            ControlCommand::SetTargetSpeed(8.0),
            ControlCommand::SetTargetIncline(1.0),
            ControlCommand::SetTargetSpeed(10.0),
        ];
        for command in commands {
            dispatcher.push(command);
        }

        sleep(Duration::from_secs(1)).await;

        let events = transport.events();
        assert_eq!(events.len(), commands.len() * 2);

        // Strict alternation: each write finishes before the next starts
        for (i, (kind, data)) in events.iter().enumerate() {
            let expected = &commands[i / 2];
            assert_eq!(kind, if i % 2 == 0 { "start" } else { "end" });
            assert_eq!(data, &expected.encode());
        }

        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_holds_commands_while_disconnected() {
        let transport = RecordingTransport::new();
        let dispatcher = CommandDispatcher::new(transport.clone());

        dispatcher.push(ControlCommand::SetTargetSpeed(6.0));
        dispatcher.push(ControlCommand::SetTargetSpeed(7.0));
        sleep(Duration::from_secs(1)).await;

        assert!(transport.events().is_empty());
        assert_eq!(dispatcher.pending(), 2);

        dispatcher.set_connected(true);
        sleep(Duration::from_secs(1)).await;

        assert_eq!(transport.events().len(), 4);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_does_not_stop_draining() {
        let transport = RecordingTransport::new();
        *transport.fail_writes.lock().unwrap() = true;

        let dispatcher = CommandDispatcher::new(transport.clone());
        dispatcher.set_connected(true);

        dispatcher.push(ControlCommand::SetTargetSpeed(6.0));
        dispatcher.push(ControlCommand::SetTargetSpeed(7.0));
        dispatcher.push(ControlCommand::Stop);
        sleep(Duration::from_secs(1)).await;

        // All three writes were attempted exactly once, in order
        let starts: Vec<_> = transport
            .events()
            .into_iter()
            .filter(|(kind, _)| kind == "start")
            .collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[2].1, ControlCommand::Stop.encode());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_pending_commands() {
        let transport = RecordingTransport::new();
        let dispatcher = CommandDispatcher::new(transport.clone());

        dispatcher.push(ControlCommand::SetTargetSpeed(6.0));
        dispatcher.push(ControlCommand::SetTargetSpeed(7.0));
        dispatcher.clear();
        dispatcher.set_connected(true);
        sleep(Duration::from_secs(1)).await;

        assert!(transport.events().is_empty());
    }
}
