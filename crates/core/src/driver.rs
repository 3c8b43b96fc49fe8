//! Runs a [`ConnectionMachine`] against a real (or simulated) radio.
//!
//! One tokio task per link consumes a single `mpsc` queue of [`LinkInput`]s:
//! requests from the [`LinkHandle`], callbacks pushed by the [`Central`],
//! relay results and timer ticks. Inputs are handled strictly one at a time,
//! and the actions each one produces are performed before the next input is
//! taken. A radio operation that fails is fed back to the machine as an input
//! rather than only logged. Dropping the handle aborts the task, which drops
//! the timer, the central and any relay poller with it.

use crate::connection::{Clock, ConnectionMachine, LinkAction, LinkInput};
use crate::error::{Error, RadioError, Result};
use crate::events::LinkEvent;
use crate::metrics::LinkMetrics;
use crate::profile::PeripheralId;
use crate::relay::RelaySpawner;
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of a link's input queue.
pub const INPUT_QUEUE_CAPACITY: usize = 256;

/// BLE central operations.
///
/// Calls only start an operation. Its outcome comes back later as a
/// [`LinkInput`] on the sender the central was built with (`Discovered`,
/// `Connected`, `Notification`, ...).
pub trait Central: Send {
    fn start_scan(&mut self, service: Option<Uuid>) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;

    fn stop_scan(&mut self) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;

    fn connect(&mut self, peripheral: &PeripheralId) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;

    fn cancel_connection(
        &mut self,
        peripheral: &PeripheralId,
    ) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;

    fn write(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;

    fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> impl Future<Output = std::result::Result<(), RadioError>> + Send;
}

/// Central for links without a radio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCentral;

impl Central for NullCentral {
    async fn start_scan(&mut self, _service: Option<Uuid>) -> std::result::Result<(), RadioError> {
        Err(RadioError::NotPowered)
    }

    async fn stop_scan(&mut self) -> std::result::Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&mut self, peripheral: &PeripheralId) -> std::result::Result<(), RadioError> {
        Err(RadioError::UnknownPeripheral(peripheral.0.clone()))
    }

    async fn cancel_connection(&mut self, _peripheral: &PeripheralId) -> std::result::Result<(), RadioError> {
        Ok(())
    }

    async fn write(
        &mut self,
        peripheral: &PeripheralId,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> std::result::Result<(), RadioError> {
        Err(RadioError::UnknownPeripheral(peripheral.0.clone()))
    }

    async fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        _characteristic: Uuid,
    ) -> std::result::Result<(), RadioError> {
        Err(RadioError::UnknownPeripheral(peripheral.0.clone()))
    }
}

/// Input time for the machine, read from tokio's clock so paused-time tests
/// see sweeps happen.
fn clock() -> Clock {
    Clock {
        instant: tokio::time::Instant::now().into_std(),
        wall: chrono::Utc::now(),
    }
}

struct LinkDriver<C: Central> {
    machine: ConnectionMachine,
    central: C,
    inputs: mpsc::Receiver<LinkInput>,
    /// Kept to hand to relay pollers
    input_tx: mpsc::Sender<LinkInput>,
    /// Follow-up inputs produced while performing actions
    pending: VecDeque<LinkInput>,
    events: mpsc::Sender<LinkEvent>,
    relay: Option<RelaySpawner>,
    relay_task: Option<JoinHandle<()>>,
}

impl<C: Central> LinkDriver<C> {
    async fn run(mut self, tick_period: std::time::Duration) -> LinkMetrics {
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let input = match self.pending.pop_front() {
                Some(input) => input,
                None => tokio::select! {
                    input = self.inputs.recv() => match input {
                        Some(input) => input,
                        None => break,
                    },
                    _ = ticker.tick() => LinkInput::Tick,
                },
            };

            let shutdown = matches!(input, LinkInput::Shutdown);
            let actions = self.machine.handle(input, clock());
            for action in actions {
                self.perform(action).await;
            }
            if shutdown {
                break;
            }
        }

        self.stop_relay();
        self.machine.into_metrics()
    }

    fn stop_relay(&mut self) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
    }

    async fn perform(&mut self, action: LinkAction) {
        let outcome = match action {
            LinkAction::Emit(event) => {
                if self.events.send(event).await.is_err() {
                    debug!("event receiver dropped");
                }
                Ok(())
            }
            LinkAction::StartRelay => {
                if self.relay_task.is_none() {
                    match self.relay.as_mut() {
                        Some(spawn) => self.relay_task = Some(spawn(self.input_tx.clone())),
                        None => warn!("relay link started without a relay client"),
                    }
                }
                Ok(())
            }
            LinkAction::StopRelay => {
                self.stop_relay();
                Ok(())
            }
            LinkAction::StartScan { service } => {
                if let Err(err) = self.central.start_scan(service).await {
                    self.pending.push_back(LinkInput::ScanFailed {
                        reason: err.to_string(),
                    });
                }
                Ok(())
            }
            LinkAction::StopScan => self.central.stop_scan().await,
            LinkAction::Connect(peripheral) => {
                if let Err(err) = self.central.connect(&peripheral).await {
                    self.pending.push_back(LinkInput::ConnectFailed {
                        peripheral,
                        reason: err.to_string(),
                    });
                }
                Ok(())
            }
            LinkAction::CancelConnection(peripheral) => {
                // no disconnect callback will follow a failed cancel
                if let Err(err) = self.central.cancel_connection(&peripheral).await {
                    self.pending.push_back(LinkInput::Disconnected {
                        peripheral,
                        reason: Some(err.to_string()),
                    });
                }
                Ok(())
            }
            LinkAction::Write {
                peripheral,
                characteristic,
                value,
            } => {
                if let Err(err) = self.central.write(&peripheral, characteristic, &value).await {
                    self.pending.push_back(LinkInput::RadioFailed {
                        peripheral,
                        reason: err.to_string(),
                    });
                }
                Ok(())
            }
            LinkAction::Subscribe {
                peripheral,
                characteristic,
            } => {
                if let Err(err) = self.central.subscribe(&peripheral, characteristic).await {
                    self.pending.push_back(LinkInput::RadioFailed {
                        peripheral,
                        reason: err.to_string(),
                    });
                }
                Ok(())
            }
        };

        if let Err(err) = outcome {
            warn!(error = %err, "radio operation failed");
        }
    }
}

/// Owner's end of a running link.
pub struct LinkHandle {
    inputs: mpsc::Sender<LinkInput>,
    task: Option<JoinHandle<LinkMetrics>>,
}

impl LinkHandle {
    /// Queue an input as if it came from the radio or the user.
    pub async fn send(&self, input: LinkInput) -> Result<()> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| Error::Channel("link task has stopped".into()))
    }

    pub async fn connect(&self) -> Result<()> {
        self.send(LinkInput::Connect).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.send(LinkInput::Disconnect).await
    }

    /// Sender for the link's input queue.
    pub fn inputs(&self) -> mpsc::Sender<LinkInput> {
        self.inputs.clone()
    }

    /// Disconnect, stop the task and return what it counted.
    pub async fn shutdown(mut self) -> Result<LinkMetrics> {
        let task = self
            .task
            .take()
            .ok_or_else(|| Error::Channel("link already stopped".into()))?;
        // a closed queue means the task already ended on its own
        let _ = self.inputs.send(LinkInput::Shutdown).await;
        task.await
            .map_err(|err| Error::Channel(format!("link task failed: {err}")))
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start a link task.
///
/// `make_central` receives the sender the central must push its callbacks
/// into. `relay` is required for polling profiles and ignored otherwise.
pub fn spawn_link<C, F>(
    machine: ConnectionMachine,
    tick_period: std::time::Duration,
    make_central: F,
    relay: Option<RelaySpawner>,
    events: mpsc::Sender<LinkEvent>,
) -> LinkHandle
where
    C: Central + 'static,
    F: FnOnce(mpsc::Sender<LinkInput>) -> C,
{
    let (input_tx, inputs) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    let central = make_central(input_tx.clone());

    let driver = LinkDriver {
        machine,
        central,
        inputs,
        input_tx: input_tx.clone(),
        pending: VecDeque::new(),
        events,
        relay,
        relay_task: None,
    };
    let task = tokio::spawn(driver.run(tick_period));

    LinkHandle {
        inputs: input_tx,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LinkConfig;
    use crate::events::{ConnectionState, LinkError, LinkErrorKind};
    use crate::profile::DirectProfile;
    use crate::store::{KeyValueStore, MemoryStore, UnlockCounter};
    use std::sync::Arc;
    use std::time::Duration;

    fn machine() -> ConnectionMachine {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let counter = UnlockCounter::new(store.clone());
        ConnectionMachine::new(Box::new(DirectProfile), LinkConfig::default(), None, store, counter)
    }

    #[tokio::test]
    async fn test_shutdown_returns_metrics() {
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = spawn_link(machine(), Duration::from_millis(10), |_| NullCentral, None, events_tx);

        handle.send(LinkInput::PoweredOn).await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::State(ConnectionState::Disconnected)));

        let metrics = handle.shutdown().await.unwrap();
        assert!(metrics.end_time.is_some());
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported() {
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = spawn_link(machine(), Duration::from_millis(10), |_| NullCentral, None, events_tx);

        handle.send(LinkInput::PoweredOn).await.unwrap();
        handle.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::State(ConnectionState::Disconnected)));
        assert_eq!(events.recv().await, Some(LinkEvent::State(ConnectionState::Scanning)));
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::Error(LinkError {
                kind: LinkErrorKind::Radio,
                critical: false,
                ..
            }))
        ));
        assert_eq!(events.recv().await, Some(LinkEvent::State(ConnectionState::Disconnected)));

        // the next request tries again
        handle.connect().await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::State(ConnectionState::Scanning)));

        let metrics = handle.shutdown().await.unwrap();
        assert!(metrics.radio_failures >= 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_task() {
        let (events_tx, mut events) = mpsc::channel(16);
        let handle = spawn_link(machine(), Duration::from_millis(10), |_| NullCentral, None, events_tx);
        drop(handle);
        // the task owned the only event sender
        assert_eq!(events.recv().await, None);
    }
}
