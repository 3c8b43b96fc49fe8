//! Sans-IO connection state machine.
//!
//! [`ConnectionMachine`] consumes [`LinkInput`]s (user requests, radio
//! callbacks, relay results, timer ticks) and answers with [`LinkAction`]s for
//! the driver to perform. It never touches a radio or a socket itself, which
//! keeps every policy decision testable with plain function calls.
//!
//! # Reconnection policy
//!
//! - a connect request sets `stay_connected`; a disconnect request clears it
//! - on power-on with `stay_connected` set, reconnect by the known peripheral
//!   id, otherwise scan with the profile's address filter
//! - any unexpected disconnect or connect failure while `stay_connected` is set
//!   reconnects at once, without backoff
//! - a failed connect to a remembered id forgets it and falls back to scanning
//! - a failed write or subscription on a live link cancels the connection, and
//!   the resulting disconnect callback reconnects
//! - a failed scan is reported and waits for the next connect request or
//!   power-on
//! - relay credential errors clear `stay_connected`; they are never retried

use crate::calibration::Calibration;
use crate::error::Error;
use crate::events::{ConnectionState, LinkError, LinkErrorKind, LinkEvent};
use crate::metrics::LinkMetrics;
use crate::parser::parse_frame;
use crate::profile::{Advertisement, Delivery, LinkProfile, PeripheralId, UnlockContext};
use crate::reading::{GlucoseReading, ReadingBatch};
use crate::reassembly::FragmentReassembler;
use crate::sensor::{SensorIdentity, SensorLifecycle, DEFAULT_MAX_LIFE_MINUTES};
use crate::store::{KeyValueStore, UnlockCounter, PERIPHERAL_ID_KEY};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Link tuning.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Partial frames older than this are dropped
    pub stale_fragment_timeout: Duration,
    /// Period of the timer that sweeps stale fragments
    pub tick_period: Duration,
    /// Minimum sensor age, in minutes, between two emitted reading batches
    pub sampling_interval_minutes: u32,
    /// Only connect to a peripheral advertising this address
    pub expected_address: Option<String>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            stale_fragment_timeout: Duration::from_secs(5),
            tick_period: Duration::from_secs(1),
            sampling_interval_minutes: 1,
            expected_address: None,
        }
    }
}

/// Sensor a BLE link streams from.
#[derive(Debug, Clone)]
pub struct SensorBinding {
    pub identity: SensorIdentity,
    pub calibration: Calibration,
    /// Code established by the enable-streaming command during pairing
    pub enable_time: u32,
    pub max_life_minutes: u32,
}

impl SensorBinding {
    pub fn new(identity: SensorIdentity, calibration: Calibration, enable_time: u32) -> Self {
        Self {
            identity,
            calibration,
            enable_time,
            max_life_minutes: DEFAULT_MAX_LIFE_MINUTES,
        }
    }
}

/// A relay failure as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFailure {
    pub message: String,
    /// Credentials were rejected; retrying would not help
    pub credential: bool,
}

/// Everything that can happen to a link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkInput {
    /// User asks to connect and stay connected
    Connect,
    /// User asks to disconnect
    Disconnect,
    PoweredOn,
    PoweredOff,
    Discovered(Advertisement),
    Connected(PeripheralId),
    ConnectFailed { peripheral: PeripheralId, reason: String },
    Disconnected { peripheral: PeripheralId, reason: Option<String> },
    Notification { peripheral: PeripheralId, value: Vec<u8> },
    /// A write or subscription on a connected peripheral failed
    RadioFailed { peripheral: PeripheralId, reason: String },
    ScanFailed { reason: String },
    LoggedIn,
    RelayReadings(Vec<GlucoseReading>),
    RelayFailed(RelayFailure),
    Tick,
    /// Stop the driver; the machine's metrics are handed back
    Shutdown,
}

/// Side effects requested by the machine, performed in order by the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkAction {
    StartScan { service: Option<Uuid> },
    StopScan,
    Connect(PeripheralId),
    CancelConnection(PeripheralId),
    Write {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Subscribe {
        peripheral: PeripheralId,
        characteristic: Uuid,
    },
    StartRelay,
    StopRelay,
    Emit(LinkEvent),
}

/// Instants at which an input is handled.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    pub instant: Instant,
    pub wall: DateTime<Utc>,
}

impl Clock {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }
}

/// The connection state machine.
pub struct ConnectionMachine {
    profile: Box<dyn LinkProfile>,
    config: LinkConfig,
    binding: Option<SensorBinding>,
    store: Arc<dyn KeyValueStore>,
    counter: UnlockCounter,

    state: ConnectionState,
    powered: bool,
    stay_connected: bool,
    known_peripheral: Option<PeripheralId>,
    peripheral: Option<PeripheralId>,
    reassembler: Option<FragmentReassembler>,

    /// Newest frame age accepted in this pairing epoch
    last_accepted_age: Option<u32>,
    /// Age of the newest emitted batch
    last_emitted_age: Option<u32>,
    last_relay_timestamp: Option<DateTime<Utc>>,

    metrics: LinkMetrics,
}

impl ConnectionMachine {
    pub fn new(
        profile: Box<dyn LinkProfile>,
        config: LinkConfig,
        binding: Option<SensorBinding>,
        store: Arc<dyn KeyValueStore>,
        counter: UnlockCounter,
    ) -> Self {
        let reassembler = profile
            .fragment_layout()
            .map(|layout| FragmentReassembler::new(layout, config.stale_fragment_timeout));

        let known_peripheral = match store.get(PERIPHERAL_ID_KEY) {
            Ok(id) => id.map(PeripheralId),
            Err(err) => {
                warn!(error = %err, "could not load last peripheral");
                None
            }
        };

        Self {
            profile,
            config,
            binding,
            store,
            counter,
            state: ConnectionState::Unknown,
            powered: false,
            stay_connected: false,
            known_peripheral,
            peripheral: None,
            reassembler,
            last_accepted_age: None,
            last_emitted_age: None,
            last_relay_timestamp: None,
            metrics: LinkMetrics::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stay_connected(&self) -> bool {
        self.stay_connected
    }

    pub fn known_peripheral(&self) -> Option<&PeripheralId> {
        self.known_peripheral.as_ref()
    }

    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }

    pub fn into_metrics(mut self) -> LinkMetrics {
        self.metrics.complete();
        self.metrics
    }

    pub fn profile(&self) -> &dyn LinkProfile {
        self.profile.as_ref()
    }

    /// Handle one input and return the actions it triggers.
    pub fn handle(&mut self, input: LinkInput, clock: Clock) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        match input {
            LinkInput::Connect => self.on_connect_request(&mut actions),
            LinkInput::Disconnect => self.on_disconnect_request(&mut actions),
            LinkInput::PoweredOn => self.on_powered_on(&mut actions),
            LinkInput::PoweredOff => self.on_powered_off(&mut actions),
            LinkInput::Discovered(advertisement) => self.on_discovered(advertisement, &mut actions),
            LinkInput::Connected(peripheral) => self.on_connected(peripheral, &mut actions),
            LinkInput::ConnectFailed { peripheral, reason } => {
                self.on_connect_failed(peripheral, reason, &mut actions)
            }
            LinkInput::Disconnected { peripheral, reason } => self.on_disconnected(peripheral, reason, &mut actions),
            LinkInput::Notification { peripheral, value } => {
                self.on_notification(peripheral, &value, clock, &mut actions)
            }
            LinkInput::RadioFailed { peripheral, reason } => self.on_radio_failed(peripheral, reason, &mut actions),
            LinkInput::ScanFailed { reason } => self.on_scan_failed(reason, &mut actions),
            LinkInput::LoggedIn => self.on_logged_in(&mut actions),
            LinkInput::RelayReadings(readings) => self.on_relay_readings(readings, &mut actions),
            LinkInput::RelayFailed(failure) => self.on_relay_failed(failure, &mut actions),
            LinkInput::Tick => self.on_tick(clock),
            LinkInput::Shutdown => self.on_disconnect_request(&mut actions),
        }
        actions
    }

    fn set_state(&mut self, state: ConnectionState, actions: &mut Vec<LinkAction>) {
        if self.state != state {
            info!(profile = self.profile.name(), from = %self.state, to = %state, "connection state");
            self.state = state;
            actions.push(LinkAction::Emit(LinkEvent::State(state)));
        }
    }

    /// Reconnect by known id, or scan.
    fn begin_connect(&mut self, actions: &mut Vec<LinkAction>) {
        if self.profile.needs_login() {
            self.set_state(ConnectionState::Pairing, actions);
            actions.push(LinkAction::StartRelay);
            return;
        }

        if !self.powered {
            return;
        }

        match self.known_peripheral.clone() {
            Some(peripheral) => {
                self.set_state(ConnectionState::Connecting, actions);
                self.peripheral = Some(peripheral.clone());
                actions.push(LinkAction::Connect(peripheral));
            }
            None => {
                self.set_state(ConnectionState::Scanning, actions);
                actions.push(LinkAction::StartScan {
                    service: self.profile.services().map(|ids| ids.service),
                });
            }
        }
    }

    fn on_connect_request(&mut self, actions: &mut Vec<LinkAction>) {
        self.stay_connected = true;
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Scanning | ConnectionState::Pairing
        ) {
            return;
        }
        self.begin_connect(actions);
    }

    fn on_disconnect_request(&mut self, actions: &mut Vec<LinkAction>) {
        self.stay_connected = false;
        match self.state {
            ConnectionState::Scanning => actions.push(LinkAction::StopScan),
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(peripheral) = self.peripheral.take() {
                    actions.push(LinkAction::CancelConnection(peripheral));
                }
            }
            _ => {}
        }
        if self.profile.needs_login() {
            actions.push(LinkAction::StopRelay);
        }
        if let Some(reassembler) = self.reassembler.as_mut() {
            reassembler.clear();
        }

        let next = if !self.powered && !self.profile.needs_login() && self.state == ConnectionState::PowerOff {
            ConnectionState::PowerOff
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(next, actions);
    }

    fn on_powered_on(&mut self, actions: &mut Vec<LinkAction>) {
        self.powered = true;
        if self.profile.needs_login() {
            return;
        }
        if self.stay_connected {
            self.begin_connect(actions);
        } else {
            self.set_state(ConnectionState::Disconnected, actions);
        }
    }

    fn on_powered_off(&mut self, actions: &mut Vec<LinkAction>) {
        self.powered = false;
        if self.profile.needs_login() {
            return;
        }
        if self.state == ConnectionState::Connected {
            actions.push(LinkAction::Emit(LinkEvent::Error(LinkError {
                kind: LinkErrorKind::PeripheralDisconnected,
                message: "Bluetooth was switched off while the sensor was connected".into(),
                critical: true,
            })));
        }
        self.peripheral = None;
        if let Some(reassembler) = self.reassembler.as_mut() {
            reassembler.clear();
        }
        self.set_state(ConnectionState::PowerOff, actions);
    }

    fn on_discovered(&mut self, advertisement: Advertisement, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        if !self
            .profile
            .matches(&advertisement, self.config.expected_address.as_deref())
        {
            debug!(peripheral = %advertisement.id, "ignoring advertisement");
            return;
        }

        info!(peripheral = %advertisement.id, name = ?advertisement.name, "found peripheral");
        actions.push(LinkAction::StopScan);
        self.set_state(ConnectionState::Connecting, actions);
        self.peripheral = Some(advertisement.id.clone());
        actions.push(LinkAction::Connect(advertisement.id));
    }

    fn on_connected(&mut self, peripheral: PeripheralId, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Connecting || self.peripheral.as_ref() != Some(&peripheral) {
            debug!(%peripheral, state = %self.state, "unexpected connection, cancelling");
            actions.push(LinkAction::CancelConnection(peripheral));
            return;
        }

        if self.known_peripheral.as_ref() != Some(&peripheral) {
            if let Err(err) = self.store.set(PERIPHERAL_ID_KEY, &peripheral.0) {
                warn!(error = %err, "could not persist peripheral id");
            }
            self.known_peripheral = Some(peripheral.clone());
        }
        if let Some(reassembler) = self.reassembler.as_mut() {
            reassembler.clear();
        }
        self.set_state(ConnectionState::Connected, actions);

        let Some(ids) = self.profile.services() else {
            return;
        };

        if let Some(binding) = &self.binding {
            let unlock = match self.counter.next() {
                Ok(unlock_count) => self.profile.derive_unlock(&UnlockContext {
                    identity: &binding.identity,
                    enable_time: binding.enable_time,
                    unlock_count,
                }),
                Err(err) => {
                    warn!(error = %err, "unlock counter unavailable");
                    None
                }
            };
            if let Some(value) = unlock {
                actions.push(LinkAction::Write {
                    peripheral: peripheral.clone(),
                    characteristic: ids.write,
                    value,
                });
            }
        }

        actions.push(LinkAction::Subscribe {
            peripheral,
            characteristic: ids.notify,
        });
    }

    fn on_connect_failed(&mut self, peripheral: PeripheralId, reason: String, actions: &mut Vec<LinkAction>) {
        if self.peripheral.as_ref() != Some(&peripheral) {
            return;
        }
        warn!(%peripheral, %reason, "connect failed");
        self.peripheral = None;

        if self.known_peripheral.as_ref() == Some(&peripheral) {
            self.known_peripheral = None;
            if let Err(err) = self.store.remove(PERIPHERAL_ID_KEY) {
                warn!(error = %err, "could not forget peripheral id");
            }
        }

        if self.stay_connected {
            self.metrics.reconnect_attempts += 1;
            self.set_state(ConnectionState::Disconnected, actions);
            self.begin_connect(actions);
        } else {
            self.set_state(ConnectionState::Disconnected, actions);
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralId, reason: Option<String>, actions: &mut Vec<LinkAction>) {
        if self.peripheral.as_ref() != Some(&peripheral) {
            return;
        }
        self.peripheral = None;
        if let Some(reassembler) = self.reassembler.as_mut() {
            reassembler.clear();
        }
        if self.state == ConnectionState::PowerOff {
            return;
        }

        self.metrics.disconnects += 1;
        info!(%peripheral, reason = reason.as_deref().unwrap_or("none"), "peripheral disconnected");
        self.set_state(ConnectionState::Disconnected, actions);

        if self.stay_connected {
            self.metrics.reconnect_attempts += 1;
            self.begin_connect(actions);
        }
    }

    fn on_radio_failed(&mut self, peripheral: PeripheralId, reason: String, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Connected || self.peripheral.as_ref() != Some(&peripheral) {
            return;
        }
        warn!(%peripheral, %reason, "radio operation failed, dropping connection");
        self.metrics.radio_failures += 1;
        if let Some(reassembler) = self.reassembler.as_mut() {
            reassembler.clear();
        }
        actions.push(LinkAction::Emit(LinkEvent::Error(LinkError {
            kind: LinkErrorKind::Radio,
            message: format!("lost contact with the sensor: {reason}"),
            critical: false,
        })));
        // `peripheral` stays set so the disconnect callback is recognised
        actions.push(LinkAction::CancelConnection(peripheral));
        self.set_state(ConnectionState::Disconnected, actions);
    }

    fn on_scan_failed(&mut self, reason: String, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        warn!(%reason, "scan failed");
        self.metrics.radio_failures += 1;
        actions.push(LinkAction::Emit(LinkEvent::Error(LinkError {
            kind: LinkErrorKind::Radio,
            message: format!("could not scan for the sensor: {reason}"),
            critical: false,
        })));
        self.set_state(ConnectionState::Disconnected, actions);
    }

    fn on_notification(&mut self, peripheral: PeripheralId, value: &[u8], clock: Clock, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Connected || self.peripheral.as_ref() != Some(&peripheral) {
            return;
        }
        self.metrics.fragments_received += 1;

        let Some(reassembler) = self.reassembler.as_mut() else {
            return;
        };
        let payload = match reassembler.insert(value, clock.instant) {
            Ok(Some(payload)) => payload,
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "fragment discarded");
                self.metrics.fragments_discarded += 1;
                return;
            }
        };
        self.metrics.frames_reassembled += 1;

        let Some(binding) = &self.binding else {
            debug!("no sensor bound, dropping frame");
            return;
        };

        let frame = match self.profile.decode_payload(&binding.identity, &payload) {
            Ok(frame) => frame,
            Err(Error::Frame(err)) => {
                debug!(error = %err, "frame rejected");
                self.metrics.frames_failed_crc += 1;
                return;
            }
            Err(err) => {
                debug!(error = %err, "frame rejected");
                return;
            }
        };

        let parsed = match parse_frame(&binding.calibration, clock.wall, &frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(error = %err, "frame could not be decoded");
                return;
            }
        };
        self.metrics.frames_decoded += 1;
        self.metrics.readings_dropped += 10usize.saturating_sub(parsed.batch.len()) as u64;

        if let Some(last) = self.last_accepted_age {
            if parsed.age_minutes < last {
                debug!(age = parsed.age_minutes, last, "frame older than last accepted, ignoring");
                self.metrics.frames_out_of_order += 1;
                return;
            }
        }
        self.last_accepted_age = Some(parsed.age_minutes);

        actions.push(LinkAction::Emit(LinkEvent::Lifecycle {
            age_minutes: parsed.age_minutes,
            lifecycle: SensorLifecycle::from_age(parsed.age_minutes, binding.max_life_minutes),
        }));

        if let Some(last) = self.last_emitted_age {
            if parsed.age_minutes < last.saturating_add(self.config.sampling_interval_minutes) {
                self.metrics.batches_skipped += 1;
                return;
            }
        }
        if parsed.batch.is_empty() {
            return;
        }

        self.last_emitted_age = Some(parsed.age_minutes);
        self.metrics.readings_emitted += parsed.batch.len() as u64;
        actions.push(LinkAction::Emit(LinkEvent::Readings(parsed.batch)));
    }

    fn on_logged_in(&mut self, actions: &mut Vec<LinkAction>) {
        if self.state == ConnectionState::Pairing && self.stay_connected {
            self.set_state(ConnectionState::Connected, actions);
        }
    }

    fn on_relay_readings(&mut self, mut readings: Vec<GlucoseReading>, actions: &mut Vec<LinkAction>) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.metrics.relay_polls += 1;

        readings.sort_by_key(|reading| reading.timestamp);
        if let Some(last) = self.last_relay_timestamp {
            readings.retain(|reading| reading.timestamp > last);
        }
        let Some(newest) = readings.last().map(|reading| reading.timestamp) else {
            return;
        };

        if let Some(last) = self.last_relay_timestamp {
            let interval = chrono::Duration::minutes(i64::from(self.config.sampling_interval_minutes));
            if newest < last + interval {
                self.metrics.batches_skipped += 1;
                return;
            }
        }

        self.last_relay_timestamp = Some(newest);
        self.metrics.readings_emitted += readings.len() as u64;
        actions.push(LinkAction::Emit(LinkEvent::Readings(ReadingBatch {
            trend: readings,
            history: Vec::new(),
        })));
    }

    fn on_relay_failed(&mut self, failure: RelayFailure, actions: &mut Vec<LinkAction>) {
        self.metrics.relay_failures += 1;
        if !failure.credential {
            debug!(reason = %failure.message, "relay poll failed");
            return;
        }

        warn!(reason = %failure.message, "relay credentials rejected");
        self.stay_connected = false;
        actions.push(LinkAction::StopRelay);
        actions.push(LinkAction::Emit(LinkEvent::Error(LinkError {
            kind: LinkErrorKind::Credentials,
            message: failure.message,
            critical: false,
        })));
        self.set_state(ConnectionState::Disconnected, actions);
    }

    fn on_tick(&mut self, clock: Clock) {
        if let Some(reassembler) = self.reassembler.as_mut() {
            if let Some(err) = reassembler.sweep(clock.instant) {
                debug!(error = %err, "stale fragments dropped");
                self.metrics.fragments_discarded += 1;
            }
        }
    }

    /// Poll interval for relay profiles.
    pub fn poll_interval(&self) -> Option<Duration> {
        match self.profile.delivery() {
            Delivery::Poll { interval } => Some(interval),
            Delivery::Subscribe => None,
        }
    }
}

impl std::fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("profile", &self.profile.name())
            .field("state", &self.state)
            .field("stay_connected", &self.stay_connected)
            .field("known_peripheral", &self.known_peripheral)
            .finish()
    }
}
