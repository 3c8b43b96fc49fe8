//! Proximity pairing: read a sensor's identity and memory over NFC.
//!
//! A session walks `Idle -> TagDetected -> ConnectedToTag -> IdentityRead ->
//! MemoryRead -> (StreamingUnlocked) -> Done`. Every round trip gets a
//! timeout and a bounded number of attempts; exhausting them fails the whole
//! session with a typed [`PairingError`].
//!
//! [`start_pairing`] runs a session on its own task and returns a
//! [`PairingHandle`]. The result is delivered once through a oneshot channel;
//! dropping the handle aborts the task, which drops the transport and releases
//! the reader.

use crate::calibration::{Calibration, FactoryCalibration};
use crate::error::{NfcError, PairingError};
use crate::memory::{MemoryImage, RawMemoryImage, IMAGE_LEN};
use crate::nfc::{
    activate_command, enable_streaming_command, identity_request_command, read_plan, response_payload,
    DetectedTag, NfcTransport, TagTechnology,
};
use crate::parser::{parse_memory_image, ParsedImage};
use crate::sensor::{PatchInfo, SensorIdentity, SensorState, SensorType, SensorUid};
use crate::store::{save_enable_time, KeyValueStore, UnlockCounter};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pairing session tuning.
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Attempts per round trip, the first one included
    pub max_attempts: usize,
    /// Deadline for a single round trip
    pub round_trip_timeout: Duration,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            round_trip_timeout: Duration::from_secs(2),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// What the caller wants besides the memory read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingRequest {
    /// Unlock BLE streaming on sensors that support it
    pub enable_streaming: bool,
    /// Activate a sensor that has never been started
    pub activate: bool,
}

/// Progress of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    TagDetected,
    ConnectedToTag,
    IdentityRead,
    MemoryRead,
    StreamingUnlocked,
    Done,
    Failed,
}

/// Streaming credentials established during pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingUnlock {
    /// Code sent with the enable-streaming command; seeds every BLE login challenge
    pub enable_time: u32,
}

/// Everything learned from one successful pairing.
#[derive(Debug, Clone)]
pub struct PairingResult {
    pub identity: SensorIdentity,
    pub sensor_type: SensorType,
    pub serial_number: String,
    pub factory_calibration: FactoryCalibration,
    pub image: MemoryImage,
    pub parsed: ParsedImage,
    pub read_at: DateTime<Utc>,
    pub activated: bool,
    pub streaming: Option<StreamingUnlock>,
}

impl PairingResult {
    pub fn sensor_start(&self) -> DateTime<Utc> {
        self.read_at - ChronoDuration::minutes(i64::from(self.parsed.age_minutes))
    }
}

/// A single exchange with the tag.
enum RoundTrip<'a> {
    Detect,
    Connect,
    Transceive(&'a [u8]),
}

enum Reply {
    Tag(DetectedTag),
    Connected,
    Data(Vec<u8>),
}

impl RoundTrip<'_> {
    async fn run<T: NfcTransport>(&self, transport: &mut T) -> Result<Reply, NfcError> {
        match self {
            Self::Detect => transport.detect_tag().await.map(Reply::Tag),
            Self::Connect => transport.connect().await.map(|()| Reply::Connected),
            Self::Transceive(command) => {
                let response = transport.transceive(command).await?;
                response_payload(&response).map(|payload| Reply::Data(payload.to_vec()))
            }
        }
    }
}

/// One pairing attempt; owns the transport for its whole life.
pub struct PairingSession<T: NfcTransport> {
    transport: T,
    request: PairingRequest,
    config: PairingConfig,
    counter: UnlockCounter,
    store: Arc<dyn KeyValueStore>,
    state: watch::Sender<PairingState>,
}

impl<T: NfcTransport> PairingSession<T> {
    pub fn new(
        transport: T,
        request: PairingRequest,
        config: PairingConfig,
        store: Arc<dyn KeyValueStore>,
        counter: UnlockCounter,
    ) -> Self {
        let (state, _) = watch::channel(PairingState::Idle);
        Self {
            transport,
            request,
            config,
            counter,
            store,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingState> {
        self.state.subscribe()
    }

    fn advance(&self, state: PairingState) {
        debug!(?state, "pairing progress");
        self.state.send_replace(state);
    }

    /// Run a round trip with timeout and bounded attempts.
    async fn with_retries(&mut self, what: &str, op: RoundTrip<'_>) -> Result<Reply, NfcError> {
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.config.round_trip_timeout, op.run(&mut self.transport)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(NfcError::Timeout),
            };

            match outcome {
                Ok(reply) => return Ok(reply),
                Err(err) if attempt >= self.config.max_attempts => {
                    warn!(what, attempt, error = %err, "round trip failed, giving up");
                    return Err(err);
                }
                Err(err) => {
                    debug!(what, attempt, error = %err, "round trip failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn detect(&mut self) -> Result<DetectedTag, NfcError> {
        match self.with_retries("detect", RoundTrip::Detect).await? {
            Reply::Tag(tag) => Ok(tag),
            _ => Err(NfcError::NoTag),
        }
    }

    async fn transceive(&mut self, what: &str, command: &[u8]) -> Result<Vec<u8>, NfcError> {
        match self.with_retries(what, RoundTrip::Transceive(command)).await? {
            Reply::Data(data) => Ok(data),
            _ => Err(NfcError::Transceive("unexpected reply".into())),
        }
    }

    /// Drive the session to completion.
    pub async fn run(mut self) -> Result<PairingResult, PairingError> {
        let outcome = self.run_inner().await;
        match &outcome {
            Ok(result) => {
                self.advance(PairingState::Done);
                self.transport.invalidate("Sensor paired");
                info!(serial = %result.serial_number, sensor_type = %result.sensor_type, "pairing complete");
            }
            Err(err) => {
                self.advance(PairingState::Failed);
                self.transport.invalidate(&err.to_string());
                warn!(error = %err, "pairing failed");
            }
        }
        outcome
    }

    async fn run_inner(&mut self) -> Result<PairingResult, PairingError> {
        let tag = self.detect().await.map_err(|_| PairingError::NoTag)?;
        if let TagTechnology::Other(technology) = tag.technology {
            return Err(PairingError::WrongTagTechnology(technology));
        }
        self.advance(PairingState::TagDetected);

        self.with_retries("connect", RoundTrip::Connect)
            .await
            .map_err(|err| PairingError::ConnectFailed(err.to_string()))?;
        self.advance(PairingState::ConnectedToTag);

        let uid = SensorUid::from_slice(&tag.uid).map_err(|err| PairingError::InvalidIdentity(err.to_string()))?;
        let patch_info = self
            .transceive("identity", &identity_request_command())
            .await
            .map_err(|err| PairingError::InvalidIdentity(err.to_string()))?;
        let patch_info =
            PatchInfo::from_slice(&patch_info).map_err(|err| PairingError::InvalidIdentity(err.to_string()))?;
        let identity = SensorIdentity::new(uid, patch_info);
        let sensor_type = identity.sensor_type();
        info!(uid = %uid, %sensor_type, "sensor identified");
        self.advance(PairingState::IdentityRead);

        if sensor_type.memory_cipher().is_none() {
            return Err(PairingError::UnsupportedFamily(sensor_type));
        }

        let raw = self.read_memory().await?;
        let read_at = Utc::now();
        let image = raw
            .decrypt(&identity)
            .map_err(|_| PairingError::UnsupportedFamily(sensor_type))?;
        self.advance(PairingState::MemoryRead);

        let factory_calibration =
            FactoryCalibration::from_image(&image).map_err(|err| PairingError::Decode(err.to_string()))?;
        let sensor_start = read_at - ChronoDuration::minutes(i64::from(image.age_minutes()));
        let parsed = parse_memory_image(&Calibration::factory(factory_calibration), sensor_start, &image)
            .map_err(|err| PairingError::Decode(err.to_string()))?;

        let mut activated = false;
        if self.request.activate && image.state() == SensorState::NotActivated {
            self.transceive("activate", &activate_command(&identity.uid))
                .await
                .map_err(|err| PairingError::ActivationFailed(err.to_string()))?;
            activated = true;
            info!("sensor activated");
        }

        let streaming = if self.request.enable_streaming && sensor_type.supports_streaming() {
            let enable_time = self
                .counter
                .next()
                .map_err(|err| PairingError::CounterUnavailable(err.to_string()))?;
            self.transceive("enable streaming", &enable_streaming_command(&identity, enable_time))
                .await
                .map_err(|err| PairingError::StreamingRejected(err.to_string()))?;
            save_enable_time(self.store.as_ref(), enable_time)
                .map_err(|err| PairingError::CounterUnavailable(err.to_string()))?;
            self.advance(PairingState::StreamingUnlocked);
            info!(enable_time, "streaming unlocked");
            Some(StreamingUnlock { enable_time })
        } else {
            if self.request.enable_streaming {
                debug!(%sensor_type, "sensor does not stream, skipping unlock");
            }
            None
        };

        Ok(PairingResult {
            identity,
            sensor_type,
            serial_number: identity.serial_number(),
            factory_calibration,
            image,
            parsed,
            read_at,
            activated,
            streaming,
        })
    }

    /// Read all 43 blocks into a buffer slotted by request index.
    async fn read_memory(&mut self) -> Result<RawMemoryImage, PairingError> {
        let mut buffer = vec![0u8; IMAGE_LEN];

        for request in read_plan() {
            let range = request.byte_range();
            let data = self
                .transceive("read blocks", &request.command())
                .await
                .map_err(|err| PairingError::ReadFailed {
                    request: request.index,
                    reason: err.to_string(),
                })?;
            if data.len() < range.len() {
                return Err(PairingError::UndersizedBuffer {
                    required: range.len(),
                    actual: data.len(),
                });
            }
            buffer[range.clone()].copy_from_slice(&data[..range.len()]);
        }

        RawMemoryImage::from_slice(&buffer).map_err(|_| PairingError::UndersizedBuffer {
            required: IMAGE_LEN,
            actual: buffer.len(),
        })
    }
}

/// Handle to a pairing session running on its own task.
pub struct PairingHandle {
    result: oneshot::Receiver<Result<PairingResult, PairingError>>,
    state: watch::Receiver<PairingState>,
    task: JoinHandle<()>,
}

impl PairingHandle {
    /// Progress updates.
    pub fn state(&self) -> watch::Receiver<PairingState> {
        self.state.clone()
    }

    /// Wait for the session to finish.
    pub async fn wait(mut self) -> Result<PairingResult, PairingError> {
        (&mut self.result).await.unwrap_or(Err(PairingError::Cancelled))
    }

    /// Stop the session now; nothing is delivered afterwards.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn a pairing session.
pub fn start_pairing<T>(
    transport: T,
    request: PairingRequest,
    config: PairingConfig,
    store: Arc<dyn KeyValueStore>,
    counter: UnlockCounter,
) -> PairingHandle
where
    T: NfcTransport + 'static,
{
    let session = PairingSession::new(transport, request, config, store, counter);
    let state = session.subscribe();
    let (tx, rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let outcome = session.run().await;
        // Receiver gone means the caller stopped caring.
        let _ = tx.send(outcome);
    });

    PairingHandle {
        result: rx,
        state,
        task,
    }
}
