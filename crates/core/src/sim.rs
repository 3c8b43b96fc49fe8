//! Seeded simulation of sensors, tags, radio links and the relay service.
//!
//! Everything here produces bytes in the same formats a physical sensor does,
//! so the real decoding path runs end to end without hardware:
//!
//! - [`SensorSimulator`]: a sensor following a synthetic glucose curve, able to
//!   produce encrypted memory images and BLE payloads
//! - [`SimulatedTag`]: an [`NfcTransport`] serving that image, with fault injection
//! - [`LinkSimulator`]: cuts payloads into fragments and drops, reorders or
//!   corrupts them
//! - [`SimulatedCentral`]: a [`Central`] streaming a sensor through a link
//! - [`SimulatedRelay`]: a [`RelayTransport`] answering like the follower API
//!
//! # Determinism
//!
//! All randomness comes from seeded ChaCha8 RNGs. Given the same seed and
//! inputs, outputs are bit-identical.

use crate::calibration::FactoryCalibration;
use crate::connection::LinkInput;
use crate::crc::crc16;
use crate::crypto::{encrypt_frame, STREAM_FRAME_CRC_OFFSET, STREAM_FRAME_LEN, STREAM_PAYLOAD_LEN};
use crate::driver::Central;
use crate::error::{NfcError, RadioError, RelayError, Result};
use crate::memory::{
    MemoryImage, RawMemoryImage, AGE_OFFSET, BLOCK_LEN, HISTORY_INDEX_OFFSET, HISTORY_SLOTS, IMAGE_LEN,
    MAX_LIFE_OFFSET, STATE_OFFSET, TREND_INDEX_OFFSET, TREND_SLOTS,
};
use crate::nfc::{DetectedTag, NfcTransport, TagTechnology, CUSTOM_COMMAND, READ_MULTIPLE_BLOCKS};
use crate::parser::{
    encode_frame_record, encode_image_record, frame_sample_ages, FRAME_AGE_OFFSET, FRAME_RECORD_LEN,
    HISTORY_INTERVAL_MINUTES,
};
use crate::profile::{Advertisement, PeripheralId};
use crate::reading::{GlucoseError, RawReading};
use crate::reassembly::FragmentLayout;
use crate::relay::{Method, RelayRequest, RelayResponse, RelayTransport, CONNECTIONS_PATH, LOGIN_PATH, TIMESTAMP_FORMAT};
use crate::sensor::{PatchInfo, SensorIdentity, SensorUid, DEFAULT_MAX_LIFE_MINUTES};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Thermistor count of a sensor at about 32.5 °C under [`SensorSimulator::default_calibration`].
pub const NOMINAL_RAW_TEMPERATURE: u16 = 7856;

const STATE_ACTIVE: u8 = 3;

/// A European Libre 2 identity.
pub fn libre2_identity() -> SensorIdentity {
    SensorIdentity::new(
        SensorUid([0x15, 0x8A, 0x3B, 0x01, 0x00, 0xA0, 0x07, 0xE0]),
        PatchInfo([0x9D, 0x08, 0x30, 0x01, 0x76, 0x25]),
    )
}

/// Smooth, noisy glucose trace indexed by sensor age.
#[derive(Debug, Clone)]
pub struct GlucoseCurve {
    seed: u64,
    baseline: f64,
    amplitude: f64,
    period_minutes: f64,
    phase: f64,
    noise: f64,
}

impl GlucoseCurve {
    pub fn new(seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self {
            seed,
            baseline: rng.gen_range(100.0..140.0),
            amplitude: rng.gen_range(20.0..60.0),
            period_minutes: rng.gen_range(120.0..300.0),
            phase: rng.gen_range(0.0..std::f64::consts::TAU),
            noise: 3.0,
        }
    }

    /// Constant trace, handy when exact values matter.
    pub fn flat(mg_dl: f64) -> Self {
        Self {
            seed: 0,
            baseline: mg_dl,
            amplitude: 0.0,
            period_minutes: 1.0,
            phase: 0.0,
            noise: 0.0,
        }
    }

    /// Value at `age` minutes, clamped to the sensor's reporting range.
    pub fn value_at(&self, age: u32) -> f64 {
        let wave = (std::f64::consts::TAU * f64::from(age) / self.period_minutes + self.phase).sin();
        let jitter = if self.noise > 0.0 {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ u64::from(age).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            rng.gen_range(-self.noise..=self.noise)
        } else {
            0.0
        };
        (self.baseline + self.amplitude * wave + jitter).clamp(40.0, 400.0)
    }
}

/// A sensor that encodes its readings the way the hardware does.
#[derive(Debug, Clone)]
pub struct SensorSimulator {
    identity: SensorIdentity,
    calibration: FactoryCalibration,
    curve: GlucoseCurve,
    age_minutes: u32,
    max_life_minutes: u32,
    state_code: u8,
    flagged: BTreeSet<u32>,
    nonce: u16,
}

impl SensorSimulator {
    /// Coefficients giving 65 mg/dL per 2000 counts around 32.5 °C.
    pub const fn default_calibration() -> FactoryCalibration {
        FactoryCalibration {
            i1: 1,
            i2: 700,
            i3: 0,
            i4: 2000,
            i5: 9000,
            i6: 8000,
        }
    }

    /// A day-old active sensor following a seeded curve.
    pub fn new(identity: SensorIdentity, seed: u64) -> Self {
        Self {
            identity,
            calibration: Self::default_calibration(),
            curve: GlucoseCurve::new(seed),
            age_minutes: 24 * 60,
            max_life_minutes: DEFAULT_MAX_LIFE_MINUTES,
            state_code: STATE_ACTIVE,
            flagged: BTreeSet::new(),
            nonce: seed as u16,
        }
    }

    pub fn with_age(mut self, age_minutes: u32) -> Self {
        self.age_minutes = age_minutes;
        self
    }

    pub fn with_curve(mut self, curve: GlucoseCurve) -> Self {
        self.curve = curve;
        self
    }

    /// Raw state byte, e.g. 1 for a sensor never activated.
    pub fn with_state_code(mut self, code: u8) -> Self {
        self.state_code = code;
        self
    }

    pub fn identity(&self) -> &SensorIdentity {
        &self.identity
    }

    pub fn calibration(&self) -> &FactoryCalibration {
        &self.calibration
    }

    pub fn age_minutes(&self) -> u32 {
        self.age_minutes
    }

    /// Let `minutes` of sensor time pass.
    pub fn advance(&mut self, minutes: u32) {
        self.age_minutes = self.age_minutes.saturating_add(minutes);
    }

    /// Mark the sample taken at `age` as failing the sensor's quality checks.
    pub fn flag(&mut self, age: u32) {
        self.flagged.insert(age);
    }

    /// Value the sensor was exposed to at `age`.
    pub fn expected_mg_dl(&self, age: u32) -> f64 {
        self.curve.value_at(age)
    }

    fn raw_reading(&self, age: i64) -> Option<RawReading> {
        let age = u32::try_from(age).ok()?;
        if self.flagged.contains(&age) {
            return Some(RawReading {
                raw_glucose: 0,
                raw_temperature: NOMINAL_RAW_TEMPERATURE,
                temperature_adjustment: 0,
                error: GlucoseError::from_bits(0x0001),
            });
        }
        Some(RawReading {
            raw_glucose: self
                .calibration
                .raw_glucose_for(self.expected_mg_dl(age), NOMINAL_RAW_TEMPERATURE, 0),
            raw_temperature: NOMINAL_RAW_TEMPERATURE,
            temperature_adjustment: 0,
            error: GlucoseError::NONE,
        })
    }

    /// Decrypted memory image at the current age.
    pub fn memory_image(&self) -> Result<MemoryImage> {
        let mut image = MemoryImage::zeroed();
        let age = i64::from(self.age_minutes);
        let newest_history = age - ((age - 3).rem_euclid(HISTORY_INTERVAL_MINUTES) + 3);

        {
            let bytes = image.as_bytes_mut();
            bytes[STATE_OFFSET] = self.state_code;
            bytes[TREND_INDEX_OFFSET] = ((age + 1).rem_euclid(TREND_SLOTS as i64)) as u8;
            bytes[HISTORY_INDEX_OFFSET] =
                ((newest_history.div_euclid(HISTORY_INTERVAL_MINUTES) + 1).rem_euclid(HISTORY_SLOTS as i64)) as u8;
            bytes[AGE_OFFSET..AGE_OFFSET + 2].copy_from_slice(&(self.age_minutes as u16).to_le_bytes());
            bytes[MAX_LIFE_OFFSET..MAX_LIFE_OFFSET + 2].copy_from_slice(&(self.max_life_minutes as u16).to_le_bytes());

            for i in 0..TREND_SLOTS as i64 {
                let sample_age = age - i;
                if let Some(raw) = self.raw_reading(sample_age) {
                    let slot = sample_age.rem_euclid(TREND_SLOTS as i64) as usize;
                    encode_image_record(bytes, MemoryImage::trend_record_offset(slot), &raw)?;
                }
            }

            for i in 0..HISTORY_SLOTS as i64 {
                let sample_age = newest_history - HISTORY_INTERVAL_MINUTES * i;
                if let Some(raw) = self.raw_reading(sample_age) {
                    let slot = sample_age
                        .div_euclid(HISTORY_INTERVAL_MINUTES)
                        .rem_euclid(HISTORY_SLOTS as i64) as usize;
                    encode_image_record(bytes, MemoryImage::history_record_offset(slot), &raw)?;
                }
            }
        }

        self.calibration.write_to(&mut image)?;
        Ok(image)
    }

    /// Memory image as the tag serves it.
    pub fn raw_image(&self) -> Result<RawMemoryImage> {
        self.memory_image()?.encrypt(&self.identity)
    }

    /// Decrypted 44-byte frame at the current age, CRC included.
    pub fn frame(&self) -> Result<[u8; STREAM_FRAME_LEN]> {
        let mut frame = [0u8; STREAM_FRAME_LEN];
        for (i, sample_age) in frame_sample_ages(self.age_minutes).into_iter().enumerate() {
            if let Some(raw) = self.raw_reading(sample_age) {
                encode_frame_record(&mut frame, i * FRAME_RECORD_LEN, &raw)?;
            }
        }
        frame[FRAME_AGE_OFFSET..FRAME_AGE_OFFSET + 2].copy_from_slice(&(self.age_minutes as u16).to_le_bytes());
        let crc = crc16(&frame[..STREAM_FRAME_CRC_OFFSET]);
        frame[STREAM_FRAME_CRC_OFFSET..].copy_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }

    /// Encrypted 46-byte BLE payload under a fresh nonce.
    pub fn payload(&mut self) -> Result<[u8; STREAM_PAYLOAD_LEN]> {
        let frame = self.frame()?;
        self.nonce = self.nonce.wrapping_add(1);
        Ok(encrypt_frame(&self.identity.uid, self.nonce, &frame))
    }
}

/// Faults a [`SimulatedTag`] injects.
#[derive(Debug, Clone, Default)]
pub struct TagFaults {
    /// Identity requests answered with an error before one succeeds
    pub failing_identity_requests: usize,
    /// Block reads answered with an error before they succeed
    pub failing_reads: usize,
    /// Report a non-ISO 15693 technology
    pub technology: Option<String>,
    /// No tag ever enters the field
    pub absent: bool,
    /// Answer block reads with one block fewer than asked
    pub short_reads: bool,
    /// Refuse the enable-streaming command
    pub reject_streaming: bool,
}

/// What a [`SimulatedTag`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct TagLog {
    pub identity_requests: usize,
    pub reads: usize,
    pub activations: usize,
    pub enable_codes: Vec<u32>,
    pub invalidated: Option<String>,
}

/// An ISO 15693 sensor tag in the reader's field.
#[derive(Debug)]
pub struct SimulatedTag {
    identity: SensorIdentity,
    image: RawMemoryImage,
    faults: TagFaults,
    log: Arc<Mutex<TagLog>>,
}

impl SimulatedTag {
    pub fn new(sensor: &SensorSimulator, faults: TagFaults) -> Result<Self> {
        Ok(Self {
            identity: *sensor.identity(),
            image: sensor.raw_image()?,
            faults,
            log: Arc::new(Mutex::new(TagLog::default())),
        })
    }

    /// Shared view of the tag's log, readable after the tag is consumed.
    pub fn log(&self) -> Arc<Mutex<TagLog>> {
        self.log.clone()
    }

    fn read_blocks(&mut self, first_block: usize, count: usize) -> std::result::Result<Vec<u8>, NfcError> {
        let mut log = self.log.lock();
        log.reads += 1;
        if log.reads <= self.faults.failing_reads {
            return Err(NfcError::TagLost);
        }

        let count = if self.faults.short_reads { count.saturating_sub(1) } else { count };
        let start = (first_block * BLOCK_LEN).min(IMAGE_LEN);
        let end = ((first_block + count) * BLOCK_LEN).min(IMAGE_LEN);
        let mut response = vec![0x00];
        response.extend_from_slice(&self.image.as_bytes()[start..end]);
        Ok(response)
    }

    fn custom(&mut self, parameters: &[u8]) -> std::result::Result<Vec<u8>, NfcError> {
        let mut log = self.log.lock();
        match parameters.first() {
            None => {
                log.identity_requests += 1;
                if log.identity_requests <= self.faults.failing_identity_requests {
                    return Err(NfcError::Transceive("identity request not answered".into()));
                }
                let mut response = vec![0x00];
                response.extend_from_slice(self.identity.patch_info.as_bytes());
                Ok(response)
            }
            Some(0x1B) => {
                log.activations += 1;
                Ok(vec![0x00])
            }
            Some(0x1E) if self.faults.reject_streaming => Ok(vec![0x01, 0x0F]),
            Some(0x1E) if parameters.len() >= 5 => {
                let code = u32::from_le_bytes([parameters[1], parameters[2], parameters[3], parameters[4]]);
                log.enable_codes.push(code);
                Ok(vec![0x00])
            }
            Some(_) => Ok(vec![0x01, 0x0F]),
        }
    }
}

impl NfcTransport for SimulatedTag {
    async fn detect_tag(&mut self) -> std::result::Result<DetectedTag, NfcError> {
        if self.faults.absent {
            return Err(NfcError::NoTag);
        }
        let technology = match &self.faults.technology {
            Some(other) => TagTechnology::Other(other.clone()),
            None => TagTechnology::Iso15693,
        };
        Ok(DetectedTag {
            technology,
            uid: self.identity.uid.as_bytes().to_vec(),
        })
    }

    async fn connect(&mut self) -> std::result::Result<(), NfcError> {
        Ok(())
    }

    async fn transceive(&mut self, command: &[u8]) -> std::result::Result<Vec<u8>, NfcError> {
        match command {
            [_, READ_MULTIPLE_BLOCKS, first, count] => self.read_blocks(usize::from(*first), usize::from(*count) + 1),
            [_, CUSTOM_COMMAND, _, parameters @ ..] => self.custom(parameters),
            _ => Ok(vec![0x01, 0x01]),
        }
    }

    fn invalidate(&mut self, message: &str) {
        self.log.lock().invalidated = Some(message.to_string());
    }
}

/// Radio conditions between a peripheral and the central.
#[derive(Debug, Clone, Copy)]
pub struct LinkConditions {
    /// Fragment loss probability [0.0, 1.0]
    pub drop_rate: f64,
    /// Probability of swapping a fragment with its predecessor
    pub reorder_rate: f64,
    /// Probability that a payload gets one byte flipped
    pub corrupt_rate: f64,
    pub seed: u64,
}

impl LinkConditions {
    /// No impairments.
    pub fn perfect(seed: u64) -> Self {
        Self {
            drop_rate: 0.0,
            reorder_rate: 0.0,
            corrupt_rate: 0.0,
            seed,
        }
    }

    /// Moderate impairments.
    pub fn default_with_seed(seed: u64) -> Self {
        Self {
            drop_rate: 0.02,
            reorder_rate: 0.1,
            corrupt_rate: 0.02,
            seed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub payloads_sent: u64,
    pub fragments_sent: u64,
    pub fragments_dropped: u64,
    pub fragments_reordered: u64,
    pub payloads_corrupted: u64,
}

/// Fragmenting, lossy link.
#[derive(Debug)]
pub struct LinkSimulator {
    conditions: LinkConditions,
    rng: ChaCha8Rng,
    stats: LinkStats,
}

impl LinkSimulator {
    pub fn new(conditions: LinkConditions) -> Self {
        Self {
            conditions,
            rng: ChaCha8Rng::seed_from_u64(conditions.seed),
            stats: LinkStats::default(),
        }
    }

    /// Cut `payload` by `layout` and apply the link's impairments.
    pub fn transmit(&mut self, payload: &[u8], layout: &FragmentLayout) -> Vec<Vec<u8>> {
        self.stats.payloads_sent += 1;
        let mut payload = payload.to_vec();

        if self.conditions.corrupt_rate > 0.0 && self.rng.gen::<f64>() < self.conditions.corrupt_rate && payload.len() > 2 {
            // the clear nonce stays intact so only the CRC can notice
            let index = self.rng.gen_range(2..payload.len());
            payload[index] ^= 0x01 << self.rng.gen_range(0..8);
            self.stats.payloads_corrupted += 1;
        }

        let mut fragments: Vec<Vec<u8>> = layout.split(&payload).into_iter().map(<[u8]>::to_vec).collect();
        self.stats.fragments_sent += fragments.len() as u64;

        if self.conditions.drop_rate > 0.0 {
            let before = fragments.len();
            let drop_rate = self.conditions.drop_rate;
            let rng = &mut self.rng;
            fragments.retain(|_| rng.gen::<f64>() >= drop_rate);
            self.stats.fragments_dropped += (before - fragments.len()) as u64;
        }

        if self.conditions.reorder_rate > 0.0 {
            for i in 1..fragments.len() {
                if self.rng.gen::<f64>() < self.conditions.reorder_rate {
                    fragments.swap(i - 1, i);
                    self.stats.fragments_reordered += 1;
                }
            }
        }

        fragments
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }
}

/// How a [`SimulatedCentral`] behaves.
#[derive(Debug, Clone)]
pub struct CentralScript {
    pub peripheral: PeripheralId,
    pub address: Option<String>,
    pub service: Uuid,
    pub layout: FragmentLayout,
    /// Wall time standing in for one minute of sensor time
    pub frame_period: Duration,
    /// Frames streamed per connection
    pub frames: usize,
    /// Drop the first connection after this many frames
    pub disconnect_after: Option<usize>,
    /// Connection attempts refused before one succeeds
    pub failing_connects: usize,
    /// Characteristic writes that fail before one goes through
    pub failing_writes: usize,
}

/// Radio events and writes seen by a [`SimulatedCentral`].
#[derive(Debug, Clone, Default)]
pub struct CentralLog {
    pub scans: usize,
    pub connects: usize,
    pub writes: Vec<(Uuid, Vec<u8>)>,
    pub subscriptions: usize,
}

/// A central with a single simulated sensor in range.
pub struct SimulatedCentral {
    inputs: mpsc::Sender<LinkInput>,
    sensor: Arc<Mutex<SensorSimulator>>,
    link: Arc<Mutex<LinkSimulator>>,
    script: CentralScript,
    failing_connects: usize,
    failing_writes: usize,
    disconnect_after: Option<usize>,
    stream: Option<JoinHandle<()>>,
    log: Arc<Mutex<CentralLog>>,
}

impl SimulatedCentral {
    pub fn new(
        inputs: mpsc::Sender<LinkInput>,
        sensor: Arc<Mutex<SensorSimulator>>,
        link: Arc<Mutex<LinkSimulator>>,
        script: CentralScript,
    ) -> Self {
        Self {
            inputs,
            sensor,
            link,
            failing_connects: script.failing_connects,
            failing_writes: script.failing_writes,
            disconnect_after: script.disconnect_after,
            script,
            stream: None,
            log: Arc::new(Mutex::new(CentralLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<CentralLog>> {
        self.log.clone()
    }

    fn push(&self, input: LinkInput) -> std::result::Result<(), RadioError> {
        self.inputs
            .try_send(input)
            .map_err(|err| RadioError::Operation(err.to_string()))
    }

    fn stop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

/// Frames one connection streams, sent as notifications.
struct FrameStream {
    inputs: mpsc::Sender<LinkInput>,
    sensor: Arc<Mutex<SensorSimulator>>,
    link: Arc<Mutex<LinkSimulator>>,
    peripheral: PeripheralId,
    layout: FragmentLayout,
    frame_period: Duration,
    frames: usize,
    disconnect_after: Option<usize>,
}

impl FrameStream {
    async fn run(self) {
        for sent in 0..self.frames {
            if self.disconnect_after == Some(sent) {
                let _ = self
                    .inputs
                    .send(LinkInput::Disconnected {
                        peripheral: self.peripheral,
                        reason: Some("link loss".into()),
                    })
                    .await;
                return;
            }

            tokio::time::sleep(self.frame_period).await;
            let payload = {
                let mut sensor = self.sensor.lock();
                sensor.advance(1);
                sensor.payload()
            };
            let payload = match payload {
                Ok(payload) => payload,
                Err(err) => {
                    debug!(error = %err, "simulated sensor could not encode a frame");
                    return;
                }
            };

            let fragments = self.link.lock().transmit(&payload, &self.layout);
            for value in fragments {
                let input = LinkInput::Notification {
                    peripheral: self.peripheral.clone(),
                    value,
                };
                if self.inputs.send(input).await.is_err() {
                    return;
                }
            }
        }
    }
}

impl Central for SimulatedCentral {
    async fn start_scan(&mut self, service: Option<Uuid>) -> std::result::Result<(), RadioError> {
        self.log.lock().scans += 1;
        if service.is_some_and(|service| service != self.script.service) {
            return Ok(());
        }
        let name = format!("ABBOTT{}", self.sensor.lock().identity().serial_number());
        self.push(LinkInput::Discovered(Advertisement {
            id: self.script.peripheral.clone(),
            name: Some(name),
            address: self.script.address.clone(),
            services: vec![self.script.service],
        }))
    }

    async fn stop_scan(&mut self) -> std::result::Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&mut self, peripheral: &PeripheralId) -> std::result::Result<(), RadioError> {
        if *peripheral != self.script.peripheral {
            return Err(RadioError::UnknownPeripheral(peripheral.0.clone()));
        }
        self.log.lock().connects += 1;
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return self.push(LinkInput::ConnectFailed {
                peripheral: peripheral.clone(),
                reason: "peripheral did not respond".into(),
            });
        }
        self.push(LinkInput::Connected(peripheral.clone()))
    }

    async fn cancel_connection(&mut self, peripheral: &PeripheralId) -> std::result::Result<(), RadioError> {
        self.stop_stream();
        self.push(LinkInput::Disconnected {
            peripheral: peripheral.clone(),
            reason: None,
        })
    }

    async fn write(
        &mut self,
        _peripheral: &PeripheralId,
        characteristic: Uuid,
        value: &[u8],
    ) -> std::result::Result<(), RadioError> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(RadioError::Operation("write not acknowledged".into()));
        }
        self.log.lock().writes.push((characteristic, value.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        _characteristic: Uuid,
    ) -> std::result::Result<(), RadioError> {
        self.log.lock().subscriptions += 1;
        self.stop_stream();
        let stream = FrameStream {
            inputs: self.inputs.clone(),
            sensor: self.sensor.clone(),
            link: self.link.clone(),
            peripheral: peripheral.clone(),
            layout: self.script.layout.clone(),
            frame_period: self.script.frame_period,
            frames: self.script.frames,
            disconnect_after: self.disconnect_after.take(),
        };
        self.stream = Some(tokio::spawn(stream.run()));
        Ok(())
    }
}

impl Drop for SimulatedCentral {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Server-side state of a [`SimulatedRelay`].
#[derive(Debug)]
pub struct RelayServerState {
    pub email: String,
    pub password: String,
    /// Region the global host redirects logins to
    pub redirect_region: Option<String>,
    /// Regional hosts redirect again
    pub redirect_loop: bool,
    /// Upcoming requests answered with a 502
    pub failing_requests: usize,
    /// Envelope statuses for upcoming requests, answered with HTTP 200 and a
    /// pending user step instead of data
    pub status_replies: Vec<i64>,
    pub token: Option<String>,
    pub logins: usize,
    pub requests: Vec<RelayRequest>,
    /// Server time of the first graph answer
    pub started: DateTime<Utc>,
    /// Server time of the latest graph answer
    pub now: DateTime<Utc>,
    /// Minutes the server clock moves per graph request
    pub minutes_per_poll: i64,
    pub curve: GlucoseCurve,
}

/// Scripted follower API.
#[derive(Debug, Clone)]
pub struct SimulatedRelay {
    state: Arc<Mutex<RelayServerState>>,
}

const PATIENT_ID: &str = "patient-1";

impl SimulatedRelay {
    pub fn new(email: &str, password: &str, seed: u64) -> Self {
        let now = Utc
            .with_ymd_and_hms(2026, 1, 1, 8, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            state: Arc::new(Mutex::new(RelayServerState {
                email: email.to_string(),
                password: password.to_string(),
                redirect_region: None,
                redirect_loop: false,
                failing_requests: 0,
                status_replies: Vec::new(),
                token: None,
                logins: 0,
                requests: Vec::new(),
                started: now,
                now,
                minutes_per_poll: 1,
                curve: GlucoseCurve::new(seed),
            })),
        }
    }

    pub fn state(&self) -> Arc<Mutex<RelayServerState>> {
        self.state.clone()
    }

    /// Invalidate the issued token; the next authenticated call gets a 401.
    pub fn revoke_token(&self) {
        self.state.lock().token = None;
    }

    fn json(status: u16, body: serde_json::Value) -> RelayResponse {
        RelayResponse {
            status,
            body: body.to_string().into_bytes(),
        }
    }

    fn measurement(state: &RelayServerState, at: DateTime<Utc>) -> serde_json::Value {
        let minute = (at - state.started).num_minutes().max(0) as u32;
        serde_json::json!({
            "FactoryTimestamp": at.format(TIMESTAMP_FORMAT).to_string(),
            "ValueInMgPerDl": state.curve.value_at(minute).round(),
        })
    }

    fn answer(state: &mut RelayServerState, request: &RelayRequest) -> RelayResponse {
        if state.failing_requests > 0 {
            state.failing_requests -= 1;
            return RelayResponse {
                status: 502,
                body: b"bad gateway".to_vec(),
            };
        }
        if !state.status_replies.is_empty() {
            let status = state.status_replies.remove(0);
            return Self::json(200, serde_json::json!({"status": status, "data": {"step": {"type": "tou"}}}));
        }

        let regional = !request.url.starts_with(crate::relay::DEFAULT_BASE_URL);
        if request.method == Method::Post && request.url.ends_with(LOGIN_PATH) {
            let body = request.body.clone().unwrap_or_default();
            let matches = body["email"] == state.email.as_str() && body["password"] == state.password.as_str();
            if !matches {
                return Self::json(200, serde_json::json!({"status": 2, "error": {"message": "notAuthenticated"}}));
            }
            if let Some(region) = state.redirect_region.clone() {
                if !regional || state.redirect_loop {
                    return Self::json(
                        200,
                        serde_json::json!({"status": 0, "data": {"redirect": true, "region": region}}),
                    );
                }
            }
            state.logins += 1;
            let token = format!("token-{}", state.logins);
            state.token = Some(token.clone());
            // the client checks expiry against its own wall clock
            let expires = (Utc::now() + ChronoDuration::hours(1)).timestamp();
            return Self::json(
                200,
                serde_json::json!({
                    "status": 0,
                    "data": {
                        "user": {"id": "user-1"},
                        "authTicket": {"token": token, "expires": expires, "duration": 3_600_000},
                    }
                }),
            );
        }

        let authorized = state.token.as_ref().is_some_and(|token| {
            request
                .headers
                .iter()
                .any(|(name, value)| name == "Authorization" && *value == format!("Bearer {token}"))
        });
        if !authorized {
            return RelayResponse {
                status: 401,
                body: Vec::new(),
            };
        }

        let graph_path = format!("{CONNECTIONS_PATH}/{PATIENT_ID}/graph");
        if request.url.ends_with(&graph_path) {
            state.now += ChronoDuration::minutes(state.minutes_per_poll);
            let now = state.now;
            let history: Vec<serde_json::Value> = (1..=3)
                .rev()
                .map(|k| Self::measurement(state, now - ChronoDuration::minutes(15 * k)))
                .collect();
            let latest = Self::measurement(state, now);
            return Self::json(
                200,
                serde_json::json!({
                    "status": 0,
                    "data": {
                        "connection": {"glucoseMeasurement": latest},
                        "graphData": history,
                    }
                }),
            );
        }
        if request.url.ends_with(CONNECTIONS_PATH) {
            return Self::json(200, serde_json::json!({"status": 0, "data": [{"patientId": PATIENT_ID}]}));
        }

        RelayResponse {
            status: 404,
            body: b"not found".to_vec(),
        }
    }
}

impl RelayTransport for SimulatedRelay {
    async fn send(&self, request: RelayRequest) -> std::result::Result<RelayResponse, RelayError> {
        let mut state = self.state.lock();
        let response = Self::answer(&mut state, &request);
        state.requests.push(request);
        Ok(response)
    }
}
