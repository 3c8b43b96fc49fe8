//! Error types for the telemetry engine.
//!
//! All operations return structured errors rather than panicking. The variants
//! follow the failure classes of the system:
//! - radio session errors (NFC round trips, BLE operations): retried, then terminal
//! - payload integrity errors (short buffers, CRC mismatch): fatal to one frame only
//! - connection lifecycle errors: absorbed by the reconnection policy
//! - credential errors (relay variant): surfaced to the user, connection torn down

use crate::sensor::SensorType;
use thiserror::Error;

/// Top-level error type for all operations in the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Bit-field access outside a buffer or with an invalid width
    #[error("bit I/O error: {0}")]
    BitIo(#[from] BitIoError),

    /// Payload integrity or identity error
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Pairing session failed
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// A single NFC round trip failed
    #[error("NFC error: {0}")]
    Nfc(#[from] NfcError),

    /// BLE central operation failed
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// Fragment reassembly problem
    #[error("reassembly error: {0}")]
    Reassembly(#[from] ReassemblyError),

    /// Cloud relay failure
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Key-value persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Channel communication error
    #[error("channel error: {0}")]
    Channel(String),
}

/// Bit-level I/O errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BitIoError {
    /// The field extends past the end of the buffer
    #[error("field ends at bit {required_bits}, buffer holds {available_bits}")]
    OutOfBounds {
        required_bits: usize,
        available_bits: usize,
    },

    /// Field wider than 16 bits
    #[error("invalid bit count: {0}")]
    InvalidBitCount(usize),
}

/// Payload integrity and identity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Buffer is shorter (or longer) than its fixed layout
    #[error("undersized buffer: need {required} bytes, got {actual}")]
    UndersizedBuffer { required: usize, actual: usize },

    /// CRC trailer does not match the decrypted body
    #[error("CRC mismatch: stored {expected:#06x}, computed {actual:#06x}")]
    Crc { expected: u16, actual: u16 },

    /// Sensor UID is not exactly 8 bytes
    #[error("invalid sensor identity: {len} byte UID")]
    InvalidIdentity { len: usize },

    /// Memory image cipher unknown for this sensor type
    #[error("unsupported sensor family: {0}")]
    UnsupportedFamily(SensorType),
}

/// Failure of one NFC round trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NfcError {
    #[error("no tag in range")]
    NoTag,

    #[error("tag did not answer in time")]
    Timeout,

    #[error("tag connection lost")]
    TagLost,

    #[error("transceive failed: {0}")]
    Transceive(String),
}

/// Terminal failure of a pairing session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("no sensor found")]
    NoTag,

    #[error("tag is not an ISO 15693 sensor ({0})")]
    WrongTagTechnology(String),

    #[error("could not connect to sensor: {0}")]
    ConnectFailed(String),

    #[error("invalid sensor identity: {0}")]
    InvalidIdentity(String),

    #[error("memory read failed at request {request}: {reason}")]
    ReadFailed { request: usize, reason: String },

    #[error("undersized buffer: need {required} bytes, got {actual}")]
    UndersizedBuffer { required: usize, actual: usize },

    #[error("unsupported sensor: {0}")]
    UnsupportedFamily(SensorType),

    #[error("memory image could not be decoded: {0}")]
    Decode(String),

    #[error("sensor rejected streaming unlock: {0}")]
    StreamingRejected(String),

    #[error("sensor activation failed: {0}")]
    ActivationFailed(String),

    #[error("unlock counter unavailable: {0}")]
    CounterUnavailable(String),

    #[error("pairing session cancelled")]
    Cancelled,
}

/// BLE central errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("bluetooth is not powered on")]
    NotPowered,

    #[error("unknown peripheral {0}")]
    UnknownPeripheral(String),

    #[error("radio operation failed: {0}")]
    Operation(String),
}

/// Fragment reassembly errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Update length matches no fragment of the profile's layout
    #[error("unrecognized fragment length {len}")]
    UnrecognizedLength { len: usize },

    /// A partial frame sat too long and was discarded
    #[error("stale partial frame discarded after {age_ms}ms (missing {missing} fragments)")]
    Stale { age_ms: u64, missing: usize },

    /// A fragment arrived for a slot already filled; the old partial frame was dropped
    #[error("fragment of {len} bytes restarted an incomplete frame")]
    Restarted { len: usize },
}

/// Cloud relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credentials rejected; never retried silently
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Session token rejected by the server
    #[error("session token rejected")]
    Unauthorized,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Nonzero envelope status other than rejected credentials
    #[error("relay answered status {status}: {message}")]
    Status { status: i64, message: String },

    #[error("region redirect loop (already redirected, asked for {region})")]
    RedirectLoop { region: String },

    #[error("account has no connected sensors")]
    NoConnections,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    /// Credential errors are user-visible and tear the connection down.
    pub fn is_credential_error(&self) -> bool {
        matches!(self, Self::InvalidCredentials(_) | Self::RedirectLoop { .. })
    }
}

/// Key-value store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    /// An increment-only counter reached its maximum
    #[error("counter {0} exhausted")]
    CounterExhausted(String),
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
