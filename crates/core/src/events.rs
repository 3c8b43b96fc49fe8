//! What a link reports to its consumer.

use crate::reading::ReadingBatch;
use crate::sensor::SensorLifecycle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle, owned by the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// Credential handshake with a relay service
    Pairing,
    PowerOff,
    Unknown,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Pairing => "pairing",
            Self::PowerOff => "power off",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkErrorKind {
    /// Radio switched off under a live connection
    PeripheralDisconnected,
    /// Relay credentials rejected
    Credentials,
    /// A scan, write or subscription failed
    Radio,
}

/// A user-visible failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
    pub critical: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkEvent {
    State(ConnectionState),
    Readings(ReadingBatch),
    Lifecycle {
        age_minutes: u32,
        lifecycle: SensorLifecycle,
    },
    Error(LinkError),
}
