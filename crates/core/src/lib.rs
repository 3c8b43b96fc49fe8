//! cgm-link-core: telemetry acquisition and decoding for continuous glucose sensors
//!
//! This library provides the components that turn a sensor's radio traffic
//! into calibrated readings:
//! - Pairs with a sensor over NFC, reading its identity and encrypted memory image
//! - Decrypts the memory image and BLE stream payloads with the vendor cipher
//! - Decodes bit-packed records into trend and history readings
//! - Keeps a BLE (or cloud relay) link alive and reassembles fragmented frames
//!
//! # Architecture
//!
//! Leaves first:
//! - `bitio`: arbitrary-width bit fields over byte buffers
//! - `crc`, `crypto`: CRC16 and the sensor's stream cipher
//! - `sensor`, `memory`, `reading`: identities, memory images, readings
//! - `calibration`: raw counts to mg/dL
//! - `parser`: memory images and BLE frames to readings
//! - `nfc`, `pairing`: the proximity pairing session
//! - `store`: persisted counters and identifiers
//! - `reassembly`, `profile`, `connection`, `driver`: the long-range link
//! - `relay`: cloud relay client
//! - `events`, `metrics`: what a link reports
//! - `sim`: seeded sensor, tag, link and relay simulators
//!
//! # Design Principles
//!
//! - **No panics**: All errors are structured and recoverable
//! - **Sans-IO core**: The connection policy is a pure state machine; I/O lives in the driver
//! - **Deterministic**: Seeded randomness makes simulated runs reproducible
//! - **Observable**: Counters for every kind of discarded data

pub mod bitio;
pub mod calibration;
pub mod connection;
pub mod crc;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod nfc;
pub mod pairing;
pub mod parser;
pub mod profile;
pub mod reading;
pub mod reassembly;
pub mod relay;
pub mod sensor;
pub mod sim;
pub mod store;

// Re-export commonly used types
pub use calibration::{Calibration, CustomCalibration, FactoryCalibration};
pub use connection::{ConnectionMachine, LinkConfig, LinkInput, SensorBinding};
pub use driver::{spawn_link, Central, LinkHandle};
pub use error::{Error, Result};
pub use events::{ConnectionState, LinkEvent};
pub use pairing::{start_pairing, PairingConfig, PairingRequest, PairingResult};
pub use reading::{GlucoseReading, ReadingBatch};
pub use sensor::{SensorIdentity, SensorType};
