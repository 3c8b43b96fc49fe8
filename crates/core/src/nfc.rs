//! ISO 15693 command shapes and the NFC transport seam.
//!
//! The pairing session talks to the tag only through [`NfcTransport`], so a
//! platform reader and the simulated tag in [`crate::sim`] are interchangeable.

use crate::crypto::{activate_parameters, enable_streaming_parameters};
use crate::error::NfcError;
use crate::memory::{BLOCK_COUNT, BLOCK_LEN};
use crate::sensor::{SensorIdentity, SensorUid};
use std::future::Future;

/// Request flags: high data rate.
pub const FLAGS_HIGH_RATE: u8 = 0x02;

/// Vendor custom command code.
pub const CUSTOM_COMMAND: u8 = 0xA1;

/// Sensor vendor IC manufacturer code.
pub const MANUFACTURER_CODE: u8 = 0x07;

/// ISO 15693 Read Multiple Blocks.
pub const READ_MULTIPLE_BLOCKS: u8 = 0x23;

/// Most blocks one read request may ask for.
pub const MAX_BLOCKS_PER_READ: usize = 3;

/// Response flag marking a tag-side error.
const RESPONSE_ERROR_FLAG: u8 = 0x01;

/// Air interface reported by the reader for a detected tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagTechnology {
    Iso15693,
    Other(String),
}

/// A tag found in the field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedTag {
    pub technology: TagTechnology,
    /// UID as reported by the reader, in sensor byte order
    pub uid: Vec<u8>,
}

/// Exclusive access to one proximity reader session.
///
/// Implementations own the radio for as long as they live; dropping the
/// transport releases it.
pub trait NfcTransport: Send {
    /// Wait for a tag to enter the field.
    fn detect_tag(&mut self) -> impl Future<Output = Result<DetectedTag, NfcError>> + Send;

    /// Open a session with the detected tag.
    fn connect(&mut self) -> impl Future<Output = Result<(), NfcError>> + Send;

    /// Send one raw command frame and return the raw response, flags byte included.
    fn transceive(&mut self, command: &[u8]) -> impl Future<Output = Result<Vec<u8>, NfcError>> + Send;

    /// End the session, showing `message` on platforms with a reader UI.
    fn invalidate(&mut self, message: &str);
}

/// Vendor custom command without parameters; the answer carries the patch info.
pub fn identity_request_command() -> Vec<u8> {
    vec![FLAGS_HIGH_RATE, CUSTOM_COMMAND, MANUFACTURER_CODE]
}

fn custom_command(parameters: &[u8]) -> Vec<u8> {
    let mut command = identity_request_command();
    command.extend_from_slice(parameters);
    command
}

/// Custom command that activates a fresh sensor.
pub fn activate_command(uid: &SensorUid) -> Vec<u8> {
    custom_command(&activate_parameters(uid))
}

/// Custom command that enables BLE streaming under `unlock_code`.
pub fn enable_streaming_command(identity: &SensorIdentity, unlock_code: u32) -> Vec<u8> {
    custom_command(&enable_streaming_parameters(identity, unlock_code))
}

/// Read Multiple Blocks; `count` is encoded as `count - 1` on the wire.
pub fn read_blocks_command(first_block: u8, count: u8) -> Vec<u8> {
    vec![FLAGS_HIGH_RATE, READ_MULTIPLE_BLOCKS, first_block, count.saturating_sub(1)]
}

/// One chunk of the full memory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Position of this request in the plan; also its slot in the output buffer
    pub index: usize,
    pub first_block: usize,
    pub block_count: usize,
}

impl ReadRequest {
    pub fn command(&self) -> Vec<u8> {
        read_blocks_command(self.first_block as u8, self.block_count as u8)
    }

    pub fn byte_range(&self) -> std::ops::Range<usize> {
        let start = self.first_block * BLOCK_LEN;
        start..start + self.block_count * BLOCK_LEN
    }
}

/// Requests covering the whole 43-block image, three blocks at a time.
pub fn read_plan() -> Vec<ReadRequest> {
    (0..BLOCK_COUNT)
        .step_by(MAX_BLOCKS_PER_READ)
        .enumerate()
        .map(|(index, first_block)| ReadRequest {
            index,
            first_block,
            block_count: MAX_BLOCKS_PER_READ.min(BLOCK_COUNT - first_block),
        })
        .collect()
}

/// Strip the flags byte from a tag response.
///
/// # Errors
/// `NfcError::Transceive` for an empty response or one with the error flag set.
pub fn response_payload(response: &[u8]) -> Result<&[u8], NfcError> {
    match response.split_first() {
        None => Err(NfcError::Transceive("empty response".into())),
        Some((flags, rest)) if flags & RESPONSE_ERROR_FLAG != 0 => Err(NfcError::Transceive(format!(
            "tag error code {:#04x}",
            rest.first().copied().unwrap_or(0)
        ))),
        Some((_, rest)) => Ok(rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_plan_covers_image() {
        let plan = read_plan();
        assert_eq!(plan.len(), 15);
        assert_eq!(plan[0].command(), vec![0x02, 0x23, 0, 2]);
        assert_eq!(plan[14].first_block, 42);
        assert_eq!(plan[14].block_count, 1);
        assert_eq!(plan[14].command(), vec![0x02, 0x23, 42, 0]);

        let total: usize = plan.iter().map(|r| r.block_count).sum();
        assert_eq!(total, BLOCK_COUNT);
        assert!(plan.iter().all(|r| r.block_count <= MAX_BLOCKS_PER_READ));
        assert_eq!(plan[14].byte_range(), 336..344);
    }

    #[test]
    fn test_custom_command_shape() {
        assert_eq!(identity_request_command(), vec![0x02, 0xA1, 0x07]);

        let uid = SensorUid([0x15, 0x8A, 0x3B, 0x01, 0x00, 0xA0, 0x07, 0xE0]);
        assert_eq!(activate_command(&uid), vec![0x02, 0xA1, 0x07, 0x1B, 0x33, 0x52, 0xD2, 0x5D]);
    }

    #[test]
    fn test_response_payload() {
        assert_eq!(response_payload(&[0x00, 1, 2]).unwrap(), &[1, 2]);
        assert!(response_payload(&[]).is_err());
        assert!(response_payload(&[0x01, 0x0F]).is_err());
    }
}
