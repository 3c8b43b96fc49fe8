//! The sensor's 344-byte FRAM image.
//!
//! # Layout (decrypted)
//!
//! ```text
//! offset  size  field
//! 0       2     header CRC
//! 2       2     calibration i1/i2 (bit fields)
//! 4       1     sensor state
//! 26      1     trend head index (0-15)
//! 27      1     history head index (0-31)
//! 28      96    16 trend records x 6 bytes
//! 124     192   32 history records x 6 bytes
//! 316     2     sensor age in minutes (LE)
//! 326     2     maximum life in minutes (LE)
//! 336     8     calibration i3..i6 (bit fields)
//! ```
//!
//! The image is read as 43 blocks of 8 bytes; encrypted images are keyed per block.

use crate::crypto::xor_memory_image;
use crate::error::{FrameError, Result};
use crate::sensor::{SensorIdentity, SensorState, DEFAULT_MAX_LIFE_MINUTES};

/// Bytes per memory block.
pub const BLOCK_LEN: usize = 8;

/// Blocks in a full image.
pub const BLOCK_COUNT: usize = 43;

/// Size of a full image.
pub const IMAGE_LEN: usize = BLOCK_LEN * BLOCK_COUNT;

pub const STATE_OFFSET: usize = 4;
pub const TREND_INDEX_OFFSET: usize = 26;
pub const HISTORY_INDEX_OFFSET: usize = 27;
pub const TREND_OFFSET: usize = 28;
pub const HISTORY_OFFSET: usize = 124;
pub const RECORD_LEN: usize = 6;
pub const TREND_SLOTS: usize = 16;
pub const HISTORY_SLOTS: usize = 32;
pub const AGE_OFFSET: usize = 316;
pub const MAX_LIFE_OFFSET: usize = 326;
pub const CALIBRATION_OFFSET: usize = 0x150;

fn image_array(bytes: &[u8]) -> Result<[u8; IMAGE_LEN]> {
    bytes.try_into().map_err(|_| {
        FrameError::UndersizedBuffer {
            required: IMAGE_LEN,
            actual: bytes.len(),
        }
        .into()
    })
}

/// Image exactly as read off the tag, possibly encrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMemoryImage([u8; IMAGE_LEN]);

impl RawMemoryImage {
    /// Wrap an image; anything but exactly 344 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(image_array(bytes)?))
    }

    pub fn as_bytes(&self) -> &[u8; IMAGE_LEN] {
        &self.0
    }

    /// Decrypt with the cipher implied by the sensor's patch info.
    ///
    /// # Errors
    /// `FrameError::UnsupportedFamily` if the sensor type has no known cipher.
    pub fn decrypt(&self, identity: &SensorIdentity) -> Result<MemoryImage> {
        let sensor_type = identity.sensor_type();
        let cipher = sensor_type
            .memory_cipher()
            .ok_or(FrameError::UnsupportedFamily(sensor_type))?;

        let mut data = self.0;
        xor_memory_image(identity, cipher, &mut data);
        Ok(MemoryImage(data))
    }
}

impl std::fmt::Debug for RawMemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawMemoryImage({} bytes)", IMAGE_LEN)
    }
}

/// Decrypted image with typed accessors for the header and footer fields.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryImage([u8; IMAGE_LEN]);

impl MemoryImage {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(image_array(bytes)?))
    }

    /// An all-zero image, the starting point of the simulator's encoder.
    pub fn zeroed() -> Self {
        Self([0; IMAGE_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; IMAGE_LEN] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; IMAGE_LEN] {
        &mut self.0
    }

    /// Re-encrypt for the given sensor.
    pub fn encrypt(&self, identity: &SensorIdentity) -> Result<RawMemoryImage> {
        let sensor_type = identity.sensor_type();
        let cipher = sensor_type
            .memory_cipher()
            .ok_or(FrameError::UnsupportedFamily(sensor_type))?;

        let mut data = self.0;
        xor_memory_image(identity, cipher, &mut data);
        Ok(RawMemoryImage(data))
    }

    pub fn state(&self) -> SensorState {
        SensorState::from(self.0[STATE_OFFSET])
    }

    /// Slot the next trend record will be written to.
    pub fn trend_index(&self) -> usize {
        usize::from(self.0[TREND_INDEX_OFFSET]) % TREND_SLOTS
    }

    /// Slot the next history record will be written to.
    pub fn history_index(&self) -> usize {
        usize::from(self.0[HISTORY_INDEX_OFFSET]) % HISTORY_SLOTS
    }

    /// Minutes since the sensor was activated.
    pub fn age_minutes(&self) -> u32 {
        u32::from(u16::from_le_bytes([self.0[AGE_OFFSET], self.0[AGE_OFFSET + 1]]))
    }

    /// Rated lifetime in minutes; falls back to the standard lifetime when unset.
    pub fn max_life_minutes(&self) -> u32 {
        match u16::from_le_bytes([self.0[MAX_LIFE_OFFSET], self.0[MAX_LIFE_OFFSET + 1]]) {
            0 => DEFAULT_MAX_LIFE_MINUTES,
            minutes => u32::from(minutes),
        }
    }

    /// Byte offset of trend slot `slot`.
    pub fn trend_record_offset(slot: usize) -> usize {
        TREND_OFFSET + (slot % TREND_SLOTS) * RECORD_LEN
    }

    /// Byte offset of history slot `slot`.
    pub fn history_record_offset(slot: usize) -> usize {
        HISTORY_OFFSET + (slot % HISTORY_SLOTS) * RECORD_LEN
    }
}

impl std::fmt::Debug for MemoryImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryImage")
            .field("state", &self.state())
            .field("age_minutes", &self.age_minutes())
            .field("trend_index", &self.trend_index())
            .field("history_index", &self.history_index())
            .finish()
    }
}
