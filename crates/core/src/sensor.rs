//! Sensor identity and classification.
//!
//! A sensor is identified by the 8-byte UID of its NFC tag and the 6-byte
//! "patch info" returned by the vendor identity request. Patch info encodes the
//! product generation, family and sales region, which in turn decide how the
//! memory image is encrypted and whether the sensor can stream over BLE.

use crate::error::{FrameError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the tag UID.
pub const UID_LEN: usize = 8;

/// Length of the patch info block.
pub const PATCH_INFO_LEN: usize = 6;

/// Minutes after activation before readings are trusted.
pub const WARMUP_MINUTES: u32 = 60;

/// Lifetime used when the image does not carry one.
pub const DEFAULT_MAX_LIFE_MINUTES: u32 = 14 * 24 * 60 + 12 * 60;

/// Tag UID in sensor byte order (manufacturer code in the last two bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorUid(pub [u8; UID_LEN]);

impl SensorUid {
    /// Build a UID from an exactly 8-byte slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let uid: [u8; UID_LEN] = bytes
            .try_into()
            .map_err(|_| FrameError::InvalidIdentity { len: bytes.len() })?;
        Ok(Self(uid))
    }

    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// Little-endian word made of bytes `index` and `index + 1`.
    pub(crate) fn word(&self, index: usize) -> u16 {
        u16::from_le_bytes([self.0[index], self.0[index + 1]])
    }
}

impl fmt::Display for SensorUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Patch info block from the identity request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatchInfo(pub [u8; PATCH_INFO_LEN]);

impl PatchInfo {
    /// Take the first six bytes of an identity-request response.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PATCH_INFO_LEN {
            return Err(FrameError::UndersizedBuffer {
                required: PATCH_INFO_LEN,
                actual: bytes.len(),
            }
            .into());
        }
        let mut info = [0u8; PATCH_INFO_LEN];
        info.copy_from_slice(&bytes[..PATCH_INFO_LEN]);
        Ok(Self(info))
    }

    pub fn as_bytes(&self) -> &[u8; PATCH_INFO_LEN] {
        &self.0
    }

    /// Little-endian word made of bytes 4 and 5, mixed into most key derivations.
    pub(crate) fn tail_word(&self) -> u16 {
        u16::from_le_bytes([self.0[4], self.0[5]])
    }
}

/// Immutable identity of one physical sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorIdentity {
    pub uid: SensorUid,
    pub patch_info: PatchInfo,
}

impl SensorIdentity {
    pub fn new(uid: SensorUid, patch_info: PatchInfo) -> Self {
        Self { uid, patch_info }
    }

    pub fn sensor_type(&self) -> SensorType {
        SensorType::from_patch_info(&self.patch_info)
    }

    pub fn family(&self) -> SensorFamily {
        SensorFamily::from(self.patch_info.0[2] >> 4)
    }

    pub fn region(&self) -> SensorRegion {
        SensorRegion::from(self.patch_info.0[3])
    }

    /// Printed serial number, derived from the UID.
    ///
    /// The first six UID bytes, most significant first, are cut into ten 5-bit
    /// groups and mapped through the vendor alphabet, behind a family digit.
    pub fn serial_number(&self) -> String {
        const ALPHABET: &[u8; 32] = b"0123456789ACDEFGHJKLMNPQRTUVWXYZ";

        let uid = self.uid.0;
        let b = [uid[5], uid[4], uid[3], uid[2], uid[1], uid[0]];
        let groups = [
            b[0] >> 3,
            (b[0] << 2) | (b[1] >> 6),
            b[1] >> 1,
            (b[1] << 4) | (b[2] >> 4),
            (b[2] << 1) | (b[3] >> 7),
            b[3] >> 2,
            (b[3] << 3) | (b[4] >> 5),
            b[4],
            b[5] >> 3,
            b[5] << 2,
        ];

        let mut serial = String::with_capacity(11);
        serial.push(char::from(b'0' + (self.family().code() % 10)));
        for group in groups {
            serial.push(char::from(ALPHABET[usize::from(group & 0x1F)]));
        }
        serial
    }
}

/// How a sensor's memory image is obfuscated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCipher {
    /// Image is stored in the clear.
    Plain,
    /// Every block keyed with the patch info tail XOR 0x44.
    Libre2,
    /// Header and footer blocks keyed with a fixed constant, body with the patch info tail.
    Us14Day,
}

/// Product generation, decided by the first patch info byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    Libre1,
    LibreUs14Day,
    LibreProH,
    Libre2,
    Libre2Us,
    Libre2Ca,
    LibreSense,
    Unknown(u8),
}

impl SensorType {
    pub fn from_patch_info(info: &PatchInfo) -> Self {
        let info = info.0;
        match info[0] {
            0xDF | 0xA2 => Self::Libre1,
            0xE5 | 0xE6 => Self::LibreUs14Day,
            0x70 => Self::LibreProH,
            0x9D | 0xC5 | 0xC6 => Self::Libre2,
            0x76 => match info[3] {
                0x02 => Self::Libre2Us,
                0x04 => Self::Libre2Ca,
                _ if info[2] >> 4 == 7 => Self::LibreSense,
                _ => Self::Unknown(0x76),
            },
            other => Self::Unknown(other),
        }
    }

    /// Cipher protecting the memory image, or `None` if this crate cannot read it.
    pub fn memory_cipher(&self) -> Option<MemoryCipher> {
        match self {
            Self::Libre1 => Some(MemoryCipher::Plain),
            Self::LibreUs14Day => Some(MemoryCipher::Us14Day),
            Self::Libre2 => Some(MemoryCipher::Libre2),
            _ => None,
        }
    }

    /// Whether the sensor can be unlocked for BLE streaming.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, Self::Libre2)
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Libre1 => write!(f, "Libre 1"),
            Self::LibreUs14Day => write!(f, "Libre US 14 day"),
            Self::LibreProH => write!(f, "Libre Pro/H"),
            Self::Libre2 => write!(f, "Libre 2"),
            Self::Libre2Us => write!(f, "Libre 2 US"),
            Self::Libre2Ca => write!(f, "Libre 2 CA"),
            Self::LibreSense => write!(f, "Libre Sense"),
            Self::Unknown(code) => write!(f, "unknown sensor ({code:#04x})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorFamily {
    Libre1,
    LibrePro,
    Libre2,
    LibreSense,
    Unknown(u8),
}

impl SensorFamily {
    pub fn code(&self) -> u8 {
        match self {
            Self::Libre1 => 0,
            Self::LibrePro => 1,
            Self::Libre2 => 3,
            Self::LibreSense => 7,
            Self::Unknown(code) => *code,
        }
    }
}

impl From<u8> for SensorFamily {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Libre1,
            1 => Self::LibrePro,
            3 => Self::Libre2,
            7 => Self::LibreSense,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorRegion {
    European,
    Usa,
    AustralianCanadian,
    EasternRestOfWorld,
    Unknown(u8),
}

impl From<u8> for SensorRegion {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::European,
            2 => Self::Usa,
            4 => Self::AustralianCanadian,
            8 => Self::EasternRestOfWorld,
            other => Self::Unknown(other),
        }
    }
}

/// Sensor state byte stored in the memory image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorState {
    NotActivated,
    WarmingUp,
    Active,
    Expired,
    Shutdown,
    Failure,
    Unknown(u8),
}

impl From<u8> for SensorState {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::NotActivated,
            2 => Self::WarmingUp,
            3 => Self::Active,
            4 => Self::Expired,
            5 => Self::Shutdown,
            6 => Self::Failure,
            other => Self::Unknown(other),
        }
    }
}

/// Coarse lifecycle reported to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorLifecycle {
    NotYetStarted,
    Starting,
    Ready,
    Expired,
}

impl SensorLifecycle {
    /// Lifecycle implied by sensor age alone.
    pub fn from_age(age_minutes: u32, max_life_minutes: u32) -> Self {
        if age_minutes >= max_life_minutes {
            Self::Expired
        } else if age_minutes < WARMUP_MINUTES {
            Self::Starting
        } else {
            Self::Ready
        }
    }

    /// Lifecycle from the image's state byte, falling back to age.
    pub fn from_state(state: SensorState, age_minutes: u32, max_life_minutes: u32) -> Self {
        match state {
            SensorState::NotActivated => Self::NotYetStarted,
            SensorState::Expired | SensorState::Shutdown | SensorState::Failure => Self::Expired,
            SensorState::WarmingUp => Self::Starting,
            SensorState::Active | SensorState::Unknown(_) => Self::from_age(age_minutes, max_life_minutes),
        }
    }
}
