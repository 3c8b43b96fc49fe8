//! Raw and calibrated glucose readings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

/// Vendor quality flags attached to a raw reading.
///
/// The low eleven bits carry the sensor's quality word (or, for a zero glucose
/// count, the high bits of the temperature field); bit 15 marks the record's
/// hardware error bit. Any nonzero mask disqualifies the reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GlucoseError(u16);

impl GlucoseError {
    pub const NONE: Self = Self(0);
    pub const HARDWARE: Self = Self(0x8000);

    const QUALITY_MASK: u16 = 0x07FF;

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags of a memory-image record: quality word plus the error bit.
    pub fn from_quality(quality: u16, has_error: bool) -> Self {
        let flags = Self(quality & Self::QUALITY_MASK);
        if has_error {
            flags | Self::HARDWARE
        } else {
            flags
        }
    }

    /// Flags encoded in the temperature field when the glucose count is zero.
    pub fn from_temperature_field(field: u16) -> Self {
        Self((field >> 4) & Self::QUALITY_MASK)
    }
}

impl BitOr for GlucoseError {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Counts decoded from one sensor record, before calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReading {
    /// 14-bit glucose count
    pub raw_glucose: u16,
    /// Thermistor count, already shifted left by two
    pub raw_temperature: u16,
    /// Signed adjustment count, already shifted left by two
    pub temperature_adjustment: i32,
    pub error: GlucoseError,
}

impl RawReading {
    /// A reading is usable when it has a glucose count and no quality flags.
    pub fn is_valid(&self) -> bool {
        self.raw_glucose != 0 && self.error.is_empty()
    }
}

/// Which rolling window a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingKind {
    /// 1-minute resolution, most recent
    Trend,
    /// 15-minute resolution, backfill
    History,
}

/// A calibrated, timestamped reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub timestamp: DateTime<Utc>,
    /// Sensor age of the sample; unknown for relay readings
    pub age_minutes: Option<u32>,
    pub mg_dl: f64,
    pub kind: ReadingKind,
    /// Source counts, absent for relay readings
    pub raw: Option<RawReading>,
}

/// Trend and history readings from one decode, each sorted ascending by time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingBatch {
    pub trend: Vec<GlucoseReading>,
    pub history: Vec<GlucoseReading>,
}

impl ReadingBatch {
    /// Most recent trend reading ("next" value for consumers).
    pub fn latest(&self) -> Option<&GlucoseReading> {
        self.trend.last()
    }

    pub fn is_empty(&self) -> bool {
        self.trend.is_empty() && self.history.is_empty()
    }

    pub fn len(&self) -> usize {
        self.trend.len() + self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_flags() {
        assert!(GlucoseError::from_quality(0, false).is_empty());
        assert_eq!(GlucoseError::from_quality(0x7FF, false).bits(), 0x7FF);
        let flagged = GlucoseError::from_quality(0, true);
        assert!(flagged.contains(GlucoseError::HARDWARE));
        assert!(!flagged.is_empty());
    }

    #[test]
    fn test_temperature_field_flags() {
        assert_eq!(GlucoseError::from_temperature_field(0xA50).bits(), 0xA5);
        assert!(GlucoseError::from_temperature_field(0x00F).is_empty());
    }

    #[test]
    fn test_validity() {
        let mut reading = RawReading {
            raw_glucose: 1500,
            raw_temperature: 7856,
            temperature_adjustment: 0,
            error: GlucoseError::NONE,
        };
        assert!(reading.is_valid());

        reading.raw_glucose = 0;
        assert!(!reading.is_valid());

        reading.raw_glucose = 1500;
        reading.error = GlucoseError::HARDWARE;
        assert!(!reading.is_valid());
    }
}
