//! Decoding of decrypted memory images and BLE frames into readings.
//!
//! Both sources hold a rolling window of records addressed by minutes since
//! sensor start ("age"). Records are decoded with fixed [`BitField`] layouts,
//! flagged readings are dropped, the rest are calibrated and returned sorted
//! oldest first.
//!
//! # Memory image records (6 bytes)
//!
//! ```text
//! bits   0..14  glucose count
//! bits  14..25  quality word
//! bit   25      error flag
//! bits  26..38  temperature count (>> 2)
//! bits  38..47  temperature adjustment magnitude (>> 2)
//! bit   47      adjustment sign
//! ```
//!
//! # BLE frame records (4 bytes, ten per frame, age at bytes 40..42)
//!
//! ```text
//! bits   0..14  glucose count
//! bits  14..26  temperature count (>> 2)
//! bits  26..31  temperature adjustment magnitude (>> 2)
//! bit   31      adjustment sign
//! ```

use crate::bitio::BitField;
use crate::calibration::Calibration;
use crate::crypto::STREAM_FRAME_LEN;
use crate::error::Result;
use crate::memory::{MemoryImage, HISTORY_SLOTS, TREND_SLOTS};
use crate::reading::{GlucoseError, GlucoseReading, RawReading, ReadingBatch, ReadingKind};
use crate::sensor::{SensorLifecycle, SensorState};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Minutes between history samples.
pub const HISTORY_INTERVAL_MINUTES: i64 = 15;

/// Back-offsets in minutes of the seven trend samples in a BLE frame.
pub const FRAME_TREND_OFFSETS: [i64; 7] = [0, 2, 4, 6, 7, 12, 15];

/// History samples per BLE frame.
pub const FRAME_HISTORY_COUNT: usize = 3;

pub const FRAME_RECORD_LEN: usize = 4;
pub const FRAME_AGE_OFFSET: usize = 40;

struct ImageRecord;

impl ImageRecord {
    const GLUCOSE: BitField = BitField::new(0, 0, 14);
    const QUALITY: BitField = BitField::new(0, 14, 11);
    const ERROR: BitField = BitField::new(0, 25, 1);
    const TEMPERATURE: BitField = BitField::new(0, 26, 12);
    const ADJUSTMENT: BitField = BitField::new(0, 38, 9);
    const SIGN: BitField = BitField::new(0, 47, 1);
}

struct FrameRecord;

impl FrameRecord {
    const GLUCOSE: BitField = BitField::new(0, 0, 14);
    const TEMPERATURE: BitField = BitField::new(0, 14, 12);
    const ADJUSTMENT: BitField = BitField::new(0, 26, 5);
    const SIGN: BitField = BitField::new(0, 31, 1);
}

/// Decode the 6-byte memory image record starting at `offset`.
pub fn decode_image_record(buffer: &[u8], offset: usize) -> Result<RawReading> {
    let raw_glucose = ImageRecord::GLUCOSE.at(offset).read(buffer)?;
    let quality = ImageRecord::QUALITY.at(offset).read(buffer)?;
    let has_error = ImageRecord::ERROR.at(offset).read(buffer)? != 0;
    let temperature_field = ImageRecord::TEMPERATURE.at(offset).read(buffer)?;
    let adjustment = ImageRecord::ADJUSTMENT
        .at(offset)
        .read_signed(ImageRecord::SIGN.at(offset), buffer)?;

    let mut error = GlucoseError::from_quality(quality, has_error);
    if raw_glucose == 0 {
        error = error | GlucoseError::from_temperature_field(temperature_field);
    }

    Ok(RawReading {
        raw_glucose,
        raw_temperature: temperature_field << 2,
        temperature_adjustment: adjustment * 4,
        error,
    })
}

/// Write a reading as a 6-byte memory image record starting at `offset`.
pub fn encode_image_record(buffer: &mut [u8], offset: usize, reading: &RawReading) -> Result<()> {
    ImageRecord::GLUCOSE.at(offset).write(buffer, reading.raw_glucose)?;
    ImageRecord::QUALITY.at(offset).write(buffer, reading.error.bits() & 0x07FF)?;
    ImageRecord::ERROR
        .at(offset)
        .write(buffer, u16::from(reading.error.contains(GlucoseError::HARDWARE)))?;
    ImageRecord::TEMPERATURE.at(offset).write(buffer, reading.raw_temperature >> 2)?;
    ImageRecord::ADJUSTMENT
        .at(offset)
        .write_signed(ImageRecord::SIGN.at(offset), buffer, reading.temperature_adjustment / 4)
}

/// Decode the 4-byte BLE frame record starting at `offset`.
pub fn decode_frame_record(buffer: &[u8], offset: usize) -> Result<RawReading> {
    let raw_glucose = FrameRecord::GLUCOSE.at(offset).read(buffer)?;
    let temperature_field = FrameRecord::TEMPERATURE.at(offset).read(buffer)?;
    let adjustment = FrameRecord::ADJUSTMENT
        .at(offset)
        .read_signed(FrameRecord::SIGN.at(offset), buffer)?;

    let error = if raw_glucose == 0 {
        GlucoseError::from_temperature_field(temperature_field)
    } else {
        GlucoseError::NONE
    };

    Ok(RawReading {
        raw_glucose,
        raw_temperature: temperature_field << 2,
        temperature_adjustment: adjustment * 4,
        error,
    })
}

/// Write a reading as a 4-byte BLE frame record starting at `offset`.
pub fn encode_frame_record(buffer: &mut [u8], offset: usize, reading: &RawReading) -> Result<()> {
    FrameRecord::GLUCOSE.at(offset).write(buffer, reading.raw_glucose)?;
    FrameRecord::TEMPERATURE.at(offset).write(buffer, reading.raw_temperature >> 2)?;
    FrameRecord::ADJUSTMENT
        .at(offset)
        .write_signed(FrameRecord::SIGN.at(offset), buffer, reading.temperature_adjustment / 4)
}

/// Decoded memory image.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedImage {
    pub age_minutes: u32,
    pub max_life_minutes: u32,
    pub state: SensorState,
    pub lifecycle: SensorLifecycle,
    pub batch: ReadingBatch,
}

/// Decoded BLE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    pub age_minutes: u32,
    pub sensor_start: DateTime<Utc>,
    pub batch: ReadingBatch,
}

/// Calibrate one record, or `None` if it carries quality flags.
fn calibrate(
    calibration: &Calibration,
    sensor_start: DateTime<Utc>,
    age_minutes: i64,
    kind: ReadingKind,
    raw: RawReading,
) -> Option<GlucoseReading> {
    if age_minutes < 0 {
        return None;
    }
    if !raw.is_valid() {
        debug!(
            age_minutes,
            ?kind,
            raw_glucose = raw.raw_glucose,
            error = raw.error.bits(),
            "dropping flagged reading"
        );
        return None;
    }

    Some(GlucoseReading {
        timestamp: sensor_start + Duration::minutes(age_minutes),
        age_minutes: u32::try_from(age_minutes).ok(),
        mg_dl: calibration.glucose_mg_dl(&raw),
        kind,
        raw: Some(raw),
    })
}

fn sort_ascending(readings: &mut [GlucoseReading]) {
    readings.sort_by_key(|reading| reading.timestamp);
}

/// Age of the newest history sample held in a memory image.
///
/// The first history sample is written between 3 and 17 minutes after start,
/// then every 15 minutes. Below age 3 nothing has been written yet: the
/// euclidean remainder puts the newest sample at a negative age, so every
/// history slot is dropped instead of being dated at or after minute zero.
fn newest_history_age(age: i64) -> i64 {
    let delay = (age - 3).rem_euclid(HISTORY_INTERVAL_MINUTES) + 3;
    age - delay
}

/// Decode a decrypted memory image.
///
/// `sensor_start` is the wall-clock time of age zero, i.e. the read time minus
/// the image's age. Trend slot `i` back from the head holds age `age - i`;
/// history slot `i` holds the `i`-th 15-minute sample before the newest one.
pub fn parse_memory_image(
    calibration: &Calibration,
    sensor_start: DateTime<Utc>,
    image: &MemoryImage,
) -> Result<ParsedImage> {
    let bytes = image.as_bytes();
    let age = i64::from(image.age_minutes());
    let trend_index = image.trend_index();
    let history_index = image.history_index();

    let mut trend = Vec::with_capacity(TREND_SLOTS);
    for i in 0..TREND_SLOTS {
        let slot = (trend_index + TREND_SLOTS - 1 - i) % TREND_SLOTS;
        let raw = decode_image_record(bytes, MemoryImage::trend_record_offset(slot))?;
        trend.extend(calibrate(calibration, sensor_start, age - i as i64, ReadingKind::Trend, raw));
    }

    let newest_history = newest_history_age(age);
    let mut history = Vec::with_capacity(HISTORY_SLOTS);
    for i in 0..HISTORY_SLOTS {
        let slot = (history_index + HISTORY_SLOTS - 1 - i) % HISTORY_SLOTS;
        let id = newest_history - HISTORY_INTERVAL_MINUTES * i as i64;
        let raw = decode_image_record(bytes, MemoryImage::history_record_offset(slot))?;
        history.extend(calibrate(calibration, sensor_start, id, ReadingKind::History, raw));
    }

    sort_ascending(&mut trend);
    sort_ascending(&mut history);

    let state = image.state();
    let max_life_minutes = image.max_life_minutes();
    Ok(ParsedImage {
        age_minutes: image.age_minutes(),
        max_life_minutes,
        state,
        lifecycle: SensorLifecycle::from_state(state, image.age_minutes(), max_life_minutes),
        batch: ReadingBatch { trend, history },
    })
}

/// Ages of the ten samples in a BLE frame, trend first.
///
/// History samples sit on the 15-minute grid at or below `age - 2`. Before
/// minute 2 the sensor holds no history, so the floored division yields
/// negative history ages and the parser drops those slots.
pub fn frame_sample_ages(age: u32) -> [i64; 10] {
    let age = i64::from(age);
    let newest_history = (age - 2).div_euclid(HISTORY_INTERVAL_MINUTES) * HISTORY_INTERVAL_MINUTES;

    let mut ages = [0i64; 10];
    for (slot, offset) in ages.iter_mut().zip(FRAME_TREND_OFFSETS) {
        *slot = age - offset;
    }
    for k in 0..FRAME_HISTORY_COUNT {
        ages[FRAME_TREND_OFFSETS.len() + k] = newest_history - HISTORY_INTERVAL_MINUTES * k as i64;
    }
    ages
}

/// Decode a decrypted 44-byte BLE frame received at `received_at`.
pub fn parse_frame(
    calibration: &Calibration,
    received_at: DateTime<Utc>,
    frame: &[u8; STREAM_FRAME_LEN],
) -> Result<ParsedFrame> {
    let age_minutes = u32::from(u16::from_le_bytes([frame[FRAME_AGE_OFFSET], frame[FRAME_AGE_OFFSET + 1]]));
    let sensor_start = received_at - Duration::minutes(i64::from(age_minutes));

    let mut trend = Vec::with_capacity(FRAME_TREND_OFFSETS.len());
    let mut history = Vec::with_capacity(FRAME_HISTORY_COUNT);
    for (i, id) in frame_sample_ages(age_minutes).into_iter().enumerate() {
        let raw = decode_frame_record(frame, i * FRAME_RECORD_LEN)?;
        if i < FRAME_TREND_OFFSETS.len() {
            trend.extend(calibrate(calibration, sensor_start, id, ReadingKind::Trend, raw));
        } else {
            history.extend(calibrate(calibration, sensor_start, id, ReadingKind::History, raw));
        }
    }

    sort_ascending(&mut trend);
    sort_ascending(&mut history);

    Ok(ParsedFrame {
        age_minutes,
        sensor_start,
        batch: ReadingBatch { trend, history },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AGE_OFFSET, HISTORY_INDEX_OFFSET, STATE_OFFSET, TREND_INDEX_OFFSET};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn valid(raw_glucose: u16) -> RawReading {
        RawReading {
            raw_glucose,
            raw_temperature: 7856,
            temperature_adjustment: -8,
            error: GlucoseError::NONE,
        }
    }

    #[test]
    fn test_image_record_literal() {
        // glucose 0x0123, quality 0, error 0, temperature field 0x7AC, adjustment +3
        let mut buffer = [0u8; 6];
        encode_image_record(
            &mut buffer,
            0,
            &RawReading {
                raw_glucose: 0x0123,
                raw_temperature: 0x7AC << 2,
                temperature_adjustment: 12,
                error: GlucoseError::NONE,
            },
        )
        .unwrap();
        // bits 26..38 hold 0x7AC, bits 38..47 hold 3
        assert_eq!(buffer, [0x23, 0x01, 0x00, 0xB0, 0xDE, 0x00]);

        let decoded = decode_image_record(&buffer, 0).unwrap();
        assert_eq!(decoded.raw_glucose, 0x0123);
        assert_eq!(decoded.raw_temperature, 0x7AC << 2);
        assert_eq!(decoded.temperature_adjustment, 12);
        assert!(decoded.error.is_empty());
    }

    #[test]
    fn test_zero_glucose_reads_error_from_temperature() {
        let mut buffer = [0u8; 6];
        encode_image_record(
            &mut buffer,
            0,
            &RawReading {
                raw_glucose: 0,
                raw_temperature: 0x0A50 << 2,
                temperature_adjustment: 0,
                error: GlucoseError::NONE,
            },
        )
        .unwrap();
        let decoded = decode_image_record(&buffer, 0).unwrap();
        assert_eq!(decoded.error.bits(), 0xA5);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_negative_adjustment() {
        let mut buffer = [0u8; 4];
        encode_frame_record(&mut buffer, 0, &valid(900)).unwrap();
        let decoded = decode_frame_record(&buffer, 0).unwrap();
        assert_eq!(decoded.temperature_adjustment, -8);
        assert_eq!(decoded.raw_glucose, 900);
        assert_eq!(decoded.raw_temperature, 7856);
    }

    fn image_with(age: u16, trend_index: u8, history_index: u8) -> MemoryImage {
        let mut image = MemoryImage::zeroed();
        let bytes = image.as_bytes_mut();
        bytes[STATE_OFFSET] = 3;
        bytes[TREND_INDEX_OFFSET] = trend_index;
        bytes[HISTORY_INDEX_OFFSET] = history_index;
        bytes[AGE_OFFSET..AGE_OFFSET + 2].copy_from_slice(&age.to_le_bytes());
        image
    }

    #[test]
    fn test_trend_walks_backward_from_head() {
        let mut image = image_with(1000, 3, 0);
        // head index 3: slot 2 is the most recent, slot 1 one minute older, ...
        for i in 0..TREND_SLOTS {
            let slot = (3 + TREND_SLOTS - 1 - i) % TREND_SLOTS;
            let offset = MemoryImage::trend_record_offset(slot);
            encode_image_record(image.as_bytes_mut(), offset, &valid(1000 + i as u16)).unwrap();
        }

        let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
        let trend = &parsed.batch.trend;
        assert_eq!(trend.len(), 16);

        let newest = trend.last().unwrap();
        assert_eq!(newest.mg_dl, 1000.0);
        assert_eq!(newest.age_minutes, Some(1000));
        assert_eq!(newest.timestamp, start() + Duration::minutes(1000));

        let oldest = trend.first().unwrap();
        assert_eq!(oldest.mg_dl, 1015.0);
        assert_eq!(oldest.age_minutes, Some(985));
        assert!(trend.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_history_alignment() {
        // age 1000: delay = (997 mod 15) + 3 = 10, newest history sample at 990
        let mut image = image_with(1000, 0, 5);
        for i in 0..HISTORY_SLOTS {
            let slot = (5 + HISTORY_SLOTS - 1 - i) % HISTORY_SLOTS;
            let offset = MemoryImage::history_record_offset(slot);
            encode_image_record(image.as_bytes_mut(), offset, &valid(2000 + i as u16)).unwrap();
        }

        let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
        let history = &parsed.batch.history;
        assert_eq!(history.len(), 32);
        assert_eq!(history.last().unwrap().age_minutes, Some(990));
        assert_eq!(history.last().unwrap().mg_dl, 2000.0);
        assert_eq!(history.first().unwrap().age_minutes, Some(990 - 15 * 31));
        assert!(history
            .windows(2)
            .all(|w| (w[1].timestamp - w[0].timestamp) == Duration::minutes(15)));
    }

    #[test]
    fn test_young_sensor_skips_negative_ages() {
        let mut image = image_with(20, 0, 0);
        for slot in 0..HISTORY_SLOTS {
            encode_image_record(image.as_bytes_mut(), MemoryImage::history_record_offset(slot), &valid(500))
                .unwrap();
        }
        for slot in 0..TREND_SLOTS {
            encode_image_record(image.as_bytes_mut(), MemoryImage::trend_record_offset(slot), &valid(500))
                .unwrap();
        }

        let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
        // age 20: delay = 17 mod 15 + 3 = 5, newest history at 15, then 0
        let ages: Vec<_> = parsed.batch.history.iter().filter_map(|r| r.age_minutes).collect();
        assert_eq!(ages, vec![0, 15]);
        assert_eq!(parsed.batch.trend.len(), 16);
        assert_eq!(parsed.lifecycle, SensorLifecycle::Starting);
    }

    #[test]
    fn test_no_history_before_first_sample() {
        for age in 0..3 {
            let mut image = image_with(age, 0, 0);
            for slot in 0..HISTORY_SLOTS {
                let offset = MemoryImage::history_record_offset(slot);
                encode_image_record(image.as_bytes_mut(), offset, &valid(500)).unwrap();
            }
            let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
            assert!(parsed.batch.history.is_empty(), "age {age}");
        }

        // the first sample appears at minute 3, dated minute 0
        let mut image = image_with(3, 0, 0);
        let newest = MemoryImage::history_record_offset(HISTORY_SLOTS - 1);
        encode_image_record(image.as_bytes_mut(), newest, &valid(500)).unwrap();
        let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
        assert_eq!(parsed.batch.history.len(), 1);
        assert_eq!(parsed.batch.history[0].age_minutes, Some(0));
    }

    #[test]
    fn test_flagged_records_dropped() {
        let mut image = image_with(500, 0, 0);
        for slot in 0..TREND_SLOTS {
            let mut reading = valid(700);
            if slot % 4 == 0 {
                reading.error = GlucoseError::from_quality(0x10, false);
            } else if slot % 4 == 1 {
                reading.error = GlucoseError::HARDWARE;
            }
            encode_image_record(image.as_bytes_mut(), MemoryImage::trend_record_offset(slot), &reading).unwrap();
        }

        let parsed = parse_memory_image(&Calibration::identity(), start(), &image).unwrap();
        assert_eq!(parsed.batch.trend.len(), 8);
        assert!(parsed
            .batch
            .trend
            .iter()
            .all(|r| r.raw.map_or(false, |raw| raw.error.is_empty())));
        // history records are all zero and therefore absent
        assert!(parsed.batch.history.is_empty());
    }

    #[test]
    fn test_frame_sample_ages() {
        let ages = frame_sample_ages(1000);
        assert_eq!(&ages[..7], &[1000, 998, 996, 994, 993, 988, 985]);
        // ((1000 - 2) / 15) * 15 = 990
        assert_eq!(&ages[7..], &[990, 975, 960]);

        // too young for any history sample
        for age in 0..2 {
            assert!(frame_sample_ages(age)[7..].iter().all(|&a| a < 0), "age {age}");
        }
        assert_eq!(&frame_sample_ages(2)[7..], &[0, -15, -30]);
    }

    #[test]
    fn test_parse_frame() {
        let mut frame = [0u8; STREAM_FRAME_LEN];
        for i in 0..10 {
            encode_frame_record(&mut frame, i * FRAME_RECORD_LEN, &valid(100 + i as u16)).unwrap();
        }
        frame[FRAME_AGE_OFFSET..FRAME_AGE_OFFSET + 2].copy_from_slice(&1000u16.to_le_bytes());

        let received_at = start() + Duration::minutes(1000);
        let parsed = parse_frame(&Calibration::identity(), received_at, &frame).unwrap();
        assert_eq!(parsed.age_minutes, 1000);
        assert_eq!(parsed.sensor_start, start());
        assert_eq!(parsed.batch.trend.len(), 7);
        assert_eq!(parsed.batch.history.len(), 3);

        let latest = parsed.batch.latest().unwrap();
        assert_eq!(latest.timestamp, received_at);
        assert_eq!(latest.mg_dl, 100.0);
        assert_eq!(parsed.batch.history.last().unwrap().mg_dl, 107.0);
        assert!(parsed.batch.trend.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
