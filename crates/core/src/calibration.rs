//! Conversion of raw sensor counts into mg/dL.
//!
//! Factory calibration comes from six coefficients stored in the memory image.
//! The sensor temperature is recovered from the thermistor count with the
//! Steinhart-Hart equation, and the glucose count is scaled linearly between
//! the `i3`/`i4` anchors, then compensated for the distance from the nominal
//! 32.5 °C skin temperature.
//!
//! An optional [`CustomCalibration`] (user finger-stick pairs) is fitted to a
//! straight line and applied on top of the factory value.

use crate::bitio::BitField;
use crate::error::Result;
use crate::memory::{MemoryImage, CALIBRATION_OFFSET};
use crate::reading::RawReading;
use serde::{Deserialize, Serialize};

/// Nominal sensor temperature the factory slope refers to.
pub const NOMINAL_TEMPERATURE_C: f64 = 32.5;

const KELVIN: f64 = 273.15;

/// Steinhart-Hart coefficients of the sensor thermistor.
const STEINHART_HART: [f64; 4] = [0.000_918_002_3, 0.000_196_456_1, 0.000_000_706_177_5, 0.000_000_052_835_66];

/// Thermistor bridge constants.
const BRIDGE_SCALE: f64 = 72_500.0;
const BRIDGE_OFFSET: f64 = 1_000.0;

/// mg/dL span between the `i3` and `i4` anchors.
const ANCHOR_SPAN_MG_DL: f64 = 65.0;

/// Per-degree temperature compensation factor.
const TEMPERATURE_FACTOR: f64 = 1.045;

const I1: BitField = BitField::new(2, 0, 3);
const I2: BitField = BitField::new(2, 3, 10);
const I3: BitField = BitField::new(CALIBRATION_OFFSET, 0, 8);
const I3_SIGN: BitField = BitField::new(CALIBRATION_OFFSET, 0x21, 1);
const I4: BitField = BitField::new(CALIBRATION_OFFSET, 8, 14);
const I5: BitField = BitField::new(CALIBRATION_OFFSET, 0x28, 12);
const I6: BitField = BitField::new(CALIBRATION_OFFSET, 0x34, 12);

/// Factory coefficients read from the memory image.
///
/// `i5` and `i6` are stored already shifted left by two, like the raw
/// temperature counts they are combined with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactoryCalibration {
    pub i1: u16,
    pub i2: u16,
    pub i3: i32,
    pub i4: u16,
    pub i5: u16,
    pub i6: u16,
}

impl FactoryCalibration {
    pub fn from_image(image: &MemoryImage) -> Result<Self> {
        let bytes = image.as_bytes();
        Ok(Self {
            i1: I1.read(bytes)?,
            i2: I2.read(bytes)?,
            i3: I3.read_signed(I3_SIGN, bytes)?,
            i4: I4.read(bytes)?,
            i5: I5.read(bytes)? << 2,
            i6: I6.read(bytes)? << 2,
        })
    }

    /// Store the coefficients into an image.
    pub fn write_to(&self, image: &mut MemoryImage) -> Result<()> {
        let bytes = image.as_bytes_mut();
        I1.write(bytes, self.i1)?;
        I2.write(bytes, self.i2)?;
        I3.write_signed(I3_SIGN, bytes, self.i3)?;
        I4.write(bytes, self.i4)?;
        I5.write(bytes, self.i5 >> 2)?;
        I6.write(bytes, self.i6 >> 2)?;
        Ok(())
    }

    /// Sensor temperature for a reading's thermistor counts.
    ///
    /// Falls back to the nominal temperature when the counts describe no
    /// physical resistance.
    pub fn temperature_celsius(&self, raw_temperature: u16, adjustment: i32) -> f64 {
        let divisor = f64::from(adjustment + i32::from(self.i6));
        if divisor <= 0.0 {
            return NOMINAL_TEMPERATURE_C;
        }

        let resistance = f64::from(raw_temperature) * BRIDGE_SCALE / divisor - BRIDGE_OFFSET;
        if resistance <= 0.0 {
            return NOMINAL_TEMPERATURE_C;
        }

        let l = resistance.ln();
        let [a, b, c, d] = STEINHART_HART;
        let inverse = d * l.powi(3) + c * l.powi(2) + b * l + a;
        if inverse == 0.0 || !inverse.is_finite() {
            return NOMINAL_TEMPERATURE_C;
        }
        1.0 / inverse - KELVIN
    }

    /// Factory-calibrated glucose in mg/dL.
    pub fn glucose_mg_dl(&self, reading: &RawReading) -> f64 {
        let span = f64::from(self.i4) - f64::from(self.i3);
        if span == 0.0 {
            return f64::from(reading.raw_glucose);
        }

        let linear = ANCHOR_SPAN_MG_DL * (f64::from(reading.raw_glucose) - f64::from(self.i3)) / span;
        let temperature = self.temperature_celsius(reading.raw_temperature, reading.temperature_adjustment);
        linear * TEMPERATURE_FACTOR.powf(NOMINAL_TEMPERATURE_C - temperature)
    }

    /// Raw glucose count that calibrates to `mg_dl` at the given thermistor counts.
    pub fn raw_glucose_for(&self, mg_dl: f64, raw_temperature: u16, adjustment: i32) -> u16 {
        let temperature = self.temperature_celsius(raw_temperature, adjustment);
        let linear = mg_dl / TEMPERATURE_FACTOR.powf(NOMINAL_TEMPERATURE_C - temperature);
        let span = f64::from(self.i4) - f64::from(self.i3);
        let raw = f64::from(self.i3) + linear * span / ANCHOR_SPAN_MG_DL;
        raw.round().clamp(0.0, 16_383.0) as u16
    }
}

/// One user calibration entry: the value the system showed and the reference value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    pub measured: f64,
    pub reference: f64,
}

/// Straight-line correction `reference = slope * measured + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub const IDENTITY: Self = Self {
        slope: 1.0,
        intercept: 0.0,
    };

    pub fn apply(&self, value: f64) -> f64 {
        self.slope * value + self.intercept
    }
}

/// Ordered user calibration points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomCalibration {
    points: Vec<CalibrationPoint>,
}

impl CustomCalibration {
    pub fn new(points: Vec<CalibrationPoint>) -> Self {
        Self { points }
    }

    pub fn push(&mut self, point: CalibrationPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Least-squares line through the points.
    ///
    /// One point, or points that all share the same measured value, give a pure
    /// offset. No points give `None`.
    pub fn fit(&self) -> Option<LinearFit> {
        let n = self.points.len();
        if n == 0 {
            return None;
        }

        let count = n as f64;
        let mean_x = self.points.iter().map(|p| p.measured).sum::<f64>() / count;
        let mean_y = self.points.iter().map(|p| p.reference).sum::<f64>() / count;

        let sxx: f64 = self.points.iter().map(|p| (p.measured - mean_x).powi(2)).sum();
        let sxy: f64 = self
            .points
            .iter()
            .map(|p| (p.measured - mean_x) * (p.reference - mean_y))
            .sum();

        if n == 1 || sxx.abs() < f64::EPSILON {
            return Some(LinearFit {
                slope: 1.0,
                intercept: mean_y - mean_x,
            });
        }

        let slope = sxy / sxx;
        Some(LinearFit {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }
}

/// Everything needed to turn a [`RawReading`] into mg/dL.
///
/// Immutable once built: adding a user point produces a new value through
/// [`Calibration::with_custom`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Calibration {
    pub factory: Option<FactoryCalibration>,
    pub custom: Option<LinearFit>,
}

impl Calibration {
    /// No calibration: raw counts are passed through.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn factory(factory: FactoryCalibration) -> Self {
        Self {
            factory: Some(factory),
            custom: None,
        }
    }

    pub fn with_custom(self, custom: &CustomCalibration) -> Self {
        Self {
            custom: custom.fit(),
            ..self
        }
    }

    pub fn glucose_mg_dl(&self, reading: &RawReading) -> f64 {
        let base = match &self.factory {
            Some(factory) => factory.glucose_mg_dl(reading),
            None => f64::from(reading.raw_glucose),
        };
        self.custom.map_or(base, |fit| fit.apply(base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::GlucoseError;

    fn factory() -> FactoryCalibration {
        FactoryCalibration {
            i1: 1,
            i2: 700,
            i3: 0,
            i4: 2000,
            i5: 9000,
            i6: 8000,
        }
    }

    fn reading(raw_glucose: u16, raw_temperature: u16) -> RawReading {
        RawReading {
            raw_glucose,
            raw_temperature,
            temperature_adjustment: 0,
            error: GlucoseError::NONE,
        }
    }

    #[test]
    fn test_image_fields_round_trip() {
        let mut image = MemoryImage::zeroed();
        let calibration = FactoryCalibration { i3: -17, ..factory() };
        calibration.write_to(&mut image).unwrap();
        assert_eq!(FactoryCalibration::from_image(&image).unwrap(), calibration);
    }

    #[test]
    fn test_temperature_near_nominal() {
        let t = factory().temperature_celsius(7856, 0);
        assert!((t - 32.5).abs() < 0.05, "{t}");

        // warmer thermistor, lower resistance
        assert!(factory().temperature_celsius(7600, 0) > t);
    }

    #[test]
    fn test_degenerate_temperature_falls_back() {
        assert_eq!(factory().temperature_celsius(0, 0), NOMINAL_TEMPERATURE_C);
        assert_eq!(factory().temperature_celsius(7856, -8000), NOMINAL_TEMPERATURE_C);
    }

    #[test]
    fn test_factory_value_at_nominal_temperature() {
        // 3077 counts over a 2000-count span at about 32.5 °C is roughly 100 mg/dL
        let value = factory().glucose_mg_dl(&reading(3077, 7856));
        assert!((value - 100.0).abs() < 0.5, "{value}");
    }

    #[test]
    fn test_inverse_matches_forward() {
        let f = factory();
        for target in [40.0, 95.5, 180.0, 350.0] {
            let raw = f.raw_glucose_for(target, 7700, 12);
            let value = f.glucose_mg_dl(&RawReading {
                temperature_adjustment: 12,
                ..reading(raw, 7700)
            });
            assert!((value - target).abs() < 0.1, "{target} -> {value}");
        }
    }

    #[test]
    fn test_identity_passes_raw_through() {
        assert_eq!(Calibration::identity().glucose_mg_dl(&reading(1234, 0)), 1234.0);
    }

    #[test]
    fn test_single_point_is_offset() {
        let custom = CustomCalibration::new(vec![CalibrationPoint {
            measured: 100.0,
            reference: 110.0,
        }]);
        let fit = custom.fit().unwrap();
        assert_eq!(fit.slope, 1.0);
        assert!((fit.apply(150.0) - 160.0).abs() < 1e-9);
    }

    #[test]
    fn test_least_squares_fit() {
        let custom = CustomCalibration::new(vec![
            CalibrationPoint { measured: 100.0, reference: 120.0 },
            CalibrationPoint { measured: 200.0, reference: 220.0 },
            CalibrationPoint { measured: 300.0, reference: 320.0 },
        ]);
        let fit = custom.fit().unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-9);
        assert!((fit.intercept - 20.0).abs() < 1e-9);

        let same_x = CustomCalibration::new(vec![
            CalibrationPoint { measured: 100.0, reference: 90.0 },
            CalibrationPoint { measured: 100.0, reference: 110.0 },
        ]);
        assert_eq!(same_x.fit().unwrap().intercept, 0.0);
        assert!(CustomCalibration::default().fit().is_none());
    }

    #[test]
    fn test_adding_points_does_not_change_earlier_values() {
        let raw = reading(3077, 7856);
        let mut custom = CustomCalibration::new(vec![CalibrationPoint {
            measured: 100.0,
            reference: 105.0,
        }]);

        let before = Calibration::factory(factory()).with_custom(&custom);
        let first = before.glucose_mg_dl(&raw);

        custom.push(CalibrationPoint {
            measured: 200.0,
            reference: 230.0,
        });
        let after = before.with_custom(&custom);

        assert_eq!(before.glucose_mg_dl(&raw), first);
        assert_ne!(after.glucose_mg_dl(&raw), first);
    }
}
