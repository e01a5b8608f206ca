//! Sensor aggregation: read every quantity `sample_count` times and reduce
//! each to its mean.
//!
//! A failed read never aborts the poll.  It is logged, counted, and left
//! out of that quantity's mean; a quantity with no successful read at all
//! reports [`SENSOR_FAULT`].

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::sensor::{is_fault, MoistureCalibration, SensorDriver, SensorKind, SENSOR_FAULT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AggregateError {
    #[error("sample_count must be at least 1")]
    ZeroSampleCount,
}

/// One instantaneous reading of every quantity.  Failed reads hold
/// [`SENSOR_FAULT`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub air_temperature_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    pub soil_temperature_c: f64,
    /// Calibrated to 0..=100 %.
    pub soil_moisture_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregatedReading {
    pub air_temperature_c: f64,
    pub humidity_pct: f64,
    pub pressure_hpa: f64,
    pub soil_temperature_c: f64,
    /// Mean moisture over the poll, for reporting.
    pub soil_moisture_pct: f64,
    /// Most recent successful moisture read of the poll.  Threshold checks
    /// use this, not the mean.
    pub latest_soil_moisture_pct: f64,
    /// Rain input as read at the end of the poll.
    pub rain: bool,
    pub samples: u32,
    /// Failed reads across all quantities.
    pub faults: u32,
}

impl AggregatedReading {
    /// Moisture to feed the rain gate, or `None` when the probe faulted for
    /// the whole poll.
    pub fn decision_moisture(&self) -> Option<f64> {
        (!is_fault(self.latest_soil_moisture_pct)).then_some(self.latest_soil_moisture_pct)
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Read one value, substituting the sentinel on failure.
fn read_or_fault(driver: &mut dyn SensorDriver, kind: SensorKind, faults: &mut u32) -> f64 {
    match driver.read(kind) {
        Ok(v) if v.is_finite() => v,
        Ok(v) => {
            warn!(sensor = %kind, value = v, "sensor returned a non-finite value");
            *faults += 1;
            SENSOR_FAULT
        }
        Err(e) => {
            warn!(sensor = %kind, "sensor read failed: {e}");
            *faults += 1;
            SENSOR_FAULT
        }
    }
}

/// Read every continuous quantity once.  Returns the sample and the number
/// of reads that failed.
pub fn read_sample(
    driver: &mut dyn SensorDriver,
    calibration: &MoistureCalibration,
) -> (SensorSample, u32) {
    let mut faults = 0;
    let air_temperature_c = read_or_fault(driver, SensorKind::AirTemperature, &mut faults);
    let humidity_pct = read_or_fault(driver, SensorKind::Humidity, &mut faults);
    let pressure_hpa = read_or_fault(driver, SensorKind::Pressure, &mut faults);
    let soil_temperature_c = read_or_fault(driver, SensorKind::SoilTemperature, &mut faults);
    let raw = read_or_fault(driver, SensorKind::SoilMoistureRaw, &mut faults);
    let soil_moisture_pct = if is_fault(raw) {
        SENSOR_FAULT
    } else {
        calibration.percent(raw)
    };

    let sample = SensorSample {
        air_temperature_c,
        humidity_pct,
        pressure_hpa,
        soil_temperature_c,
        soil_moisture_pct,
    };
    (sample, faults)
}

/// Running sum over the successful reads of one quantity.
#[derive(Default)]
struct Mean {
    sum: f64,
    n: u32,
}

impl Mean {
    fn push(&mut self, v: f64) {
        if !is_fault(v) {
            self.sum += v;
            self.n += 1;
        }
    }

    fn get(&self) -> f64 {
        if self.n == 0 {
            SENSOR_FAULT
        } else {
            self.sum / f64::from(self.n)
        }
    }
}

/// Take `sample_count` samples and average them.  Blocking: every read goes
/// straight to the driver.
pub fn aggregate(
    driver: &mut dyn SensorDriver,
    sample_count: u32,
    calibration: &MoistureCalibration,
) -> Result<AggregatedReading, AggregateError> {
    if sample_count == 0 {
        return Err(AggregateError::ZeroSampleCount);
    }

    let mut air = Mean::default();
    let mut humidity = Mean::default();
    let mut pressure = Mean::default();
    let mut soil_temp = Mean::default();
    let mut moisture = Mean::default();
    let mut latest_moisture = SENSOR_FAULT;
    let mut faults = 0;

    for _ in 0..sample_count {
        let (s, f) = read_sample(driver, calibration);
        faults += f;
        air.push(s.air_temperature_c);
        humidity.push(s.humidity_pct);
        pressure.push(s.pressure_hpa);
        soil_temp.push(s.soil_temperature_c);
        moisture.push(s.soil_moisture_pct);
        if !is_fault(s.soil_moisture_pct) {
            latest_moisture = s.soil_moisture_pct;
        }
    }

    Ok(AggregatedReading {
        air_temperature_c: air.get(),
        humidity_pct: humidity.get(),
        pressure_hpa: pressure.get(),
        soil_temperature_c: soil_temp.get(),
        soil_moisture_pct: moisture.get(),
        latest_soil_moisture_pct: latest_moisture,
        rain: driver.read_rain(),
        samples: sample_count,
        faults,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
