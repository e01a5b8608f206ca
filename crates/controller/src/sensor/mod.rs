//! Sensor driver seam.  The aggregator only ever talks to a
//! [`SensorDriver`]; the simulator and the Raspberry Pi drivers live in
//! feature-gated submodules.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{SensorDriverKind, SensorSettings};

#[cfg(feature = "hardware")]
pub mod hw;
#[cfg(feature = "sim")]
pub mod sim;
#[cfg(any(test, feature = "hardware"))]
pub mod sysfs;

/// Reported in place of a quantity whose driver failed.  Below absolute zero
/// and outside every percent scale, so no real sensor can produce it.
pub const SENSOR_FAULT: f64 = -255.0;

/// True for the fault sentinel (and anything non-finite that slipped through).
pub fn is_fault(value: f64) -> bool {
    !value.is_finite() || value <= SENSOR_FAULT
}

// ---------------------------------------------------------------------------
// Kinds + errors
// ---------------------------------------------------------------------------

/// Physical quantities the controller samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// Air temperature, °C.
    AirTemperature,
    /// Relative humidity, %.
    Humidity,
    /// Barometric pressure, hPa.
    Pressure,
    /// Soil temperature, °C.
    SoilTemperature,
    /// Uncalibrated soil moisture ADC count.
    SoilMoistureRaw,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AirTemperature => "air_temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::SoilTemperature => "soil_temperature",
            Self::SoilMoistureRaw => "soil_moisture_raw",
        };
        f.write_str(s)
    }
}

/// One failed physical read.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("bus error: {0}")]
    Bus(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unparseable sensor value {0:?}")]
    Parse(String),
    #[error("{0} sensor not available")]
    Unavailable(SensorKind),
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// Collaborator interface for the physical sensors.  Every read has its own
/// bounded latency and fails independently of the others.
pub trait SensorDriver: Send {
    fn read(&mut self, kind: SensorKind) -> Result<f64, SensorError>;

    /// Digital rain input.  A failed read reports "not raining".
    fn read_rain(&mut self) -> bool;
}

// ---------------------------------------------------------------------------
// Moisture calibration
// ---------------------------------------------------------------------------

/// Raw ADC endpoints of the soil moisture probe: the count it reports in dry
/// air and fully submerged in water.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoistureCalibration {
    pub air_value: f64,
    pub water_value: f64,
}

impl MoistureCalibration {
    /// Linear map of a raw count to 0..=100 %.  `air_value` maps to 0,
    /// `water_value` to 100; counts beyond either endpoint clamp rather than
    /// extrapolate.  Works for probes whose count falls as well as rises
    /// with moisture.
    pub fn percent(&self, raw: f64) -> f64 {
        let range = self.water_value - self.air_value;
        if range == 0.0 {
            return 0.0; // degenerate calibration, rejected by config validation
        }
        ((raw - self.air_value) * 100.0 / range).clamp(0.0, 100.0)
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build the driver selected in the config.
pub fn open(settings: &SensorSettings) -> Result<Box<dyn SensorDriver>> {
    match settings.driver {
        #[cfg(feature = "sim")]
        SensorDriverKind::Sim => {
            let scenario = std::env::var("SIM_SCENARIO").unwrap_or_default();
            let driver = sim::SimDriver::new(
                sim::Scenario::from_str_lossy(&scenario),
                settings.calibration(),
            );
            tracing::info!(scenario = %driver.scenario(), "simulated sensors ready");
            Ok(Box::new(driver))
        }
        #[cfg(not(feature = "sim"))]
        SensorDriverKind::Sim => {
            anyhow::bail!("sensors.driver = \"sim\" but built without the `sim` feature")
        }

        #[cfg(feature = "hardware")]
        SensorDriverKind::Hardware => Ok(Box::new(hw::HardwareDriver::open(settings)?)),
        #[cfg(not(feature = "hardware"))]
        SensorDriverKind::Hardware => {
            anyhow::bail!("sensors.driver = \"hardware\" but built without the `hardware` feature")
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
