//! Stateful environment simulator for running the controller without
//! hardware.
//!
//! Models plausible sensor behaviour:
//! - Temporal coherence via random walk with mean reversion
//! - Diurnal (day/night) swing on temperatures and humidity
//! - Rain spells that start and stop at random and wet the soil
//! - Gradual soil drying between spells
//! - Occasional failed reads (sensor flakiness)

use std::fmt;

use time::OffsetDateTime;

use super::{MoistureCalibration, SensorDriver, SensorError, SensorKind};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Warm, rarely raining, soil drifts dry.  Schedules should run.
    Drying,
    /// Low noise, no rain, soil stays mid-range.
    Stable,
    /// ~10% of reads fail.  Exercises the fault sentinel path.
    Flaky,
    /// Frequent long rain spells.  Watering should stay suppressed.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// One simulated quantity
// ---------------------------------------------------------------------------

/// Random walk pulled back toward `center`, plus a sinusoidal diurnal term.
struct Walk {
    value: f64,
    center: f64,
    sigma: f64,
    reversion: f64,
    diurnal: f64,
    lo: f64,
    hi: f64,
}

impl Walk {
    fn new(center: f64, sigma: f64, diurnal: f64, lo: f64, hi: f64) -> Self {
        Self {
            value: center,
            center,
            sigma,
            reversion: 0.05,
            diurnal,
            lo,
            hi,
        }
    }

    fn step(&mut self, bias: f64, phase: f64) -> f64 {
        let pull = self.reversion * (self.center - self.value);
        self.value = (self.value + pull + bias + gaussian(0.0, self.sigma)).clamp(self.lo, self.hi);
        (self.value + self.diurnal * phase.sin()).clamp(self.lo, self.hi)
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct SimDriver {
    scenario: Scenario,
    air_temperature: Walk,
    humidity: Walk,
    pressure: Walk,
    soil_temperature: Walk,
    moisture_raw: Walk,

    raining: bool,
    rain_start_prob: f32,
    rain_stop_prob: f32,
    fault_prob: f32,

    /// Raw counts per read toward `air_value` (drying) or `water_value`.
    dry_rate: f64,
    wet_rate: f64,
}

impl SimDriver {
    pub fn new(scenario: Scenario, calibration: MoistureCalibration) -> Self {
        let (rain_start, rain_stop, fault, noise, start_frac) = match scenario {
            // start_frac: 0.0 = at air_value (dry), 1.0 = at water_value
            Scenario::Drying => (0.002_f32, 0.05_f32, 0.005_f32, 1.0, 0.5),
            Scenario::Stable => (0.0, 1.0, 0.0, 0.3, 0.5),
            Scenario::Flaky => (0.01, 0.05, 0.10, 2.0, 0.5),
            Scenario::Wet => (0.05, 0.01, 0.005, 1.0, 0.8),
        };

        let span = calibration.water_value - calibration.air_value;
        let (raw_lo, raw_hi) = if span >= 0.0 {
            (calibration.air_value, calibration.water_value)
        } else {
            (calibration.water_value, calibration.air_value)
        };
        let mut moisture_raw = Walk::new(
            calibration.air_value + start_frac * span,
            span.abs() * 0.005 * noise,
            0.0,
            raw_lo,
            raw_hi,
        );
        // Soil moisture has no natural set-point; let drift dominate.
        moisture_raw.reversion = 0.0;

        Self {
            scenario,
            air_temperature: Walk::new(22.0, 0.2 * noise, 6.0, -20.0, 50.0),
            humidity: Walk::new(55.0, 0.5 * noise, -15.0, 5.0, 100.0),
            pressure: Walk::new(1013.0, 0.3 * noise, 0.0, 950.0, 1050.0),
            soil_temperature: Walk::new(18.0, 0.05 * noise, 2.0, -5.0, 40.0),
            moisture_raw,
            raining: false,
            rain_start_prob: rain_start,
            rain_stop_prob: rain_stop,
            fault_prob: fault,
            dry_rate: span * -0.001,
            wet_rate: span * 0.02,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    /// Diurnal phase in radians, peaking mid-afternoon UTC.
    fn phase() -> f64 {
        let secs = OffsetDateTime::now_utc().unix_timestamp().rem_euclid(86_400) as f64;
        2.0 * std::f64::consts::PI * (secs - 9.0 * 3600.0) / 86_400.0
    }
}

impl SensorDriver for SimDriver {
    fn read(&mut self, kind: SensorKind) -> Result<f64, SensorError> {
        if self.fault_prob > 0.0 && fastrand::f32() < self.fault_prob {
            return Err(SensorError::Bus(format!("simulated {kind} read failure")));
        }

        let phase = Self::phase();
        let value = match kind {
            SensorKind::AirTemperature => self.air_temperature.step(0.0, phase),
            SensorKind::Humidity => {
                let bias = if self.raining { 1.0 } else { 0.0 };
                self.humidity.step(bias, phase)
            }
            SensorKind::Pressure => {
                let bias = if self.raining { -0.2 } else { 0.0 };
                self.pressure.step(bias, phase)
            }
            SensorKind::SoilTemperature => self.soil_temperature.step(0.0, phase),
            SensorKind::SoilMoistureRaw => {
                let bias = if self.raining { self.wet_rate } else { self.dry_rate };
                self.moisture_raw.step(bias, 0.0).round()
            }
        };
        Ok(value)
    }

    fn read_rain(&mut self) -> bool {
        let flip = if self.raining {
            self.rain_stop_prob
        } else {
            self.rain_start_prob
        };
        if flip > 0.0 && fastrand::f32() < flip {
            self.raining = !self.raining;
        }
        self.raining
    }
}

// ===========================================================================
// Tests
// ===========================================================================
