//! Raspberry Pi sensor drivers.
//!
//! - Soil moisture: capacitive probe on an ADS1115 16-bit ADC over I2C,
//!   single-ended, PGA ±4.096 V, 128 SPS, single-shot mode.  This matches
//!   the default calibration (`moisture_air_value ≈ 26000`,
//!   `moisture_water_value ≈ 12000`) for probes powered from 3.3 V.
//! - Air temperature / humidity / pressure: BME280 via IIO sysfs.
//! - Soil temperature: DS18B20 via 1-Wire sysfs.
//! - Rain: digital output of a rain board on a GPIO input.

use std::path::PathBuf;
use std::{thread, time::Duration};

use anyhow::Result;
use rppal::gpio::{Gpio, InputPin};
use rppal::i2c::I2c;
use tracing::{info, warn};

use super::sysfs::{Bme280Iio, Ds18b20};
use super::{SensorDriver, SensorError, SensorKind};
use crate::config::SensorSettings;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS        write 1 to start single-shot conversion
//   [14:12] MUX       input multiplexer (channel selection)
//   [11:9]  PGA       programmable gain amplifier
//   [8]     MODE      0 = continuous, 1 = single-shot
//   [7:5]   DR        data rate
//   [4]     COMP_MODE
//   [3]     COMP_POL
//   [2]     COMP_LAT
//   [1:0]   COMP_QUE  11 = disable comparator (default)

/// Bits common to all channel reads:
///   OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
///   DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[usize::from(channel & 0b11)] << MUX_SHIFT)
}

fn bus(e: rppal::i2c::Error) -> SensorError {
    SensorError::Bus(e.to_string())
}

// ── ADS1115 ─────────────────────────────────────────────────────────────────

struct Ads1115 {
    i2c: I2c,
}

impl Ads1115 {
    fn open(addr: u16) -> Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        Ok(Self { i2c })
    }

    /// Single-shot read, returning the raw count (0–32767 single-ended).
    fn read_channel(&mut self, channel: u8) -> Result<f64, SensorError> {
        let config = config_for_channel(channel);
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .map_err(bus)?;

        thread::sleep(CONVERSION_WAIT);

        let mut ready = false;
        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf).map_err(bus)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                ready = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        if !ready {
            return Err(SensorError::Bus("ADS1115 conversion did not complete".to_string()));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf).map_err(bus)?;
        // Single-ended reads are non-negative; clamp against bus corruption.
        Ok(f64::from(i16::from_be_bytes(buf).max(0)))
    }
}

// ── Driver ──────────────────────────────────────────────────────────────────

pub struct HardwareDriver {
    adc: Ads1115,
    moisture_channel: u8,
    bme: Bme280Iio,
    w1_devices: PathBuf,
    /// Found lazily so a probe plugged in after boot is picked up.
    soil_probe: Option<Ds18b20>,
    rain: InputPin,
    rain_active_low: bool,
}

impl HardwareDriver {
    pub fn open(settings: &SensorSettings) -> Result<Self> {
        let adc = Ads1115::open(settings.ads1115_addr)?;
        let rain = Gpio::new()?.get(settings.rain_gpio_pin)?.into_input();

        let w1_devices = PathBuf::from(&settings.w1_devices);
        let soil_probe = match Ds18b20::find(&w1_devices) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("soil temperature probe not found yet: {e}");
                None
            }
        };

        info!(
            ads1115_addr = format_args!("0x{:02x}", settings.ads1115_addr),
            moisture_channel = settings.moisture_channel,
            iio_device = %settings.iio_device,
            rain_gpio_pin = settings.rain_gpio_pin,
            "hardware sensors initialised"
        );

        Ok(Self {
            adc,
            moisture_channel: settings.moisture_channel,
            bme: Bme280Iio::new(&settings.iio_device),
            w1_devices,
            soil_probe,
            rain,
            rain_active_low: settings.rain_active_low,
        })
    }

    fn soil_temperature(&mut self) -> Result<f64, SensorError> {
        if self.soil_probe.is_none() {
            self.soil_probe = Some(Ds18b20::find(&self.w1_devices)?);
        }
        match &self.soil_probe {
            Some(p) => p.temperature_c(),
            None => Err(SensorError::Unavailable(SensorKind::SoilTemperature)),
        }
    }
}

impl SensorDriver for HardwareDriver {
    fn read(&mut self, kind: SensorKind) -> Result<f64, SensorError> {
        match kind {
            SensorKind::AirTemperature => self.bme.temperature_c(),
            SensorKind::Humidity => self.bme.humidity_pct(),
            SensorKind::Pressure => self.bme.pressure_hpa(),
            SensorKind::SoilTemperature => self.soil_temperature(),
            SensorKind::SoilMoistureRaw => self.adc.read_channel(self.moisture_channel),
        }
    }

    fn read_rain(&mut self) -> bool {
        self.rain.is_high() != self.rain_active_low
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS should start a conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA should be ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "MODE should be single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100, "DR should be 128 SPS");
        assert_eq!(CONFIG_BASE & 0b11, 0b11, "comparator should be off");
    }
}
