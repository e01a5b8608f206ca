//! TOML config file loading, validation, and seeding of the persistent
//! schedule and rain settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::db::Db;
use crate::decision::{CascadeMode, WateringPolicy};
use crate::rain::RainState;
use crate::schedule::{ZoneSchedule, ZONE_COUNT};
use crate::sensor::MoistureCalibration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub sensors: SensorSettings,
    #[serde(default)]
    pub relays: RelaySettings,
    #[serde(default)]
    pub watering: WateringSettings,
    /// Seeds the stored schedule when present.  Omit it to keep whatever
    /// schedule was last stored (e.g. set remotely over MQTT).
    #[serde(default)]
    pub schedule: Option<ZoneSchedule>,
}

fn default_device_id() -> String {
    "irrigation-1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            controller: ControllerSettings::default(),
            sensors: SensorSettings::default(),
            relays: RelaySettings::default(),
            watering: WateringSettings::default(),
            schedule: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub samples_to_average: u32,
    pub poll_interval_sec: u64,
    pub relay_interval_sec: u64,
    pub clock_sync_interval_sec: u64,
    /// Hours east of UTC.
    pub timezone_offset_hours: f64,
    /// `host:port` of an SNTP server; empty disables clock sync.
    pub ntp_server: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            samples_to_average: 5,
            poll_interval_sec: 300,
            relay_interval_sec: 1,
            clock_sync_interval_sec: 3600,
            timezone_offset_hours: 0.0,
            ntp_server: "pool.ntp.org:123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorDriverKind {
    Sim,
    Hardware,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub driver: SensorDriverKind,
    /// Raw moisture count with the probe in dry air.
    pub moisture_air_value: f64,
    /// Raw moisture count with the probe submerged in water.
    pub moisture_water_value: f64,
    /// BCM pin of the rain sensor's digital output.
    pub rain_gpio_pin: u8,
    pub rain_active_low: bool,
    pub ads1115_addr: u16,
    pub moisture_channel: u8,
    /// BME280 under the Linux IIO subsystem.
    pub iio_device: String,
    /// 1-Wire sysfs directory holding the DS18B20 (`28-*`).
    pub w1_devices: String,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            driver: SensorDriverKind::Sim,
            moisture_air_value: 26000.0,
            moisture_water_value: 12000.0,
            rain_gpio_pin: 13,
            rain_active_low: false,
            ads1115_addr: 0x48,
            moisture_channel: 0,
            iio_device: "/sys/bus/iio/devices/iio:device0".to_string(),
            w1_devices: "/sys/bus/w1/devices".to_string(),
        }
    }
}

impl SensorSettings {
    pub fn calibration(&self) -> MoistureCalibration {
        MoistureCalibration {
            air_value: self.moisture_air_value,
            water_value: self.moisture_water_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayDriverKind {
    /// One BCM GPIO pin per zone.
    Gpio,
    /// MCP23008 I2C IO expander; `pins` are expander pin indices.
    Mcp23008,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub driver: RelayDriverKind,
    /// Zone 1 first.
    pub pins: Vec<u8>,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub mcp23008_addr: u16,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            driver: RelayDriverKind::Mcp23008,
            pins: vec![0, 1, 2, 3],
            active_low: false,
            mcp23008_addr: 0x20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WateringSettings {
    /// Days after the last rain during which watering stays off.
    pub lookback_days: u32,
    pub moisture_threshold_percent: f64,
    pub cascade: CascadeMode,
}

impl Default for WateringSettings {
    fn default() -> Self {
        Self {
            lookback_days: 3,
            moisture_threshold_percent: 30.0,
            cascade: CascadeMode::Chained,
        }
    }
}

impl Config {
    pub fn policy(&self) -> WateringPolicy {
        WateringPolicy {
            moisture_threshold_pct: self.watering.moisture_threshold_percent,
            timezone_offset_hours: self.controller.timezone_offset_hours,
            cascade: self.watering.cascade,
        }
    }
}

// ---------------------------------------------------------------------------
// Hardware limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: f64 = 32767.0;

/// MCP23008 has eight GPIO lines, GP0..GP7.
const MCP23008_PINS: std::ops::RangeInclusive<u8> = 0..=7;

/// 7-bit I2C addresses the MCP23008 can be strapped to.
const MCP23008_ADDRS: std::ops::RangeInclusive<u16> = 0x20..=0x27;

/// 7-bit I2C addresses the ADS1115 can be strapped to.
const ADS1115_ADDRS: std::ops::RangeInclusive<u16> = 0x48..=0x4B;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device_id.trim().is_empty() {
            errors.push("device_id is empty".to_string());
        } else if self.device_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device_id '{}' must not contain MQTT topic characters (/ + #)",
                self.device_id
            ));
        }

        self.validate_controller(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_relays(&mut errors);
        self.validate_watering(&mut errors);

        if let Some(schedule) = &self.schedule {
            for e in schedule.validate() {
                errors.push(format!("schedule: {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;

        if c.samples_to_average == 0 {
            errors.push("controller: samples_to_average must be at least 1".to_string());
        }

        // ── Timer periods (all must be positive) ────────────
        for (name, value) in [
            ("poll_interval_sec", c.poll_interval_sec),
            ("relay_interval_sec", c.relay_interval_sec),
            ("clock_sync_interval_sec", c.clock_sync_interval_sec),
        ] {
            if value == 0 {
                errors.push(format!("controller: {name} must be positive"));
            }
        }

        if !c.timezone_offset_hours.is_finite()
            || !(-12.0..=14.0).contains(&c.timezone_offset_hours)
        {
            errors.push(format!(
                "controller: timezone_offset_hours {} out of range [-12, 14]",
                c.timezone_offset_hours
            ));
        }

        if !c.ntp_server.is_empty() && !c.ntp_server.contains(':') {
            errors.push(format!(
                "controller: ntp_server '{}' must be host:port",
                c.ntp_server
            ));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;

        // ── Moisture calibration ────────────────────────────
        for (name, value) in [
            ("moisture_air_value", s.moisture_air_value),
            ("moisture_water_value", s.moisture_water_value),
        ] {
            if !value.is_finite() || !(0.0..=ADS1115_MAX).contains(&value) {
                errors.push(format!(
                    "sensors: {name} {value} out of ADS1115 range [0, {ADS1115_MAX}]"
                ));
            }
        }
        if s.moisture_air_value == s.moisture_water_value {
            errors.push(format!(
                "sensors: moisture_air_value and moisture_water_value are both {}, calibration range is zero",
                s.moisture_air_value
            ));
        }

        // ── Hardware wiring ─────────────────────────────────
        if !VALID_GPIO_PINS.contains(&s.rain_gpio_pin) {
            errors.push(format!(
                "sensors: rain_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                s.rain_gpio_pin
            ));
        }
        if !ADS1115_ADDRS.contains(&s.ads1115_addr) {
            errors.push(format!(
                "sensors: ads1115_addr {:#04x} is not an ADS1115 address (0x48-0x4b)",
                s.ads1115_addr
            ));
        }
        if s.moisture_channel > 3 {
            errors.push(format!(
                "sensors: moisture_channel {} out of range [0, 3]",
                s.moisture_channel
            ));
        }
    }

    fn validate_relays(&self, errors: &mut Vec<String>) {
        let r = &self.relays;

        if r.pins.len() != ZONE_COUNT {
            errors.push(format!(
                "relays: expected {ZONE_COUNT} pins (one per zone), got {}",
                r.pins.len()
            ));
        }

        let (valid, label) = match r.driver {
            RelayDriverKind::Gpio => (VALID_GPIO_PINS, "BCM GPIO pin (allowed: 2-27)"),
            RelayDriverKind::Mcp23008 => (MCP23008_PINS, "MCP23008 pin (allowed: 0-7)"),
        };
        let mut seen: HashSet<u8> = HashSet::new();
        for (i, pin) in r.pins.iter().enumerate() {
            if !valid.contains(pin) {
                errors.push(format!("relays: zone {} pin {pin} is not a valid {label}", i + 1));
            } else if !seen.insert(*pin) {
                errors.push(format!(
                    "relays: zone {} pin {pin} is already used by another zone",
                    i + 1
                ));
            }
        }

        if r.driver == RelayDriverKind::Gpio
            && self.sensors.driver == SensorDriverKind::Hardware
            && r.pins.contains(&self.sensors.rain_gpio_pin)
        {
            errors.push(format!(
                "relays: pin {} is also the rain sensor input",
                self.sensors.rain_gpio_pin
            ));
        }

        if r.driver == RelayDriverKind::Mcp23008 && !MCP23008_ADDRS.contains(&r.mcp23008_addr) {
            errors.push(format!(
                "relays: mcp23008_addr {:#04x} is not an MCP23008 address (0x20-0x27)",
                r.mcp23008_addr
            ));
        }
    }

    fn validate_watering(&self, errors: &mut Vec<String>) {
        let w = &self.watering;

        if w.lookback_days > 365 {
            errors.push(format!(
                "watering: lookback_days {} out of range [0, 365]",
                w.lookback_days
            ));
        }
        if !w.moisture_threshold_percent.is_finite()
            || !(0.0..=100.0).contains(&w.moisture_threshold_percent)
        {
            errors.push(format!(
                "watering: moisture_threshold_percent {} out of range [0, 100]",
                w.moisture_threshold_percent
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.  A `[schedule]` table that
/// does not parse is logged and dropped, so the stored schedule stays in
/// force; any other problem is an error.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut table: toml::Table =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;

    let schedule = table.remove("schedule");
    let mut config: Config = toml::Value::Table(table)
        .try_into()
        .with_context(|| format!("failed to parse config: {path}"))?;
    config.schedule = schedule.and_then(|value| match value.try_into::<ZoneSchedule>() {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!(path, "ignoring [schedule] from config: {e}");
            None
        }
    });

    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Like `load`, but never fails: any error is logged and the built-in
/// defaults are used.
pub fn load_or_default(path: &str) -> Config {
    match load(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            tracing::error!(path, "running with built-in defaults");
            Config::default()
        }
    }
}

/// Seed the store from the config file: the schedule (when the file has
/// one) and the rain lookback.  The last rain timestamp is never touched.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    if let Some(schedule) = &config.schedule {
        db.persist_records(&schedule.to_records())
            .await
            .context("failed to store schedule from config")?;
    }

    let lookback = RainState::new(config.watering.lookback_days).to_records();
    db.persist_records(&lookback)
        .await
        .context("failed to store rain lookback from config")?;

    tracing::info!(
        device_id = %config.device_id,
        schedule_from_file = config.schedule.is_some(),
        lookback_days = config.watering.lookback_days,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
