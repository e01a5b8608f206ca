//! Linux sysfs sensors: the BME280 through the IIO subsystem and the
//! DS18B20 through the 1-Wire bus.  Both are plain file reads, so the
//! kernel drivers do the bus work.

use std::fs;
use std::path::{Path, PathBuf};

use super::SensorError;

fn read_file(path: &Path) -> Result<String, SensorError> {
    fs::read_to_string(path).map_err(|source| SensorError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn parse_number(s: &str) -> Result<f64, SensorError> {
    let trimmed = s.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| SensorError::Parse(trimmed.to_string()))
}

// ---------------------------------------------------------------------------
// BME280 (IIO)
// ---------------------------------------------------------------------------

/// A BME280 bound to the kernel `bmp280` driver, e.g.
/// `/sys/bus/iio/devices/iio:device0`.
pub struct Bme280Iio {
    dir: PathBuf,
}

impl Bme280Iio {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn attr(&self, name: &str) -> Result<f64, SensorError> {
        parse_number(&read_file(&self.dir.join(name))?)
    }

    /// Kernel reports milli-degrees Celsius.
    pub fn temperature_c(&self) -> Result<f64, SensorError> {
        Ok(self.attr("in_temp_input")? / 1000.0)
    }

    /// Kernel reports milli-percent.
    pub fn humidity_pct(&self) -> Result<f64, SensorError> {
        Ok(self.attr("in_humidityrelative_input")? / 1000.0)
    }

    /// Kernel reports kilopascal.
    pub fn pressure_hpa(&self) -> Result<f64, SensorError> {
        Ok(self.attr("in_pressure_input")? * 10.0)
    }
}

// ---------------------------------------------------------------------------
// DS18B20 (1-Wire)
// ---------------------------------------------------------------------------

/// DS18B20 family code prefix in `/sys/bus/w1/devices`.
const DS18B20_FAMILY: &str = "28-";

/// Register value after power-on, before the first conversion.
const DS18B20_POWER_ON_MILLI: i64 = 85_000;

pub struct Ds18b20 {
    slave: PathBuf,
}

impl Ds18b20 {
    /// First DS18B20 found under `w1_devices`.
    pub fn find(w1_devices: &Path) -> Result<Self, SensorError> {
        let entries = fs::read_dir(w1_devices).map_err(|source| SensorError::Io {
            path: w1_devices.display().to_string(),
            source,
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(DS18B20_FAMILY))
            .collect();
        names.sort();
        let name = names
            .into_iter()
            .next()
            .ok_or_else(|| SensorError::Bus(format!("no DS18B20 under {}", w1_devices.display())))?;
        Ok(Self {
            slave: w1_devices.join(name).join("w1_slave"),
        })
    }

    pub fn temperature_c(&self) -> Result<f64, SensorError> {
        parse_w1_slave(&read_file(&self.slave)?)
    }
}

/// Parse the two-line `w1_slave` dump:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(contents: &str) -> Result<f64, SensorError> {
    let mut lines = contents.lines();
    let crc_line = lines.next().unwrap_or_default();
    if !crc_line.trim_end().ends_with("YES") {
        return Err(SensorError::Bus(format!("DS18B20 CRC check failed: {crc_line:?}")));
    }
    let data_line = lines.next().unwrap_or_default();
    let milli: i64 = data_line
        .split("t=")
        .nth(1)
        .and_then(|t| t.trim().parse().ok())
        .ok_or_else(|| SensorError::Parse(data_line.to_string()))?;
    if milli == DS18B20_POWER_ON_MILLI {
        return Err(SensorError::Bus("DS18B20 returned its power-on value".to_string()));
    }
    Ok(milli as f64 / 1000.0)
}

// ===========================================================================
// Tests
// ===========================================================================
