//! Zone relay outputs.  The `hardware` feature gates the real rppal
//! drivers (direct GPIO or an MCP23008 IO expander); without it, a mock
//! board records and logs state changes.

use anyhow::Result;
use tracing::{error, info};

#[cfg(feature = "hardware")]
use rppal::gpio::{Gpio, OutputPin};
#[cfg(feature = "hardware")]
use rppal::i2c::I2c;

use crate::config::RelaySettings;
use crate::schedule::ZONE_COUNT;

/// Collaborator interface for the zone relays.  Called once per zone per
/// decision cycle; a failed write must not stop writes to other zones.
pub trait RelayOutput: Send {
    fn set_relay(&mut self, zone: usize, on: bool) -> Result<()>;
}

/// Force every zone off.  Returns how many writes failed.
pub fn all_off(relays: &mut dyn RelayOutput) -> usize {
    let mut failed = 0;
    for zone in 0..ZONE_COUNT {
        if let Err(e) = relays.set_relay(zone, false) {
            error!(zone = zone + 1, "relay off failed: {e:#}");
            failed += 1;
        }
    }
    failed
}

/// Build the relay board selected in the config.
pub fn open(settings: &RelaySettings) -> Result<Box<dyn RelayOutput>> {
    #[cfg(feature = "hardware")]
    {
        use crate::config::RelayDriverKind;
        match settings.driver {
            RelayDriverKind::Gpio => Ok(Box::new(GpioBoard::new(
                &settings.pins,
                settings.active_low,
            )?)),
            RelayDriverKind::Mcp23008 => Ok(Box::new(Mcp23008Board::new(
                settings.mcp23008_addr,
                &settings.pins,
                settings.active_low,
            )?)),
        }
    }
    #[cfg(not(feature = "hardware"))]
    {
        info!(
            driver = ?settings.driver,
            pins = ?settings.pins,
            "[mock-relay] built without `hardware`, relays are not wired"
        );
        Ok(Box::new(MockBoard::new()))
    }
}

/// Pin level that means `on`.  Active-low boards energise on LOW.
#[cfg(any(test, feature = "hardware"))]
fn drive_high(on: bool, active_low: bool) -> bool {
    on != active_low
}

/// Output latch with one expander pin changed.
#[cfg(any(test, feature = "hardware"))]
fn latch_with(latch: u8, pin: u8, high: bool) -> u8 {
    if high {
        latch | (1 << pin)
    } else {
        latch & !(1 << pin)
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal on a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "hardware")]
pub struct GpioBoard {
    pins: Vec<OutputPin>, // zone index -> GPIO pin
    active_low: bool,
}

#[cfg(feature = "hardware")]
impl GpioBoard {
    pub fn new(pin_numbers: &[u8], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = Vec::with_capacity(pin_numbers.len());

        for pin_num in pin_numbers {
            let mut pin = gpio.get(*pin_num)?.into_output();
            // Fail-safe: ensure "OFF" at startup
            if drive_high(false, active_low) {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.push(pin);
        }

        info!(pins = ?pin_numbers, active_low, "gpio relay board initialised");
        Ok(Self { pins, active_low })
    }
}

#[cfg(feature = "hardware")]
impl RelayOutput for GpioBoard {
    fn set_relay(&mut self, zone: usize, on: bool) -> Result<()> {
        let pin = self
            .pins
            .get_mut(zone)
            .ok_or_else(|| anyhow::anyhow!("no relay pin for zone {}", zone + 1))?;
        if drive_high(on, self.active_low) {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MCP23008 IO expander relay board
// ---------------------------------------------------------------------------

#[cfg(feature = "hardware")]
const MCP23008_IODIR: u8 = 0x00;
#[cfg(feature = "hardware")]
const MCP23008_OLAT: u8 = 0x0A;

#[cfg(feature = "hardware")]
pub struct Mcp23008Board {
    i2c: I2c,
    pins: Vec<u8>,
    active_low: bool,
    /// Last latch value written successfully.
    latch: u8,
}

#[cfg(feature = "hardware")]
impl Mcp23008Board {
    pub fn new(addr: u16, pins: &[u8], active_low: bool) -> Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        // Latch OFF before switching the pins to outputs so relays never
        // glitch on.
        let latch = pins
            .iter()
            .fold(0u8, |l, p| latch_with(l, *p, drive_high(false, active_low)));
        i2c.smbus_write_byte(MCP23008_OLAT, latch)?;

        let iodir = pins.iter().fold(0xFFu8, |d, p| d & !(1 << p));
        i2c.smbus_write_byte(MCP23008_IODIR, iodir)?;

        info!(
            addr = format_args!("0x{addr:02x}"),
            pins = ?pins,
            active_low,
            "mcp23008 relay board initialised"
        );
        Ok(Self {
            i2c,
            pins: pins.to_vec(),
            active_low,
            latch,
        })
    }
}

#[cfg(feature = "hardware")]
impl RelayOutput for Mcp23008Board {
    fn set_relay(&mut self, zone: usize, on: bool) -> Result<()> {
        let pin = *self
            .pins
            .get(zone)
            .ok_or_else(|| anyhow::anyhow!("no expander pin for zone {}", zone + 1))?;
        let latch = latch_with(self.latch, pin, drive_high(on, self.active_low));
        if latch != self.latch {
            self.i2c.smbus_write_byte(MCP23008_OLAT, latch)?;
            self.latch = latch;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(any(test, not(feature = "hardware")))]
pub struct MockBoard {
    pub(crate) states: [bool; ZONE_COUNT],
}

#[cfg(any(test, not(feature = "hardware")))]
impl MockBoard {
    pub fn new() -> Self {
        info!("[mock-relay] relay board initialised (no hardware)");
        Self {
            states: [false; ZONE_COUNT],
        }
    }
}

#[cfg(any(test, not(feature = "hardware")))]
impl RelayOutput for MockBoard {
    fn set_relay(&mut self, zone: usize, on: bool) -> Result<()> {
        let state = self
            .states
            .get_mut(zone)
            .ok_or_else(|| anyhow::anyhow!("[mock-relay] unknown zone {}", zone + 1))?;
        if *state != on {
            info!(zone = zone + 1, "[mock-relay] set {}", if on { "ON" } else { "OFF" });
        }
        *state = on;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
