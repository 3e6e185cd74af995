//! Battery power draw and temperature.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Pack voltage assumed when the platform does not report one.
pub const DEFAULT_VOLTAGE_MV: i64 = 3700;

/// One reading of the platform battery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    /// Signed current; negative while discharging on most devices.
    pub current_ua: i64,
    pub voltage_mv: i64,
    /// Tenths of a degree Celsius.
    pub temperature_decicelsius: i32,
}

impl BatteryStatus {
    /// Instantaneous power, sign dropped.
    pub fn watts(&self) -> f64 {
        let amps = self.current_ua as f64 / 1_000_000.0;
        let volts = self.voltage_mv as f64 / 1000.0;
        (amps * volts).abs()
    }

    pub fn temperature_c(&self) -> f32 {
        self.temperature_decicelsius as f32 / 10.0
    }
}

/// Platform query for battery status.
pub trait BatterySource: Send {
    fn read(&self) -> Result<BatteryStatus>;
}

/// Reads a Linux power-supply directory (`current_now`, `voltage_now`, `temp`).
#[derive(Debug, Clone)]
pub struct SysfsBattery {
    dir: PathBuf,
}

impl SysfsBattery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_value(&self, name: &str) -> Result<i64> {
        let path = self.dir.join(name);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        raw.trim()
            .parse()
            .with_context(|| format!("Invalid value in {}", path.display()))
    }
}

impl BatterySource for SysfsBattery {
    fn read(&self) -> Result<BatteryStatus> {
        let current_ua = self.read_value("current_now")?;
        // voltage_now is exported in µV.
        let voltage_mv = self
            .read_value("voltage_now")
            .ok()
            .map(|uv| uv / 1000)
            .filter(|mv| *mv > 0)
            .unwrap_or(DEFAULT_VOLTAGE_MV);
        let temperature_decicelsius = self
            .read_value("temp")
            .ok()
            .and_then(|t| i32::try_from(t).ok())
            .unwrap_or(0);

        Ok(BatteryStatus {
            current_ua,
            voltage_mv,
            temperature_decicelsius,
        })
    }
}
