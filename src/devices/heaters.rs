//! Dew heater actuators.

use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};

/// Power-level contract for dew heaters. Levels are percent (0-100).
pub trait DewHeater: Send {
    /// Display name
    fn name(&self) -> &str;

    /// Apply a level.
    fn set_level(&mut self, level: f64) -> AppResult<()>;

    /// Last applied level
    fn level(&self) -> f64;
}

/// Heater that only remembers its level.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHeater {
    level: f64,
    writes: usize,
}

impl SimulatedHeater {
    /// Heater at level 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `set_level` calls received.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl DewHeater for SimulatedHeater {
    fn name(&self) -> &str {
        "simulator"
    }

    fn set_level(&mut self, level: f64) -> AppResult<()> {
        self.level = level;
        self.writes += 1;
        Ok(())
    }

    fn level(&self) -> f64 {
        self.level
    }
}

/// Hardware PWM channel exposed through sysfs
/// (e.g. `/sys/class/pwm/pwmchip0/pwm0`).
#[derive(Debug, Clone)]
pub struct PwmSysfsHeater {
    channel: PathBuf,
    period_ns: u64,
    level: f64,
    configured: bool,
}

impl PwmSysfsHeater {
    /// Heater on an exported PWM channel.
    ///
    /// # Errors
    ///
    /// `DaqError::Actuator` if the channel directory does not exist.
    pub fn new(channel: impl AsRef<Path>, period_ns: u64) -> AppResult<Self> {
        let channel = channel.as_ref().to_path_buf();
        if !channel.is_dir() {
            return Err(DaqError::Actuator(format!(
                "PWM channel {} not found (is it exported?)",
                channel.display()
            )));
        }
        if period_ns == 0 {
            return Err(DaqError::Actuator("PWM period must be > 0".into()));
        }
        Ok(Self {
            channel,
            period_ns,
            level: 0.0,
            configured: false,
        })
    }

    fn write(&self, attr: &str, value: impl ToString) -> AppResult<()> {
        let path = self.channel.join(attr);
        std::fs::write(&path, value.to_string())
            .map_err(|e| DaqError::Actuator(format!("{}: {e}", path.display())))
    }

    /// Duty cycle in nanoseconds for a percent level.
    pub fn duty_cycle_ns(&self, level: f64) -> u64 {
        (self.period_ns as f64 * level.clamp(0.0, 100.0) / 100.0).round() as u64
    }
}

impl DewHeater for PwmSysfsHeater {
    fn name(&self) -> &str {
        "pwm_sysfs"
    }

    fn set_level(&mut self, level: f64) -> AppResult<()> {
        if !self.configured {
            self.write("period", self.period_ns)?;
            self.write("enable", 1)?;
            self.configured = true;
        }
        self.write("duty_cycle", self.duty_cycle_ns(level))?;
        self.level = level;
        Ok(())
    }

    fn level(&self) -> f64 {
        self.level
    }
}
