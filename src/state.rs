//! Process-wide control state shared by every worker.
//!
//! All scalars live behind one `parking_lot::Mutex`. The lock guards plain
//! values only; callers copy what they need out of the closure and do any I/O
//! after the guard is dropped.
//!
//! Ownership of field groups:
//! - `exposure` is written only by the auto-exposure controller.
//! - `night`, `moon_mode`, `gain` and `binning` are written by the capture scheduler.
//! - Sensor slots are written by the actuator loop.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::camera::profile::CameraProfile;
use crate::config::SkyConfig;

/// Number of shared sensor slots.
pub const SENSOR_SLOT_COUNT: usize = 30;

/// Slots below this index are owned by the actuator loop itself.
pub const RESERVED_SLOTS: usize = 4;

/// Fixed slot assignments.
pub mod slot {
    /// Camera sensor temperature
    pub const SENSOR_TEMP: usize = 0;
    /// Current dew heater level (percent)
    pub const HEATER_LEVEL: usize = 1;
    /// Computed dew point
    pub const DEW_POINT: usize = 2;
    /// Computed frost point
    pub const FROST_POINT: usize = 3;
    /// First slot for user-configured sensors
    pub const USER_START: usize = 10;
}

/// Snapshot of the shared scalars.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ControlValues {
    /// Exposure used for the next capture, seconds
    pub exposure: f64,
    /// Night minimum exposure
    pub exposure_min: f64,
    /// Day minimum exposure
    pub exposure_min_day: f64,
    /// Maximum exposure
    pub exposure_max: f64,
    /// Sensor gain
    pub gain: i64,
    /// Binning factor
    pub binning: u32,
    /// Night mode
    pub night: bool,
    /// Moon-mode sub-state of night mode
    pub moon_mode: bool,
    /// Sensor readings, see [`slot`]
    pub sensor_slots: [f64; SENSOR_SLOT_COUNT],
}

impl Default for ControlValues {
    fn default() -> Self {
        Self {
            exposure: 0.001,
            exposure_min: 0.001,
            exposure_min_day: 0.001,
            exposure_max: 15.0,
            gain: 1,
            binning: 1,
            night: true,
            moon_mode: false,
            sensor_slots: [0.0; SENSOR_SLOT_COUNT],
        }
    }
}

impl ControlValues {
    /// Exposure bounds for the active mode.
    pub fn exposure_bounds(&self) -> (f64, f64) {
        let min = if self.night {
            self.exposure_min
        } else {
            self.exposure_min_day
        };
        (min, self.exposure_max)
    }
}

/// Cloneable handle to the shared control state.
#[derive(Debug, Clone, Default)]
pub struct SharedControlState {
    inner: Arc<Mutex<ControlValues>>,
}

impl SharedControlState {
    /// Wrap an initial set of values.
    pub fn new(values: ControlValues) -> Self {
        Self {
            inner: Arc::new(Mutex::new(values)),
        }
    }

    /// Build the initial state from configuration and the selected camera profile.
    pub fn from_config(config: &SkyConfig, profile: &CameraProfile) -> Self {
        let limits = config.exposure.resolve(profile);
        let night = config.camera.night;
        Self::new(ControlValues {
            exposure: limits.default,
            exposure_min: limits.min_night,
            exposure_min_day: limits.min_day,
            exposure_max: limits.max,
            gain: profile.clamp_gain(night.gain),
            binning: night.binning,
            night: true,
            moon_mode: false,
            sensor_slots: [0.0; SENSOR_SLOT_COUNT],
        })
    }

    /// Copy of every field.
    pub fn snapshot(&self) -> ControlValues {
        *self.inner.lock()
    }

    /// Mutate under the lock. Keep the closure free of I/O.
    pub fn update<R>(&self, f: impl FnOnce(&mut ControlValues) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Current exposure in seconds.
    pub fn exposure(&self) -> f64 {
        self.inner.lock().exposure
    }

    /// Set the next exposure.
    pub fn set_exposure(&self, exposure: f64) {
        self.inner.lock().exposure = exposure;
    }

    /// Night flag.
    pub fn night(&self) -> bool {
        self.inner.lock().night
    }

    /// Read one sensor slot. Out-of-range slots read as 0.
    pub fn sensor(&self, index: usize) -> f64 {
        self.inner
            .lock()
            .sensor_slots
            .get(index)
            .copied()
            .unwrap_or(0.0)
    }

    /// Write one sensor slot. Returns false if the slot is out of range.
    pub fn set_sensor(&self, index: usize, value: f64) -> bool {
        match self.inner.lock().sensor_slots.get_mut(index) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }
}

/// Heater state owned by the actuator loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ActuatorState {
    /// Level currently applied (percent)
    pub heater_level: f64,
    /// Level applied before the most recent change
    pub last_level: f64,
}

impl ActuatorState {
    /// Record a new level. Returns false when the level is unchanged.
    pub fn apply(&mut self, level: f64) -> bool {
        if (self.heater_level - level).abs() < f64::EPSILON {
            return false;
        }
        self.last_level = self.heater_level;
        self.heater_level = level;
        true
    }
}
