//! Dew heater threshold control loop.
//!
//! Runs on its own period, independent of the capture cadence. Each tick:
//!
//! 1. On a night/day transition, resets the heater to its default level
//!    (or off by day unless `enable_day` is set).
//! 2. Refreshes every sensor into the shared slots. A failed read skips only
//!    that sensor.
//! 3. With threshold control enabled, maps `surface temp - dew point` to a
//!    level through descending bands. Boundaries select the hotter band.

use std::time::Duration;
use tokio::time::MissedTickBehavior;

use crate::config::DewHeaterConfig;
use crate::devices::{DewHeater, Devices, TemperatureSensor};
use crate::error::AppResult;
use crate::shutdown::ShutdownToken;
use crate::state::{slot, ActuatorState, SharedControlState};

/// Heater level for a temperature differential.
///
/// `diff <= high → level_high`, `<= med → level_med`, `<= low → level_low`,
/// otherwise `level_default`.
pub fn select_level(config: &DewHeaterConfig, diff: f64) -> f64 {
    if diff <= config.thold_diff_high {
        config.level_high
    } else if diff <= config.thold_diff_med {
        config.level_med
    } else if diff <= config.thold_diff_low {
        config.level_low
    } else {
        config.level_default
    }
}

/// Periodic dew heater controller.
pub struct ActuatorController {
    config: DewHeaterConfig,
    state: SharedControlState,
    heater: Box<dyn DewHeater>,
    sensors: Vec<Box<dyn TemperatureSensor>>,
    actuator: ActuatorState,
    last_night: Option<bool>,
}

impl ActuatorController {
    /// Controller over the given devices.
    pub fn new(config: DewHeaterConfig, state: SharedControlState, devices: Devices) -> Self {
        let actuator = ActuatorState {
            heater_level: devices.heater.level(),
            last_level: devices.heater.level(),
        };
        Self {
            config,
            state,
            heater: devices.heater,
            sensors: devices.sensors,
            actuator,
            last_night: None,
        }
    }

    /// Current heater state.
    pub fn actuator_state(&self) -> ActuatorState {
        self.actuator
    }

    /// Tick every `period_s` until shutdown.
    pub async fn run(mut self, shutdown: ShutdownToken) -> AppResult<()> {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.period_s));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(period_s = self.config.period_s, "Dew heater loop started");

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick()?,
                _ = shutdown.cancelled() => break,
            }
        }

        tracing::info!("Dew heater loop stopped");
        Ok(())
    }

    /// One control step.
    pub fn tick(&mut self) -> AppResult<()> {
        let night = self.state.night();
        if self.last_night != Some(night) {
            self.on_mode_change(night)?;
            self.last_night = Some(night);
        }

        self.update_sensors();

        if self.config.threshold_enable && (night || self.config.enable_day) {
            self.apply_threshold()?;
        }
        Ok(())
    }

    fn on_mode_change(&mut self, night: bool) -> AppResult<()> {
        let heater_off = self.actuator.heater_level <= 0.0;
        if night {
            tracing::info!("Night mode, enabling dew heater");
            if heater_off {
                self.set_dew_heater(self.config.level_default)?;
            }
        } else if self.config.enable_day {
            tracing::info!("Day mode, dew heater stays enabled");
            if heater_off {
                self.set_dew_heater(self.config.level_default)?;
            }
        } else {
            tracing::info!("Day mode, disabling dew heater");
            self.set_dew_heater(0.0)?;
        }
        Ok(())
    }

    fn update_sensors(&mut self) {
        for sensor in &mut self.sensors {
            let reading = match sensor.update() {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(sensor = sensor.name(), "Sensor read failed: {}", e);
                    continue;
                }
            };

            let base = sensor.slot();
            self.state.update(|v| {
                if let Some(dew) = reading.dew_point {
                    v.sensor_slots[slot::DEW_POINT] = dew;
                }
                if let Some(frost) = reading.frost_point {
                    v.sensor_slots[slot::FROST_POINT] = frost;
                }
                for (i, value) in reading.data.iter().enumerate() {
                    if let Some(s) = v.sensor_slots.get_mut(base + i) {
                        *s = *value;
                    }
                }
            });
        }
    }

    fn apply_threshold(&mut self) -> AppResult<()> {
        let target = if self.config.manual_target != 0.0 {
            self.config.manual_target
        } else {
            self.state.sensor(slot::DEW_POINT)
        };
        if target == 0.0 {
            tracing::warn!("Dew heater target temperature is 0, is a dew point sensor configured?");
        }

        let current = self.state.sensor(self.config.temp_user_slot);
        let diff = current - target;
        let level = select_level(&self.config, diff);

        tracing::debug!(current, target, diff, level, "Dew heater threshold check");
        self.set_dew_heater(level)
    }

    fn set_dew_heater(&mut self, level: f64) -> AppResult<()> {
        if (self.actuator.heater_level - level).abs() < f64::EPSILON {
            return Ok(());
        }

        self.heater.set_level(level)?;
        self.actuator.apply(level);
        self.state.set_sensor(slot::HEATER_LEVEL, level);
        tracing::info!(level, previous = self.actuator.last_level, "Dew heater level changed");
        Ok(())
    }
}
