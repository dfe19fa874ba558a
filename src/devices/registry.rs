use std::collections::HashMap;
use std::path::PathBuf;

use super::heaters::{DewHeater, PwmSysfsHeater, SimulatedHeater};
use super::sensors::{SimulatedSensor, TemperatureSensor, ThermalZoneSensor};
use crate::config::{DewHeaterConfig, SkyConfig, TempSensorDefinition};
use crate::error::{AppResult, DaqError};

type SensorFactory =
    Box<dyn Fn(&TempSensorDefinition) -> AppResult<Box<dyn TemperatureSensor>> + Send + Sync>;
type HeaterFactory = Box<dyn Fn(&DewHeaterConfig) -> AppResult<Box<dyn DewHeater>> + Send + Sync>;

/// Slots used by the stand-in sensors when none are configured.
pub const DEFAULT_SENSOR_SLOTS: [usize; 2] = [10, 15];

/// Devices built from configuration.
pub struct Devices {
    /// Dew heater
    pub heater: Box<dyn DewHeater>,
    /// Temperature sensors
    pub sensors: Vec<Box<dyn TemperatureSensor>>,
}

/// Maps configuration class keys to device constructors.
pub struct DeviceRegistry {
    sensors: HashMap<String, SensorFactory>,
    heaters: HashMap<String, HeaterFactory>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    /// Registry with the built-in devices.
    pub fn new() -> Self {
        let mut sensors: HashMap<String, SensorFactory> = HashMap::new();
        let mut heaters: HashMap<String, HeaterFactory> = HashMap::new();

        sensors.insert(
            "simulator".to_string(),
            Box::new(|def| {
                let name = def.label.clone().unwrap_or_else(|| "simulator".to_string());
                Ok(Box::new(SimulatedSensor::inert(name, def.slot)) as Box<dyn TemperatureSensor>)
            }),
        );

        sensors.insert(
            "thermal_zone".to_string(),
            Box::new(|def| {
                let path = def
                    .path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(ThermalZoneSensor::DEFAULT_PATH));
                let name = def
                    .label
                    .clone()
                    .unwrap_or_else(|| "thermal_zone".to_string());
                Ok(Box::new(ThermalZoneSensor::new(name, def.slot, path))
                    as Box<dyn TemperatureSensor>)
            }),
        );

        heaters.insert(
            "simulator".to_string(),
            Box::new(|_| Ok(Box::new(SimulatedHeater::new()) as Box<dyn DewHeater>)),
        );

        heaters.insert(
            "pwm_sysfs".to_string(),
            Box::new(|config| {
                let path = config.pwm_path.as_ref().ok_or_else(|| {
                    DaqError::Configuration("dew_heater.pwm_path is required for pwm_sysfs".into())
                })?;
                let heater = PwmSysfsHeater::new(path, config.pwm_period_ns)?;
                Ok(Box::new(heater) as Box<dyn DewHeater>)
            }),
        );

        Self { sensors, heaters }
    }

    /// Add or replace a sensor constructor.
    pub fn register_sensor<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&TempSensorDefinition) -> AppResult<Box<dyn TemperatureSensor>>
            + Send
            + Sync
            + 'static,
    {
        self.sensors.insert(key.to_string(), Box::new(factory));
    }

    /// Add or replace a heater constructor.
    pub fn register_heater<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&DewHeaterConfig) -> AppResult<Box<dyn DewHeater>> + Send + Sync + 'static,
    {
        self.heaters.insert(key.to_string(), Box::new(factory));
    }

    /// Build one sensor.
    pub fn create_sensor(&self, def: &TempSensorDefinition) -> AppResult<Box<dyn TemperatureSensor>> {
        self.sensors
            .get(&def.class)
            .ok_or_else(|| DaqError::UnknownDevice {
                kind: "sensor",
                key: def.class.clone(),
            })
            .and_then(|factory| factory(def))
    }

    /// Build the heater.
    pub fn create_heater(&self, config: &DewHeaterConfig) -> AppResult<Box<dyn DewHeater>> {
        self.heaters
            .get(&config.class)
            .ok_or_else(|| DaqError::UnknownDevice {
                kind: "heater",
                key: config.class.clone(),
            })
            .and_then(|factory| factory(config))
    }

    /// Build every configured device, failing on the first unknown key.
    ///
    /// With no sensors configured, inert simulators are placed on
    /// [`DEFAULT_SENSOR_SLOTS`].
    pub fn build(&self, config: &SkyConfig) -> AppResult<Devices> {
        let heater = self.create_heater(&config.dew_heater)?;

        let definitions: Vec<TempSensorDefinition> = if config.temp_sensors.is_empty() {
            DEFAULT_SENSOR_SLOTS
                .iter()
                .map(|&slot| TempSensorDefinition {
                    class: "simulator".to_string(),
                    slot,
                    label: None,
                    path: None,
                })
                .collect()
        } else {
            config.temp_sensors.clone()
        };

        let sensors = definitions
            .iter()
            .map(|def| self.create_sensor(def))
            .collect::<AppResult<Vec<_>>>()?;

        tracing::info!(
            heater = heater.name(),
            sensors = sensors.len(),
            "Devices initialised"
        );
        Ok(Devices { heater, sensors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::SensorReading;

    #[test]
    fn test_defaults_use_simulators() {
        let devices = DeviceRegistry::new().build(&SkyConfig::default()).unwrap();
        assert_eq!(devices.heater.name(), "simulator");
        let slots: Vec<_> = devices.sensors.iter().map(|s| s.slot()).collect();
        assert_eq!(slots, vec![10, 15]);
    }

    #[test]
    fn test_unknown_sensor_class_fails_eagerly() {
        let mut config = SkyConfig::default();
        config.temp_sensors = vec![TempSensorDefinition {
            class: "dht22".to_string(),
            slot: 10,
            label: None,
            path: None,
        }];

        let err = DeviceRegistry::new().build(&config).err().unwrap();
        assert!(matches!(err, DaqError::UnknownDevice { kind: "sensor", .. }));
    }

    #[test]
    fn test_unknown_heater_class_fails_eagerly() {
        let mut config = SkyConfig::default();
        config.dew_heater.class = "relay".to_string();

        let err = DeviceRegistry::new().build(&config).err().unwrap();
        assert_eq!(err.to_string(), "Unknown heater class 'relay'");
    }

    #[test]
    fn test_pwm_heater_requires_path() {
        let mut config = SkyConfig::default();
        config.dew_heater.class = "pwm_sysfs".to_string();

        assert!(DeviceRegistry::new().build(&config).is_err());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = DeviceRegistry::new();
        registry.register_heater("relay", |_| {
            Ok(Box::new(SimulatedHeater::new()) as Box<dyn DewHeater>)
        });

        let mut config = SkyConfig::default();
        config.dew_heater.class = "relay".to_string();
        assert!(registry.build(&config).is_ok());
    }

    #[test]
    fn test_custom_sensor_registration() {
        let mut registry = DeviceRegistry::new();
        registry.register_sensor("dht22", |def| {
            let reading = SensorReading {
                dew_point: Some(1.5),
                frost_point: None,
                data: vec![6.0, 80.0],
            };
            Ok(Box::new(SimulatedSensor::fixed("dht22", def.slot, reading))
                as Box<dyn TemperatureSensor>)
        });

        let mut config = SkyConfig::default();
        config.temp_sensors = vec![TempSensorDefinition {
            class: "dht22".to_string(),
            slot: 12,
            label: None,
            path: None,
        }];

        let mut devices = registry.build(&config).unwrap();
        assert_eq!(devices.sensors.len(), 1);
        assert_eq!(devices.sensors[0].name(), "dht22");
        assert_eq!(devices.sensors[0].slot(), 12);
        assert_eq!(devices.sensors[0].update().unwrap().data, vec![6.0, 80.0]);
    }
}
