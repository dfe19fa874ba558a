//! Temperature sensors feeding the shared sensor slots.

use std::path::{Path, PathBuf};

use crate::error::{AppResult, DaqError};

/// One sensor update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorReading {
    /// Dew point, if the sensor measures humidity
    pub dew_point: Option<f64>,
    /// Frost point, if the sensor measures humidity
    pub frost_point: Option<f64>,
    /// Values written to consecutive slots starting at the sensor's slot
    pub data: Vec<f64>,
}

/// Read/update contract for temperature sensors.
pub trait TemperatureSensor: Send {
    /// Display name
    fn name(&self) -> &str;

    /// First shared slot this sensor writes
    fn slot(&self) -> usize;

    /// Take a fresh reading.
    ///
    /// # Errors
    ///
    /// `DaqError::SensorRead` when the device cannot be read.
    fn update(&mut self) -> AppResult<SensorReading>;
}

/// Sensor that always reports the same reading.
///
/// Stands in for unconfigured sensors so the control loop always runs.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    name: String,
    slot: usize,
    reading: SensorReading,
}

impl SimulatedSensor {
    /// Sensor with no data.
    pub fn inert(name: impl Into<String>, slot: usize) -> Self {
        Self::fixed(name, slot, SensorReading::default())
    }

    /// Sensor reporting `reading` on every update.
    pub fn fixed(name: impl Into<String>, slot: usize, reading: SensorReading) -> Self {
        Self {
            name: name.into(),
            slot,
            reading,
        }
    }
}

impl TemperatureSensor for SimulatedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn slot(&self) -> usize {
        self.slot
    }

    fn update(&mut self) -> AppResult<SensorReading> {
        Ok(self.reading.clone())
    }
}

/// Linux thermal zone (`/sys/class/thermal/thermal_zoneN/temp`, millidegrees C).
#[derive(Debug, Clone)]
pub struct ThermalZoneSensor {
    name: String,
    slot: usize,
    path: PathBuf,
}

impl ThermalZoneSensor {
    /// Default zone.
    pub const DEFAULT_PATH: &'static str = "/sys/class/thermal/thermal_zone0/temp";

    /// Sensor reading `path`.
    pub fn new(name: impl Into<String>, slot: usize, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            slot,
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_celsius(&self) -> AppResult<f64> {
        let fail = |reason: String| DaqError::SensorRead {
            sensor: self.name.clone(),
            reason,
        };
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| fail(format!("{}: {e}", self.path.display())))?;
        let milli: f64 = raw
            .trim()
            .parse()
            .map_err(|e| fail(format!("unparseable value '{}': {e}", raw.trim())))?;
        Ok(milli / 1000.0)
    }
}

impl TemperatureSensor for ThermalZoneSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn slot(&self) -> usize {
        self.slot
    }

    fn update(&mut self) -> AppResult<SensorReading> {
        let temp = self.read_celsius()?;
        tracing::trace!(sensor = %self.name, temp, "Thermal zone read");
        Ok(SensorReading {
            data: vec![temp],
            ..SensorReading::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inert_simulator_reports_nothing() {
        let mut sensor = SimulatedSensor::inert("a", 10);
        assert_eq!(sensor.update().unwrap(), SensorReading::default());
        assert_eq!(sensor.slot(), 10);
    }

    #[test]
    fn test_thermal_zone_reads_millidegrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        std::fs::write(&path, "42350\n").unwrap();

        let mut sensor = ThermalZoneSensor::new("cpu", 12, &path);
        let reading = sensor.update().unwrap();
        assert_eq!(reading.data, vec![42.35]);
        assert!(reading.dew_point.is_none());
    }

    #[test]
    fn test_thermal_zone_errors_are_sensor_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");

        let mut sensor = ThermalZoneSensor::new("cpu", 12, &path);
        assert!(matches!(sensor.update(), Err(DaqError::SensorRead { .. })));

        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(sensor.update(), Err(DaqError::SensorRead { .. })));
    }
}
