//! Sensors and actuators used by the dew heater loop.
//!
//! Implementations are selected by configuration key through
//! [`DeviceRegistry`], which builds everything at startup so an unknown key
//! fails before any worker runs.

pub mod heaters;
pub mod registry;
pub mod sensors;

pub use heaters::{DewHeater, PwmSysfsHeater, SimulatedHeater};
pub use registry::{DeviceRegistry, Devices};
pub use sensors::{SensorReading, SimulatedSensor, TemperatureSensor, ThermalZoneSensor};
