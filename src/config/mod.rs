//! Configuration for the capture-and-control loop.
//!
//! Configuration is loaded with Figment from a TOML file and then overridden by
//! environment variables with the `SKYDAQ_` prefix. Nested keys are separated
//! by a double underscore:
//!
//! ```text
//! SKYDAQ_APPLICATION__LOG_LEVEL=debug
//! SKYDAQ_BRIGHTNESS__TARGET_ADU=80
//! SKYDAQ_DEW_HEATER__THRESHOLD_ENABLE=true
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sky_daq::config::SkyConfig;
//!
//! let config = SkyConfig::load_from("config/sky_daq.toml")?;
//! println!("Camera profile: {}", config.camera.profile);
//! # Ok::<(), sky_daq::error::DaqError>(())
//! ```

pub mod settings;

pub use settings::{
    ApplicationConfig, BrightnessConfig, CameraConfig, DewHeaterConfig, ExposureConfig,
    ExposureLimits, LocationConfig, LogFormat, ModeSettings, OrchestratorConfig, SkyConfig,
    TempSensorDefinition,
};
