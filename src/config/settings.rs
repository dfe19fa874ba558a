//! Strongly-typed configuration tree and its validation.

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::camera::libcamera::ImageFileType;
use crate::camera::profile::{self, CameraProfile};
use crate::error::{AppResult, DaqError};
use crate::state::{RESERVED_SLOTS, SENSOR_SLOT_COUNT};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Observing site
    pub location: LocationConfig,
    /// Capture device settings
    pub camera: CameraConfig,
    /// Exposure bounds
    pub exposure: ExposureConfig,
    /// Auto-exposure targets
    pub brightness: BrightnessConfig,
    /// Capture orchestrator settings
    pub orchestrator: OrchestratorConfig,
    /// Dew heater threshold loop
    pub dew_heater: DewHeaterConfig,
    /// Temperature sensors feeding the shared sensor slots
    pub temp_sensors: Vec<TempSensorDefinition>,
}

/// Output style of the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, ANSI-coloured lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Where to write the per-frame status document (disabled when unset)
    pub status_file: Option<PathBuf>,
    /// Root directory for image records
    pub data_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "sky_daq".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            status_file: None,
            data_dir: PathBuf::from("/var/lib/sky_daq"),
        }
    }
}

/// Observing site
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Degrees, north positive
    pub latitude: f64,
    /// Degrees, east positive
    pub longitude: f64,
    /// Metres above sea level
    pub elevation_m: f64,
    /// Sun altitude below which the system runs in night mode
    pub night_sun_alt_deg: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            latitude: 33.0,
            longitude: -84.0,
            elevation_m: 0.0,
            night_sun_alt_deg: -6.0,
        }
    }
}

/// Gain and binning used while a given mode is active
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeSettings {
    /// Sensor gain
    pub gain: i64,
    /// Pixel binning factor
    pub binning: u32,
}

/// Capture device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Key into the camera profile table (e.g. "imx477")
    pub profile: String,
    /// Camera identifier attached to every capture job
    pub camera_id: i64,
    /// Capture executable
    pub command: String,
    /// Output encoding: dng, jpg or png
    pub image_file_type: String,
    /// Still quality for encoded output
    pub still_quality: u8,
    /// Free-form options appended verbatim to the capture command
    pub extra_options: String,
    /// Directory for in-flight frames (system temp dir when unset)
    pub temp_dir: Option<PathBuf>,
    /// Template for persisted image names
    pub filename_template: String,
    /// Seconds between exposure starts at night
    pub exposure_period_s: f64,
    /// Seconds between exposure starts by day
    pub exposure_period_day_s: f64,
    /// How often the scheduler polls the adapter
    pub poll_interval_ms: u64,
    /// Night gain/binning
    pub night: ModeSettings,
    /// Moon-mode gain/binning
    pub moonmode: ModeSettings,
    /// Day gain/binning
    pub day: ModeSettings,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            profile: "imx477".to_string(),
            camera_id: 1,
            command: "libcamera-still".to_string(),
            image_file_type: "jpg".to_string(),
            still_quality: 100,
            extra_options: String::new(),
            temp_dir: None,
            filename_template: "ccd{camera_id}_{timestamp}.{ext}".to_string(),
            exposure_period_s: 15.0,
            exposure_period_day_s: 15.0,
            poll_interval_ms: 100,
            night: ModeSettings {
                gain: 100,
                binning: 1,
            },
            moonmode: ModeSettings {
                gain: 75,
                binning: 1,
            },
            day: ModeSettings {
                gain: 0,
                binning: 1,
            },
        }
    }
}

/// Exposure bounds in seconds. Unset minimums fall back to the camera profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Minimum exposure at night
    pub exposure_min: Option<f64>,
    /// Minimum exposure by day
    pub exposure_min_day: Option<f64>,
    /// Maximum exposure
    pub exposure_max: f64,
    /// First exposure after startup
    pub exposure_default: Option<f64>,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            exposure_min: None,
            exposure_min_day: None,
            exposure_max: 15.0,
            exposure_default: None,
        }
    }
}

/// Exposure bounds after merging configuration with the camera profile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureLimits {
    /// Night minimum
    pub min_night: f64,
    /// Day minimum
    pub min_day: f64,
    /// Maximum
    pub max: f64,
    /// Starting exposure
    pub default: f64,
}

impl ExposureConfig {
    /// Resolve configured bounds against what the sensor can actually do.
    pub fn resolve(&self, profile: &CameraProfile) -> ExposureLimits {
        let clamp = |v: f64| v.clamp(profile.min_exposure, profile.max_exposure);
        let max = clamp(self.exposure_max);
        let min_night = clamp(self.exposure_min.unwrap_or(profile.min_exposure)).min(max);
        let min_day = clamp(self.exposure_min_day.unwrap_or(profile.min_exposure)).min(max);
        let default = self
            .exposure_default
            .map(|v| v.clamp(min_night, max))
            .unwrap_or(min_night);

        ExposureLimits {
            min_night,
            min_day,
            max,
            default,
        }
    }
}

/// Auto-exposure targets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrightnessConfig {
    /// Target 8-bit mean brightness at night
    pub target_adu: f64,
    /// Target 8-bit mean brightness by day
    pub target_adu_day: f64,
    /// Allowed deviation at night
    pub adu_dev: f64,
    /// Allowed deviation by day
    pub adu_dev_day: f64,
    /// Samples averaged before a locked target may be abandoned
    pub history_len: usize,
    /// Proportional correction scale at night
    pub scale_factor_night: f64,
    /// Proportional correction scale by day
    pub scale_factor_day: f64,
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            target_adu: 75.0,
            target_adu_day: 75.0,
            adu_dev: 10.0,
            adu_dev_day: 20.0,
            history_len: 6,
            scale_factor_night: 1.0,
            scale_factor_day: 0.5,
        }
    }
}

/// Capture orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Bounded wait on the capture queue before re-checking shutdown
    pub queue_wait_ms: u64,
    /// Capacity of the capture-complete queue
    pub queue_capacity: usize,
    /// Black level subtracted during calibration
    pub black_level: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // prime
            queue_wait_ms: 23_000,
            queue_capacity: 8,
            black_level: 0,
        }
    }
}

/// Dew heater threshold loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DewHeaterConfig {
    /// Heater implementation key ("simulator", "pwm_sysfs")
    pub class: String,
    /// Sysfs PWM channel directory for `pwm_sysfs`
    pub pwm_path: Option<PathBuf>,
    /// PWM period for `pwm_sysfs`
    pub pwm_period_ns: u64,
    /// Level applied on mode changes and when no band matches
    pub level_default: f64,
    /// Low heat level
    pub level_low: f64,
    /// Medium heat level
    pub level_med: f64,
    /// High heat level
    pub level_high: f64,
    /// Differential at or below which LOW is applied
    pub thold_diff_low: f64,
    /// Differential at or below which MEDIUM is applied
    pub thold_diff_med: f64,
    /// Differential at or below which HIGH is applied
    pub thold_diff_high: f64,
    /// Enables threshold control
    pub threshold_enable: bool,
    /// Keep the heater (and threshold control) running by day
    pub enable_day: bool,
    /// Fixed target temperature; 0 uses the measured dew point
    pub manual_target: f64,
    /// Sensor slot holding the surface temperature to protect
    pub temp_user_slot: usize,
    /// Seconds between ticks
    pub period_s: u64,
}

impl Default for DewHeaterConfig {
    fn default() -> Self {
        Self {
            class: "simulator".to_string(),
            pwm_path: None,
            pwm_period_ns: 1_000_000,
            level_default: 100.0,
            level_low: 33.0,
            level_med: 66.0,
            level_high: 100.0,
            thold_diff_low: 15.0,
            thold_diff_med: 10.0,
            thold_diff_high: 5.0,
            threshold_enable: false,
            enable_day: false,
            manual_target: 0.0,
            temp_user_slot: 10,
            period_s: 59,
        }
    }
}

/// Temperature sensor definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempSensorDefinition {
    /// Sensor implementation key ("simulator", "thermal_zone")
    pub class: String,
    /// First shared slot the sensor writes into
    pub slot: usize,
    /// Display label
    #[serde(default)]
    pub label: Option<String>,
    /// Device path for file-backed sensors
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SkyConfig {
    /// Load configuration from a TOML file plus `SKYDAQ_` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SKYDAQ_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Camera profile selected by `camera.profile`.
    pub fn camera_profile(&self) -> AppResult<&'static CameraProfile> {
        profile::lookup(&self.camera.profile).ok_or_else(|| {
            DaqError::Configuration(format!(
                "Unknown camera profile '{}'. Must be one of: {}",
                self.camera.profile,
                profile::names().join(", ")
            ))
        })
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a `DaqError::Configuration` describing the first problem found.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let profile = self.camera_profile()?;
        ImageFileType::parse(&self.camera.image_file_type)
            .map_err(|e| DaqError::Configuration(e.to_string()))?;

        if self.camera.exposure_period_s <= 0.0 || self.camera.exposure_period_day_s <= 0.0 {
            return Err(DaqError::Configuration(
                "Exposure periods must be > 0".to_string(),
            ));
        }

        for (mode, settings) in [
            ("night", &self.camera.night),
            ("moonmode", &self.camera.moonmode),
            ("day", &self.camera.day),
        ] {
            if settings.binning == 0 {
                return Err(DaqError::Configuration(format!(
                    "camera.{mode}.binning must be >= 1"
                )));
            }
            if settings.gain < profile.min_gain || settings.gain > profile.max_gain {
                tracing::warn!(
                    mode,
                    gain = settings.gain,
                    min = profile.min_gain,
                    max = profile.max_gain,
                    "Configured gain outside sensor range, it will be clamped"
                );
            }
        }

        self.validate_exposure()?;
        self.validate_brightness()?;
        self.validate_dew_heater()?;
        self.validate_sensors()?;

        Ok(())
    }

    fn validate_exposure(&self) -> AppResult<()> {
        let exposure = &self.exposure;
        if exposure.exposure_max <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid exposure_max {}. Must be > 0",
                exposure.exposure_max
            )));
        }
        for (name, value) in [
            ("exposure_min", exposure.exposure_min),
            ("exposure_min_day", exposure.exposure_min_day),
        ] {
            if let Some(min) = value {
                if min < 0.0 || min > exposure.exposure_max {
                    return Err(DaqError::Configuration(format!(
                        "Invalid {name} {min}. Must be within 0..={}",
                        exposure.exposure_max
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_brightness(&self) -> AppResult<()> {
        let b = &self.brightness;
        for (name, value) in [
            ("target_adu", b.target_adu),
            ("target_adu_day", b.target_adu_day),
            ("adu_dev", b.adu_dev),
            ("adu_dev_day", b.adu_dev_day),
            ("scale_factor_night", b.scale_factor_night),
            ("scale_factor_day", b.scale_factor_day),
        ] {
            if value <= 0.0 {
                return Err(DaqError::Configuration(format!(
                    "Invalid brightness.{name} {value}. Must be > 0"
                )));
            }
        }
        if b.history_len == 0 {
            return Err(DaqError::Configuration(
                "brightness.history_len must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_dew_heater(&self) -> AppResult<()> {
        let dh = &self.dew_heater;
        if !(dh.thold_diff_high <= dh.thold_diff_med && dh.thold_diff_med <= dh.thold_diff_low) {
            return Err(DaqError::Configuration(format!(
                "Dew heater thresholds must satisfy high <= med <= low (got {}, {}, {})",
                dh.thold_diff_high, dh.thold_diff_med, dh.thold_diff_low
            )));
        }
        for (name, level) in [
            ("level_default", dh.level_default),
            ("level_low", dh.level_low),
            ("level_med", dh.level_med),
            ("level_high", dh.level_high),
        ] {
            if !(0.0..=100.0).contains(&level) {
                return Err(DaqError::Configuration(format!(
                    "Invalid dew_heater.{name} {level}. Must be 0-100"
                )));
            }
        }
        if dh.temp_user_slot >= SENSOR_SLOT_COUNT {
            return Err(DaqError::Configuration(format!(
                "dew_heater.temp_user_slot {} out of range (max {})",
                dh.temp_user_slot,
                SENSOR_SLOT_COUNT - 1
            )));
        }
        if dh.period_s == 0 {
            return Err(DaqError::Configuration(
                "dew_heater.period_s must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_sensors(&self) -> AppResult<()> {
        let mut slots = HashSet::new();
        for sensor in &self.temp_sensors {
            if sensor.slot < RESERVED_SLOTS || sensor.slot >= SENSOR_SLOT_COUNT {
                return Err(DaqError::Configuration(format!(
                    "Sensor '{}' slot {} out of range ({}..{})",
                    sensor.class, sensor.slot, RESERVED_SLOTS, SENSOR_SLOT_COUNT
                )));
            }
            if !slots.insert(sensor.slot) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate sensor slot: {}",
                    sensor.slot
                )));
            }
        }
        Ok(())
    }
}
