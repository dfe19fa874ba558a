//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by every
//! worker in the capture-and-control loop. It is built with `thiserror` so that
//! underlying errors convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while parsing/merging configuration sources.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration
//!   (e.g. `exposure_min` above `exposure_max`). Caught by validation at startup.
//! - **`Io`**: Wraps `std::io::Error` (frame files, device files, status file).
//! - **`Timeout`**: The synchronous capture wait expired. The capture process is left running.
//! - **`BadImage`**: The processing pipeline rejected a frame. The job is dropped, never retried.
//! - **`SensorRead`**: A temperature sensor could not be read. Only that sensor's tick is skipped.
//! - **`UnknownDevice`**: A configuration key does not name a registered sensor/heater.
//! - **`UnsupportedFileType`**: The capture tool was asked for an image encoding it cannot produce.
//! - **`WorkerFailed`**: A supervised worker terminated; carries the worker name and cause.
//!
//! Transient conditions are handled where they occur; anything that escapes a
//! worker's job body is treated as fatal for that worker.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {waited:?} waiting for exposure")]
    Timeout { waited: Duration },

    #[error("Bad image: {0}")]
    BadImage(String),

    #[error("Sensor '{sensor}' read failed: {reason}")]
    SensorRead { sensor: String, reason: String },

    #[error("Actuator error: {0}")]
    Actuator(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Unknown {kind} class '{key}'")]
    UnknownDevice { kind: &'static str, key: String },

    #[error("Unsupported image file type '{0}'")]
    UnsupportedFileType(String),

    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker '{worker}' failed: {message}")]
    WorkerFailed { worker: String, message: String },

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Errors that only invalidate the current frame, not the worker.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, DaqError::BadImage(_))
    }
}
