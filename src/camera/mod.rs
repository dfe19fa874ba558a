//! Capture device control.
//!
//! - [`profile`]: sensor constants, selected by configuration key
//! - [`libcamera`]: exposure state machine over an external capture tool
//! - [`job`]: capture-complete queue payload
//! - [`scheduler`]: periodic trigger that drives the adapter

pub mod job;
pub mod libcamera;
pub mod profile;
pub mod scheduler;

pub use job::{CaptureJob, CaptureMessage};
pub use libcamera::{CameraAdapter, CaptureDevice, CaptureSettings, ExposureState, PollStatus};
pub use profile::CameraProfile;
pub use scheduler::{CaptureScheduler, SchedulerSettings};
