//! Core library for the sky_daq capture-and-control loop.
//!
//! An unattended sky camera runs four cooperating workers:
//!
//! - the capture scheduler drives a process-backed camera adapter
//!   ([`camera`]) and emits a job per finished frame,
//! - the capture orchestrator ([`orchestrator`]) moves each frame through the
//!   image pipeline and feeds the auto-exposure controller ([`exposure`]),
//! - the dew heater loop ([`actuator`]) maps a dew-point differential to a
//!   heater level,
//! - the supervisor ([`supervisor`]) owns the tasks and the shutdown sequence.
//!
//! Workers share scalars only through [`state::SharedControlState`] and
//! communicate through bounded channels.

pub mod actuator;
pub mod astro;
pub mod camera;
pub mod config;
pub mod devices;
pub mod error;
pub mod exposure;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod supervisor;
