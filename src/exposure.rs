//! Auto-exposure feedback controller.
//!
//! The controller has two sub-states:
//!
//! - **Searching**: every frame outside `target_adu ± adu_dev` gets a damped
//!   proportional correction. The first frame inside the band locks the
//!   controller on that frame's brightness.
//! - **Locked**: frames accumulate in a short history. Once the history is
//!   full, a rolling mean outside `current_adu_target ± adu_dev` unlocks the
//!   controller. The unlocking frame itself does not change exposure.
//!
//! Single-frame noise therefore never moves exposure once locked, while a
//! sustained drift (clouds, twilight) is picked up within one history length.

use serde::Serialize;
use std::collections::VecDeque;

use crate::config::BrightnessConfig;
use crate::state::{ControlValues, SharedControlState};

/// Brightness measurements at or below zero are replaced with this.
const MIN_ADU: f64 = 0.1;

/// Parameters of the next capture
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposureRequest {
    /// Exposure in seconds, within the active mode's bounds
    pub exposure_seconds: f64,
    /// Sensor gain
    pub gain: i64,
    /// Binning factor
    pub binning: u32,
}

impl ExposureRequest {
    /// Request derived from the shared state, clamped to the active bounds.
    pub fn from_values(values: &ControlValues) -> Self {
        let (min, max) = values.exposure_bounds();
        Self {
            exposure_seconds: values.exposure.clamp(min, max),
            gain: values.gain,
            binning: values.binning,
        }
    }
}

/// Lock state of the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TargetState {
    /// Brightness the controller locked on
    pub current_adu_target: f64,
    /// True while locked
    pub target_found: bool,
}

#[derive(Debug, Clone, Copy)]
struct ModeParams {
    target_adu: f64,
    adu_dev: f64,
    scale_factor: f64,
}

/// Adjusts the shared exposure toward a brightness target.
#[derive(Debug)]
pub struct AutoExposureController {
    config: BrightnessConfig,
    state: SharedControlState,
    target: TargetState,
    history: VecDeque<f64>,
}

impl AutoExposureController {
    /// New controller in the searching state.
    pub fn new(config: BrightnessConfig, state: SharedControlState) -> Self {
        let capacity = config.history_len;
        Self {
            config,
            state,
            target: TargetState::default(),
            history: VecDeque::with_capacity(capacity),
        }
    }

    /// Current lock state.
    pub fn target(&self) -> TargetState {
        self.target
    }

    /// Configured target for the given mode.
    pub fn target_adu(&self, night: bool) -> f64 {
        self.params(night).target_adu
    }

    fn params(&self, night: bool) -> ModeParams {
        if night {
            ModeParams {
                target_adu: self.config.target_adu,
                adu_dev: self.config.adu_dev,
                scale_factor: self.config.scale_factor_night,
            }
        } else {
            ModeParams {
                target_adu: self.config.target_adu_day,
                adu_dev: self.config.adu_dev_day,
                scale_factor: self.config.scale_factor_day,
            }
        }
    }

    /// Feed one brightness measurement taken from a frame exposed for
    /// `exposure` seconds.
    ///
    /// Corrections start from the frame's own exposure, not from the shared
    /// value, which may already hold a correction for an earlier frame.
    ///
    /// Returns `(adu, adu_average)`. The average is 0.0 while searching and
    /// until the locked history is full.
    pub fn recalculate_exposure(&mut self, adu: f64, exposure: f64) -> (f64, f64) {
        let adu = if adu > 0.0 { adu } else { MIN_ADU };
        let night = self.state.night();
        let params = self.params(night);

        if !self.target.target_found {
            self.search(adu, exposure, params);
            return (adu, 0.0);
        }

        self.history.push_back(adu);
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
        if self.history.len() < self.config.history_len {
            return (adu, 0.0);
        }

        let average = self.history.iter().sum::<f64>() / self.history.len() as f64;
        let current_min = self.target.current_adu_target - params.adu_dev;
        let current_max = self.target.current_adu_target + params.adu_dev;

        if average > current_max || average < current_min {
            tracing::warn!(
                adu_average = average,
                current_adu_target = self.target.current_adu_target,
                "Brightness drifted out of band, searching for new exposure"
            );
            self.target.target_found = false;
        }

        (adu, average)
    }

    fn search(&mut self, adu: f64, exposure: f64, params: ModeParams) {
        let target_min = params.target_adu - params.adu_dev;
        let target_max = params.target_adu + params.adu_dev;

        if (target_min..=target_max).contains(&adu) {
            tracing::info!(adu, "Stable exposure found");
            self.target = TargetState {
                current_adu_target: adu,
                target_found: true,
            };
            self.history.clear();
            return;
        }

        let proposed =
            exposure - (exposure - exposure * (params.target_adu / adu)) * params.scale_factor;
        let new = self.state.update(|v| {
            let (min, max) = v.exposure_bounds();
            v.exposure = proposed.clamp(min, max);
            v.exposure
        });

        tracing::info!(
            adu,
            target_adu = params.target_adu,
            exposure_s = new,
            frame_exposure_s = exposure,
            "New calculated exposure"
        );
    }
}
