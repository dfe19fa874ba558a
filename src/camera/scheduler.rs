//! Periodic exposure trigger.
//!
//! The scheduler owns the capture device. Each tick it refreshes the
//! night/day mode, polls the device and starts the next exposure once the
//! device is ready and the mode's period has elapsed.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

use super::libcamera::{CaptureDevice, ExposureState};
use crate::config::{CameraConfig, ModeSettings};
use crate::error::AppResult;
use crate::exposure::ExposureRequest;
use crate::shutdown::ShutdownToken;
use crate::state::SharedControlState;

/// Extra time allowed for an in-flight exposure to finish after shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Decides whether a given instant is night.
pub type NightSource = Box<dyn Fn(DateTime<Utc>) -> bool + Send + Sync>;

/// Timing and per-mode parameters
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Night cadence
    pub period_night: Duration,
    /// Day cadence
    pub period_day: Duration,
    /// Poll interval
    pub poll_interval: Duration,
    /// Night gain/binning
    pub night: ModeSettings,
    /// Moon-mode gain/binning
    pub moonmode: ModeSettings,
    /// Day gain/binning
    pub day: ModeSettings,
}

impl SchedulerSettings {
    /// Derive from the `[camera]` section.
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            period_night: Duration::from_secs_f64(config.exposure_period_s),
            period_day: Duration::from_secs_f64(config.exposure_period_day_s),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            night: config.night,
            moonmode: config.moonmode,
            day: config.day,
        }
    }
}

/// Drives a [`CaptureDevice`] on the configured cadence.
pub struct CaptureScheduler<D: CaptureDevice> {
    device: D,
    state: SharedControlState,
    settings: SchedulerSettings,
    night_source: NightSource,
    mode: Option<(bool, bool)>,
    next_start: Option<Instant>,
}

impl<D: CaptureDevice> CaptureScheduler<D> {
    /// New scheduler. The first exposure starts on the first tick.
    pub fn new(
        device: D,
        state: SharedControlState,
        settings: SchedulerSettings,
        night_source: NightSource,
    ) -> Self {
        Self {
            device,
            state,
            settings,
            night_source,
            mode: None,
            next_start: None,
        }
    }

    /// Run until `shutdown` fires, then let any in-flight exposure finish.
    pub async fn run(mut self, shutdown: ShutdownToken) -> AppResult<()> {
        tracing::info!("Capture scheduler started");

        while !shutdown.is_cancelled() {
            self.tick(Instant::now(), Utc::now()).await?;

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.drain().await;
        tracing::info!("Capture scheduler stopped");
        Ok(())
    }

    async fn tick(&mut self, now: Instant, now_utc: DateTime<Utc>) -> AppResult<()> {
        let night = (self.night_source)(now_utc);
        self.apply_mode(night);

        let status = self.device.poll_status().await?;
        if !status.is_ready() {
            return Ok(());
        }
        if self.next_start.is_some_and(|t| now < t) {
            return Ok(());
        }

        let request = ExposureRequest::from_values(&self.state.snapshot());
        if let Err(e) = self.device.start_exposure(request.exposure_seconds).await {
            tracing::error!("Failed to start exposure, retrying next period: {}", e);
        }
        self.next_start = Some(now + self.period(night));
        Ok(())
    }

    fn period(&self, night: bool) -> Duration {
        if night {
            self.settings.period_night
        } else {
            self.settings.period_day
        }
    }

    fn apply_mode(&mut self, night: bool) {
        let moon_mode = self.state.snapshot().moon_mode;
        if self.mode == Some((night, moon_mode)) {
            return;
        }

        let (name, mode) = match (night, moon_mode) {
            (false, _) => ("day", self.settings.day),
            (true, true) => ("moonmode", self.settings.moonmode),
            (true, false) => ("night", self.settings.night),
        };
        self.state.update(|v| {
            v.night = night;
            v.gain = mode.gain;
            v.binning = mode.binning;
        });
        self.mode = Some((night, moon_mode));

        tracing::info!(
            mode = name,
            gain = mode.gain,
            binning = mode.binning,
            "Capture mode changed"
        );
    }

    async fn drain(&mut self) {
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.state.exposure().max(0.0)) + DRAIN_GRACE;

        while self.device.state() == ExposureState::Exposing {
            if Instant::now() >= deadline {
                tracing::warn!("Exposure still running at shutdown, abandoning it");
                break;
            }
            if let Err(e) = self.device.poll_status().await {
                tracing::warn!("Dropping final exposure: {}", e);
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
