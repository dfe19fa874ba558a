//! Exposure state machine over an external still-capture tool.
//!
//! The adapter turns a process-per-frame capture command (`libcamera-still`
//! and compatibles) into a start / poll / ready contract:
//!
//! ```text
//! IDLE --start_exposure--> EXPOSING --poll (process running)--> BUSY
//!                               \--poll (process exited)--> READY + CaptureJob --> IDLE
//! ```
//!
//! At most one exposure is in flight per adapter. A capture process that exits
//! with a nonzero status still produces a job; the orchestrator rejects the
//! empty or invalid frame.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::job::{CaptureJob, CaptureMessage};
use super::profile::CameraProfile;
use crate::config::CameraConfig;
use crate::error::{AppResult, DaqError};
use crate::state::SharedControlState;

/// Raw output needs this much memory to be reliable.
const LOW_MEMORY_THRESHOLD_BYTES: u64 = 768 * 1024 * 1024;

/// Output encoding requested from the capture tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImageFileType {
    /// Raw DNG
    Dng,
    /// JPEG
    Jpg,
    /// PNG
    Png,
}

impl ImageFileType {
    /// Parse a configuration value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "dng" => Ok(ImageFileType::Dng),
            "jpg" | "jpeg" => Ok(ImageFileType::Jpg),
            "png" => Ok(ImageFileType::Png),
            other => Err(DaqError::UnsupportedFileType(other.to_string())),
        }
    }

    /// File extension without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFileType::Dng => "dng",
            ImageFileType::Jpg => "jpg",
            ImageFileType::Png => "png",
        }
    }
}

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    /// No capture process running
    Idle,
    /// A capture process has been launched and not yet observed to exit
    Exposing,
}

/// Result of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Capture process still running
    Busy,
    /// No exposure in flight
    Ready,
}

impl PollStatus {
    /// True when a new exposure may be started.
    pub fn is_ready(&self) -> bool {
        matches!(self, PollStatus::Ready)
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollStatus::Busy => write!(f, "BUSY"),
            PollStatus::Ready => write!(f, "READY"),
        }
    }
}

/// Anything the capture scheduler can drive.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Begin an exposure. Ignored while one is already in flight.
    async fn start_exposure(&mut self, exposure_seconds: f64) -> AppResult<()>;

    /// Check for completion, emitting a job on the first observed exit.
    async fn poll_status(&mut self) -> AppResult<PollStatus>;

    /// Current lifecycle state.
    fn state(&self) -> ExposureState;
}

/// Invocation parameters derived from configuration
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Executable
    pub command: String,
    /// Output encoding
    pub file_type: ImageFileType,
    /// Encoded still quality
    pub quality: u8,
    /// Extra options, already split
    pub extra_options: Vec<String>,
    /// Directory for in-flight frames
    pub temp_dir: PathBuf,
    /// Camera id stamped on jobs
    pub camera_id: i64,
    /// Persisted name template stamped on jobs
    pub filename_template: String,
}

impl CaptureSettings {
    /// Derive settings from the `[camera]` section.
    pub fn from_config(config: &CameraConfig) -> AppResult<Self> {
        Ok(Self {
            command: config.command.clone(),
            file_type: ImageFileType::parse(&config.image_file_type)?,
            quality: config.still_quality,
            extra_options: config
                .extra_options
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            temp_dir: config
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            camera_id: config.camera_id,
            filename_template: config.filename_template.clone(),
        })
    }
}

/// Build the capture tool's argument list.
pub fn build_command_args(
    settings: &CaptureSettings,
    gain: i64,
    exposure_seconds: f64,
    output: &Path,
) -> Vec<String> {
    let shutter_us = (exposure_seconds * 1_000_000.0).round().max(1.0) as u64;

    let mut args: Vec<String> = vec!["--immediate".into(), "--nopreview".into()];
    match settings.file_type {
        ImageFileType::Dng => args.push("--raw".into()),
        ImageFileType::Jpg | ImageFileType::Png => {
            args.extend([
                "--encoding".into(),
                settings.file_type.extension().into(),
                "--quality".into(),
                settings.quality.to_string(),
            ]);
        }
    }
    args.extend([
        "--denoise".into(),
        "off".into(),
        "--awbgains".into(),
        "1,1".into(),
        "--gain".into(),
        gain.to_string(),
        "--shutter".into(),
        shutter_us.to_string(),
    ]);
    args.extend(settings.extra_options.iter().cloned());
    args.push("--output".into());
    args.push(output.to_string_lossy().into_owned());
    args
}

struct InFlight {
    child: Child,
    frame_path: PathBuf,
    exposure_seconds: f64,
    started_at: DateTime<Utc>,
    started: Instant,
    output: JoinHandle<Vec<String>>,
}

/// Process-backed capture adapter, parameterized by a [`CameraProfile`].
pub struct CameraAdapter {
    profile: &'static CameraProfile,
    settings: CaptureSettings,
    state: SharedControlState,
    jobs: mpsc::Sender<CaptureMessage>,
    in_flight: Option<InFlight>,
    low_memory: bool,
}

impl CameraAdapter {
    /// Create an idle adapter that emits jobs on `jobs`.
    pub fn new(
        profile: &'static CameraProfile,
        settings: CaptureSettings,
        state: SharedControlState,
        jobs: mpsc::Sender<CaptureMessage>,
    ) -> Self {
        let low_memory = settings.file_type == ImageFileType::Dng && is_low_memory();
        Self {
            profile,
            settings,
            state,
            jobs,
            in_flight: None,
            low_memory,
        }
    }

    /// Profile this adapter was built with.
    pub fn profile(&self) -> &'static CameraProfile {
        self.profile
    }

    /// Frame path of the exposure in flight, if any.
    pub fn in_flight_path(&self) -> Option<&Path> {
        self.in_flight.as_ref().map(|f| f.frame_path.as_path())
    }

    /// Start an exposure and block until the capture process exits or
    /// `timeout` elapses.
    ///
    /// On completion the job is emitted exactly as a poll would. On timeout
    /// the process keeps running and must be polled as usual.
    ///
    /// # Errors
    ///
    /// `DaqError::Timeout` when the wait expires.
    pub async fn start_exposure_sync(
        &mut self,
        exposure_seconds: f64,
        timeout: Duration,
    ) -> AppResult<()> {
        self.start_exposure(exposure_seconds).await?;

        if let Some(in_flight) = self.in_flight.as_mut() {
            match tokio::time::timeout(timeout, in_flight.child.wait()).await {
                Ok(status) => {
                    status?;
                }
                Err(_) => {
                    tracing::warn!(
                        camera_id = self.settings.camera_id,
                        ?timeout,
                        "Timed out waiting for exposure, capture left running"
                    );
                    return Err(DaqError::Timeout { waited: timeout });
                }
            }
        }

        self.poll_status().await.map(|_| ())
    }

    fn allocate_frame_path(&self) -> AppResult<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix("sky_daq_")
            .suffix(&format!(".{}", self.settings.file_type.extension()))
            .tempfile_in(&self.settings.temp_dir)?
            .into_temp_path()
            .keep()
            .map_err(|e| DaqError::Io(e.error))?;
        Ok(path)
    }

    async fn finish(&mut self, in_flight: InFlight, status: ExitStatus) -> AppResult<()> {
        let elapsed = in_flight.started.elapsed().as_secs_f64();
        let output = in_flight.output.await.unwrap_or_default();

        if !status.success() {
            tracing::error!(
                camera_id = self.settings.camera_id,
                code = ?status.code(),
                "Capture process exited with error"
            );
            for line in &output {
                tracing::error!(camera_id = self.settings.camera_id, "{line}");
            }
        } else {
            for line in &output {
                tracing::trace!(camera_id = self.settings.camera_id, "{line}");
            }
        }

        let job = CaptureJob {
            frame_path: in_flight.frame_path,
            exposure_seconds: in_flight.exposure_seconds,
            capture_started_at: in_flight.started_at,
            capture_elapsed_s: elapsed,
            camera_id: self.settings.camera_id,
            filename_template: self.settings.filename_template.clone(),
        };

        tracing::debug!(
            camera_id = job.camera_id,
            frame = %job.frame_path.display(),
            elapsed_s = elapsed,
            "Exposure complete"
        );

        if let Err(mpsc::error::SendError(msg)) = self.jobs.send(CaptureMessage::Job(job)).await {
            if let CaptureMessage::Job(job) = msg {
                let _ = std::fs::remove_file(&job.frame_path);
            }
            return Err(DaqError::Camera("capture queue closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CaptureDevice for CameraAdapter {
    async fn start_exposure(&mut self, exposure_seconds: f64) -> AppResult<()> {
        if self.in_flight.is_some() {
            tracing::debug!(
                camera_id = self.settings.camera_id,
                "Exposure already in progress, ignoring start request"
            );
            return Ok(());
        }

        if self.low_memory {
            tracing::warn!("*** Capturing raw images with low memory may fail ***");
        }

        let exposure_seconds = self.profile.clamp_exposure(exposure_seconds);
        let gain = self.profile.clamp_gain(self.state.snapshot().gain);

        let frame_path = self.allocate_frame_path()?;
        let args = build_command_args(&self.settings, gain, exposure_seconds, &frame_path);

        tracing::info!(
            camera_id = self.settings.camera_id,
            exposure_s = exposure_seconds,
            gain,
            "Starting exposure"
        );
        tracing::debug!(command = %self.settings.command, ?args, "Capture command");

        let spawned = Command::new(&self.settings.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&frame_path);
                return Err(DaqError::Camera(format!(
                    "failed to launch '{}': {e}",
                    self.settings.command
                )));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = tokio::spawn(async move {
            let (mut out, err) = tokio::join!(collect_lines(stdout), collect_lines(stderr));
            out.extend(err);
            out
        });

        self.in_flight = Some(InFlight {
            child,
            frame_path,
            exposure_seconds,
            started_at: Utc::now(),
            started: Instant::now(),
            output,
        });

        Ok(())
    }

    async fn poll_status(&mut self) -> AppResult<PollStatus> {
        let status = match self.in_flight.as_mut() {
            None => return Ok(PollStatus::Ready),
            Some(in_flight) => in_flight.child.try_wait()?,
        };

        match status {
            None => Ok(PollStatus::Busy),
            Some(status) => {
                if let Some(in_flight) = self.in_flight.take() {
                    self.finish(in_flight, status).await?;
                }
                Ok(PollStatus::Ready)
            }
        }
    }

    fn state(&self) -> ExposureState {
        if self.in_flight.is_some() {
            ExposureState::Exposing
        } else {
            ExposureState::Idle
        }
    }
}

async fn collect_lines<R>(reader: Option<R>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    if let Some(reader) = reader {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            lines.push(line);
        }
    }
    lines
}

fn is_low_memory() -> bool {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    total > 0 && total <= LOW_MEMORY_THRESHOLD_BYTES
}
