//! Capture orchestrator worker.
//!
//! Drains the capture-complete queue in arrival order and moves each frame
//! through the pipeline, the exposure controller and the downstream
//! collaborators. Per job:
//!
//! 1. Missing or zero-byte frames are logged and dropped (empty files deleted).
//! 2. `ingest`. A bad image is deleted and dropped without retry.
//! 3. The consumed source frame is deleted.
//! 4. `calibrate`, `measure_brightness`, then the exposure controller updates
//!    the shared exposure.
//! 5. Status document, persisted image, store entry and upload task.
//!
//! Jobs run on the blocking pool, one at a time. The queue wait is bounded so
//! shutdown is observed even when idle.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::camera::{CaptureJob, CaptureMessage};
use crate::config::SkyConfig;
use crate::error::{AppResult, DaqError};
use crate::exposure::AutoExposureController;
use crate::pipeline::{FrameRef, ImagePipeline};
use crate::shutdown::ShutdownToken;
use crate::state::{slot, SharedControlState};
use crate::storage::{
    save_image, write_status, ImageMetadata, ImageStore, StatusDocument, UploadQueue, UploadTask,
};

/// Orchestrator parameters
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Bounded queue wait
    pub queue_wait: Duration,
    /// Black level passed to calibration
    pub black_level: u32,
    /// Directory persisted images are written under
    pub image_dir: PathBuf,
    /// Status document path
    pub status_file: Option<PathBuf>,
    /// Name reported in the status document
    pub device_name: String,
    /// Site latitude for the status document
    pub latitude: f64,
    /// Site longitude for the status document
    pub longitude: f64,
}

impl OrchestratorSettings {
    /// Derive from the full configuration.
    pub fn from_config(config: &SkyConfig) -> Self {
        Self {
            queue_wait: Duration::from_millis(config.orchestrator.queue_wait_ms),
            black_level: config.orchestrator.black_level,
            image_dir: config.application.data_dir.join("images"),
            status_file: config.application.status_file.clone(),
            device_name: config.application.name.clone(),
            latitude: config.location.latitude,
            longitude: config.location.longitude,
        }
    }
}

/// Consumer of the capture-complete queue.
pub struct CaptureOrchestrator {
    settings: OrchestratorSettings,
    state: SharedControlState,
    controller: AutoExposureController,
    pipeline: Box<dyn ImagePipeline>,
    store: Box<dyn ImageStore>,
    uploads: UploadQueue,
    jobs: mpsc::Receiver<CaptureMessage>,
    image_count: u64,
}

impl CaptureOrchestrator {
    /// Wire the orchestrator to its collaborators.
    pub fn new(
        settings: OrchestratorSettings,
        state: SharedControlState,
        controller: AutoExposureController,
        pipeline: Box<dyn ImagePipeline>,
        store: Box<dyn ImageStore>,
        uploads: UploadQueue,
        jobs: mpsc::Receiver<CaptureMessage>,
    ) -> Self {
        Self {
            settings,
            state,
            controller,
            pipeline,
            store,
            uploads,
            jobs,
            image_count: 0,
        }
    }

    /// Frames successfully ingested so far.
    pub fn image_count(&self) -> u64 {
        self.image_count
    }

    /// Process jobs until a stop message, a closed queue or shutdown.
    ///
    /// Returns the orchestrator so callers can inspect it after it stops.
    pub async fn run(mut self, shutdown: ShutdownToken) -> AppResult<Self> {
        tracing::info!("Capture orchestrator started");

        loop {
            if shutdown.is_cancelled() {
                tracing::warn!("Shutdown requested, orchestrator stopping");
                break;
            }

            let received = tokio::select! {
                r = tokio::time::timeout(self.settings.queue_wait, self.jobs.recv()) => r,
                _ = shutdown.cancelled() => continue,
            };

            match received {
                Err(_) => continue,
                Ok(None) => {
                    tracing::info!("Capture queue closed");
                    break;
                }
                Ok(Some(CaptureMessage::Stop)) => {
                    tracing::info!("Stop requested");
                    break;
                }
                Ok(Some(CaptureMessage::Job(job))) => {
                    let (this, result) = tokio::task::spawn_blocking(move || {
                        let result = self.process_job(job);
                        (self, result)
                    })
                    .await
                    .map_err(|e| {
                        if e.is_panic() {
                            std::panic::resume_unwind(e.into_panic())
                        }
                        DaqError::WorkerFailed {
                            worker: "capture_orchestrator".to_string(),
                            message: e.to_string(),
                        }
                    })?;
                    self = this;
                    result?;
                }
            }
        }

        self.discard_pending();
        tracing::info!(image_count = self.image_count, "Capture orchestrator stopped");
        Ok(self)
    }

    /// Drop queued jobs that will never be processed, deleting their frames.
    fn discard_pending(&mut self) {
        while let Ok(msg) = self.jobs.try_recv() {
            if let CaptureMessage::Job(job) = msg {
                tracing::warn!(frame = %job.frame_path.display(), "Discarding unprocessed frame");
                remove_frame(&job.frame_path);
            }
        }
    }

    /// Run one job through the pipeline.
    pub fn process_job(&mut self, job: CaptureJob) -> AppResult<()> {
        let started = Instant::now();
        let path = job.frame_path.clone();

        match std::fs::metadata(&path) {
            Err(e) => {
                tracing::error!(frame = %path.display(), "Frame not found: {}", e);
                return Ok(());
            }
            Ok(meta) if meta.len() == 0 => {
                tracing::error!(frame = %path.display(), "Frame is empty");
                remove_frame(&path);
                return Ok(());
            }
            Ok(_) => {}
        }

        let frame = match self.pipeline.ingest(&job) {
            Ok(frame) => frame,
            Err(e) if e.is_frame_local() => {
                tracing::error!(frame = %path.display(), "Rejected frame: {}", e);
                remove_frame(&path);
                return Ok(());
            }
            Err(e) => {
                remove_frame(&path);
                return Err(e);
            }
        };

        remove_frame(&path);
        self.image_count += 1;

        self.pipeline.calibrate(self.settings.black_level)?;
        let brightness = self.pipeline.measure_brightness()?;
        let (adu, adu_average) = self
            .controller
            .recalculate_exposure(brightness, job.exposure_seconds);

        let values = self.state.snapshot();
        let target = self.controller.target();

        self.publish_status(&job, adu, adu_average);

        let metadata = ImageMetadata {
            kind: "image".to_string(),
            create_date: job.capture_started_at.timestamp(),
            exposure: job.exposure_seconds,
            exp_elapsed: job.capture_elapsed_s,
            gain: values.gain,
            binmode: values.binning,
            temp: values.sensor_slots[slot::SENSOR_TEMP],
            adu,
            stable: target.target_found,
            moonmode: values.moon_mode,
            night: values.night,
            process_elapsed: started.elapsed().as_secs_f64(),
            height: frame.height,
            width: frame.width,
        };
        self.persist(&job, &frame, &metadata);

        tracing::info!(
            image_count = self.image_count,
            adu,
            adu_average,
            next_exposure_s = values.exposure,
            "Frame processed"
        );
        Ok(())
    }

    fn publish_status(&self, job: &CaptureJob, adu: f64, adu_average: f64) {
        let Some(status_file) = &self.settings.status_file else {
            return;
        };

        let values = self.state.snapshot();
        let target = self.controller.target();
        let status = StatusDocument {
            device: self.settings.device_name.clone(),
            night: values.night,
            temp: values.sensor_slots[slot::SENSOR_TEMP],
            gain: values.gain,
            exposure: job.exposure_seconds,
            stable_exposure: target.target_found,
            target_adu: self.controller.target_adu(values.night),
            current_adu_target: target.current_adu_target,
            current_adu: adu,
            adu_average,
            time: chrono::Utc::now().timestamp(),
            latitude: self.settings.latitude,
            longitude: self.settings.longitude,
        };

        if let Err(e) = write_status(status_file, &status) {
            tracing::error!(path = %status_file.display(), "Failed to write status: {}", e);
        }
    }

    fn persist(&mut self, job: &CaptureJob, frame: &FrameRef, metadata: &ImageMetadata) {
        let Some(pixels) = self.pipeline.image() else {
            return;
        };

        let name = job.render_filename("png");
        let date_dir = job.capture_started_at.format("%Y%m%d").to_string();
        let path = self.settings.image_dir.join(date_dir).join(&name);

        if let Err(e) = save_image(&path, frame.width, frame.height, pixels) {
            tracing::error!(path = %path.display(), "Failed to save image: {}", e);
            return;
        }

        let entry = match self.store.record_image(&path, job.camera_id, metadata) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(path = %path.display(), "Failed to record image: {}", e);
                return;
            }
        };

        self.uploads.enqueue(UploadTask {
            entry_id: entry.id,
            local_path: path,
            remote_name: name,
        });
    }
}

fn remove_frame(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(frame = %path.display(), "Failed to delete frame: {}", e);
        }
    }
}
