//! Worker supervision.
//!
//! Each worker runs as its own task wrapped by [`run_supervised`]. An error or
//! panic escaping a worker is serialized into an [`ErrorReport`], pushed onto
//! the error queue, and then propagated so the worker terminates. The
//! [`Supervisor`] reacts to the first report by shutting everything down;
//! restarting is left to the service manager.
//!
//! Shutdown order: the capture scheduler finishes any in-flight exposure, the
//! orchestrator gets a stop message queued behind that last frame, and every
//! worker is awaited within the shutdown timeout. The orchestrator listens on
//! its own token, which is cancelled only when the stop message cannot be
//! delivered.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::actuator::ActuatorController;
use crate::astro::NightDetector;
use crate::camera::{
    CameraAdapter, CaptureMessage, CaptureScheduler, CaptureSettings, SchedulerSettings,
};
use crate::config::SkyConfig;
use crate::devices::DeviceRegistry;
use crate::error::{AppResult, DaqError};
use crate::exposure::AutoExposureController;
use crate::orchestrator::{CaptureOrchestrator, OrchestratorSettings};
use crate::pipeline::StandardPipeline;
use crate::shutdown::ShutdownToken;
use crate::state::SharedControlState;
use crate::storage::{JsonLinesStore, UploadQueue, UploadTask};

/// Capacity of the error queue.
const ERROR_QUEUE_CAPACITY: usize = 16;
/// Capacity of the upload queue.
const UPLOAD_QUEUE_CAPACITY: usize = 64;
/// Added to the longest exposure to bound shutdown.
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(60);

/// Failure report sent by a terminating worker.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Worker name
    pub worker: String,
    /// Error message or panic payload
    pub message: String,
    /// Captured backtrace
    pub stack_trace: String,
    /// When the failure was caught
    pub at: DateTime<Utc>,
}

impl ErrorReport {
    /// Report for an error returned by a worker.
    pub fn from_error(worker: &str, err: &DaqError) -> Self {
        Self::new(worker, err.to_string())
    }

    /// Report for a panic payload.
    pub fn from_panic(worker: &str, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(worker, format!("panicked: {message}"))
    }

    fn new(worker: &str, message: String) -> Self {
        Self {
            worker: worker.to_string(),
            message,
            stack_trace: Backtrace::force_capture().to_string(),
            at: Utc::now(),
        }
    }
}

/// Sending half of the error queue.
#[derive(Debug, Clone)]
pub struct ErrorQueue {
    tx: mpsc::Sender<ErrorReport>,
}

impl ErrorQueue {
    /// Bounded queue and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ErrorReport>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Push a report without waiting.
    pub fn report(&self, report: ErrorReport) {
        if let Err(e) = self.tx.try_send(report) {
            tracing::error!("Could not queue error report: {}", e);
        }
    }
}

/// Run a worker body, reporting anything that escapes it.
///
/// Errors are reported and returned. Panics are reported and resumed.
pub async fn run_supervised<F, T>(worker: &str, errors: &ErrorQueue, body: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::error!(worker, "Worker failed: {}", e);
            errors.report(ErrorReport::from_error(worker, &e));
            Err(e)
        }
        Err(payload) => {
            let report = ErrorReport::from_panic(worker, payload.as_ref());
            tracing::error!(worker, "Worker {}", report.message);
            errors.report(report);
            std::panic::resume_unwind(payload)
        }
    }
}

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Workers running
    Running,
    /// Shutdown in progress
    ShuttingDown,
    /// All workers stopped
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<AppResult<()>>,
}

/// Owns every worker task and the shutdown sequence.
pub struct Supervisor {
    state: SupervisorState,
    shutdown: ShutdownToken,
    orchestrator_stop: ShutdownToken,
    shutdown_timeout: Duration,
    scheduler: Option<Worker>,
    workers: Vec<Worker>,
    monitor: Option<JoinHandle<usize>>,
    capture_tx: mpsc::Sender<CaptureMessage>,
    upload_rx: Option<mpsc::Receiver<UploadTask>>,
    control: SharedControlState,
}

impl Supervisor {
    /// Build every component from configuration and start the workers.
    ///
    /// Devices and the camera profile are resolved before anything is spawned,
    /// so configuration problems fail here.
    pub fn start(config: &SkyConfig) -> AppResult<Self> {
        let profile = config.camera_profile()?;
        let capture_settings = CaptureSettings::from_config(&config.camera)?;
        let devices = DeviceRegistry::new().build(config)?;
        let store = JsonLinesStore::open(&config.application.data_dir)?;

        let control = SharedControlState::from_config(config, profile);
        let shutdown = ShutdownToken::new();
        let orchestrator_stop = ShutdownToken::new();
        let (errors, error_rx) = ErrorQueue::channel(ERROR_QUEUE_CAPACITY);
        let (capture_tx, capture_rx) = mpsc::channel(config.orchestrator.queue_capacity.max(1));
        let (uploads, upload_rx) = UploadQueue::channel(UPLOAD_QUEUE_CAPACITY);

        let adapter = CameraAdapter::new(profile, capture_settings, control.clone(), capture_tx.clone());
        let detector = NightDetector::from_config(&config.location);
        let scheduler = CaptureScheduler::new(
            adapter,
            control.clone(),
            SchedulerSettings::from_config(&config.camera),
            Box::new(move |at| detector.is_night(at)),
        );

        let orchestrator = CaptureOrchestrator::new(
            OrchestratorSettings::from_config(config),
            control.clone(),
            AutoExposureController::new(config.brightness.clone(), control.clone()),
            Box::new(StandardPipeline::new()),
            Box::new(store),
            uploads,
            capture_rx,
        );

        let actuator = ActuatorController::new(config.dew_heater.clone(), control.clone(), devices);

        let scheduler = spawn_worker("capture_scheduler", &errors, scheduler.run(shutdown.clone()));
        let workers = vec![
            spawn_worker(
                "capture_orchestrator",
                &errors,
                orchestrator.run(orchestrator_stop.clone()).map(|r| r.map(|_| ())),
            ),
            spawn_worker("dew_heater", &errors, actuator.run(shutdown.clone())),
        ];
        let monitor = tokio::spawn(monitor_errors(error_rx, shutdown.clone()));

        let shutdown_timeout =
            Duration::from_secs_f64(control.snapshot().exposure_max) + SHUTDOWN_MARGIN;

        tracing::info!(
            camera = profile.name,
            camera_id = config.camera.camera_id,
            ?shutdown_timeout,
            "Supervisor running"
        );

        Ok(Self {
            state: SupervisorState::Running,
            shutdown,
            orchestrator_stop,
            shutdown_timeout,
            scheduler: Some(scheduler),
            workers,
            monitor: Some(monitor),
            capture_tx,
            upload_rx: Some(upload_rx),
            control,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Token that starts the shutdown sequence when cancelled.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Shared control state, for reporting.
    pub fn control_state(&self) -> SharedControlState {
        self.control.clone()
    }

    /// Hand the upload queue's receiving end to an uploader.
    pub fn take_upload_receiver(&mut self) -> Option<mpsc::Receiver<UploadTask>> {
        self.upload_rx.take()
    }

    /// Wait for shutdown (signal or worker failure), then stop everything.
    pub async fn wait(&mut self) -> AppResult<()> {
        self.shutdown.cancelled().await;
        self.shutdown().await
    }

    /// Stop all workers.
    ///
    /// # Errors
    ///
    /// `DaqError::ShutdownFailed` with every worker failure and timeout.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        if self.state == SupervisorState::Stopped {
            return Ok(());
        }
        self.state = SupervisorState::ShuttingDown;
        self.shutdown.cancel();
        tracing::info!(timeout = ?self.shutdown_timeout, "Starting shutdown sequence");

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let mut failures = Vec::new();

        if let Some(scheduler) = self.scheduler.take() {
            if let Err(e) = join_worker(scheduler, deadline).await {
                failures.push(e);
            }
        }

        match tokio::time::timeout_at(deadline, self.capture_tx.send(CaptureMessage::Stop)).await {
            Ok(Ok(())) => tracing::debug!("Stop queued for orchestrator"),
            Ok(Err(_)) => self.orchestrator_stop.cancel(),
            Err(_) => {
                tracing::warn!("Capture queue full at shutdown, cancelling orchestrator");
                self.orchestrator_stop.cancel();
            }
        }

        for worker in self.workers.drain(..) {
            if let Err(e) = join_worker(worker, deadline).await {
                failures.push(e);
            }
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }

        self.state = SupervisorState::Stopped;
        if failures.is_empty() {
            tracing::info!("Shutdown complete");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }
}

fn spawn_worker<F>(name: &'static str, errors: &ErrorQueue, body: F) -> Worker
where
    F: Future<Output = AppResult<()>> + Send + 'static,
{
    let errors = errors.clone();
    let handle = tokio::spawn(async move { run_supervised(name, &errors, body).await });
    Worker { name, handle }
}

async fn join_worker(worker: Worker, deadline: tokio::time::Instant) -> AppResult<()> {
    let Worker { name, mut handle } = worker;
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(Ok(()))) => {
            tracing::debug!(worker = name, "Worker stopped");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(DaqError::WorkerFailed {
            worker: name.to_string(),
            message: e.to_string(),
        }),
        Ok(Err(join_err)) => Err(DaqError::WorkerFailed {
            worker: name.to_string(),
            message: join_err.to_string(),
        }),
        Err(_) => {
            handle.abort();
            tracing::error!(worker = name, "Worker did not stop in time, aborted");
            Err(DaqError::WorkerFailed {
                worker: name.to_string(),
                message: "shutdown timeout".to_string(),
            })
        }
    }
}

/// Log every report and trigger shutdown on the first one.
async fn monitor_errors(mut rx: mpsc::Receiver<ErrorReport>, shutdown: ShutdownToken) -> usize {
    let mut count = 0;
    while let Some(report) = rx.recv().await {
        count += 1;
        tracing::error!(
            worker = %report.worker,
            at = %report.at,
            stack = %report.stack_trace,
            "{}",
            report.message
        );
        shutdown.cancel();
    }
    count
}
