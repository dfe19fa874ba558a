//! Capture queue -> orchestrator -> exposure controller, with real frames on disk.

use chrono::Utc;
use image::{GrayImage, Luma};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use sky_daq::camera::{CaptureJob, CaptureMessage};
use sky_daq::config::BrightnessConfig;
use sky_daq::exposure::AutoExposureController;
use sky_daq::orchestrator::{CaptureOrchestrator, OrchestratorSettings};
use sky_daq::pipeline::StandardPipeline;
use sky_daq::shutdown::ShutdownToken;
use sky_daq::state::{ControlValues, SharedControlState};
use sky_daq::storage::{JsonLinesStore, StatusDocument, UploadQueue, UploadTask};

struct Rig {
    dir: tempfile::TempDir,
    state: SharedControlState,
    orchestrator: CaptureOrchestrator,
    jobs: mpsc::Sender<CaptureMessage>,
    uploads: mpsc::Receiver<UploadTask>,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().unwrap();
    let state = SharedControlState::new(ControlValues {
        exposure: 1.0,
        exposure_min: 0.001,
        exposure_min_day: 0.0001,
        exposure_max: 15.0,
        night: true,
        ..ControlValues::default()
    });

    let settings = OrchestratorSettings {
        queue_wait: Duration::from_millis(50),
        black_level: 0,
        image_dir: dir.path().join("images"),
        status_file: Some(dir.path().join("status.json")),
        device_name: "test-sky".to_string(),
        latitude: 33.0,
        longitude: -84.0,
    };
    let (tx, rx) = mpsc::channel(8);
    let (uploads, upload_rx) = UploadQueue::channel(8);
    let orchestrator = CaptureOrchestrator::new(
        settings,
        state.clone(),
        AutoExposureController::new(BrightnessConfig::default(), state.clone()),
        Box::new(StandardPipeline::new()),
        Box::new(JsonLinesStore::open(dir.path().join("db")).unwrap()),
        uploads,
        rx,
    );

    Rig {
        dir,
        state,
        orchestrator,
        jobs: tx,
        uploads: upload_rx,
    }
}

fn gray_frame(dir: &Path, name: &str, value: u8) -> PathBuf {
    let path = dir.join(name);
    GrayImage::from_pixel(16, 12, Luma([value])).save(&path).unwrap();
    path
}

fn job(frame_path: PathBuf, exposure: f64) -> CaptureJob {
    CaptureJob {
        frame_path,
        exposure_seconds: exposure,
        capture_started_at: Utc::now(),
        capture_elapsed_s: exposure,
        camera_id: 1,
        filename_template: "ccd{camera_id}_{timestamp}.{ext}".to_string(),
    }
}

#[tokio::test]
async fn dark_frame_raises_exposure_and_publishes_everything() {
    let mut rig = rig();
    let frame = gray_frame(rig.dir.path(), "dark.png", 30);

    rig.orchestrator.process_job(job(frame.clone(), 1.0)).unwrap();

    // 1.0 - (1.0 - 1.0 * 75 / 30) = 2.5
    assert!((rig.state.exposure() - 2.5).abs() < 1e-9);
    assert!(!frame.exists(), "source frame is consumed");
    assert_eq!(rig.orchestrator.image_count(), 1);

    let status: StatusDocument =
        serde_json::from_str(&std::fs::read_to_string(rig.dir.path().join("status.json")).unwrap())
            .unwrap();
    assert_eq!(status.device, "test-sky");
    assert_eq!(status.current_adu, 30.0);
    assert_eq!(status.target_adu, 75.0);
    assert!(!status.stable_exposure);

    let index = std::fs::read_to_string(rig.dir.path().join("db/images.jsonl")).unwrap();
    assert_eq!(index.lines().count(), 1);

    let upload = rig.uploads.try_recv().unwrap();
    assert!(upload.local_path.exists());
    assert!(upload.local_path.starts_with(rig.dir.path().join("images")));
    assert!(upload.remote_name.starts_with("ccd1_"));
    assert!(upload.remote_name.ends_with(".png"));
}

#[tokio::test]
async fn in_band_frame_locks_exposure() {
    let mut rig = rig();
    let frame = gray_frame(rig.dir.path(), "good.png", 74);

    rig.orchestrator.process_job(job(frame, 1.0)).unwrap();

    assert_eq!(rig.state.exposure(), 1.0);
    let status: StatusDocument =
        serde_json::from_str(&std::fs::read_to_string(rig.dir.path().join("status.json")).unwrap())
            .unwrap();
    assert!(status.stable_exposure);
    assert_eq!(status.current_adu_target, 74.0);
}

#[tokio::test]
async fn unreadable_frames_are_dropped_without_side_effects() {
    let mut rig = rig();

    let garbage = rig.dir.path().join("garbage.jpg");
    std::fs::write(&garbage, b"definitely not a jpeg").unwrap();
    rig.orchestrator.process_job(job(garbage.clone(), 1.0)).unwrap();
    assert!(!garbage.exists());

    let empty = rig.dir.path().join("empty.jpg");
    std::fs::write(&empty, b"").unwrap();
    rig.orchestrator.process_job(job(empty.clone(), 1.0)).unwrap();
    assert!(!empty.exists());

    rig.orchestrator
        .process_job(job(rig.dir.path().join("missing.jpg"), 1.0))
        .unwrap();

    assert_eq!(rig.orchestrator.image_count(), 0);
    assert_eq!(rig.state.exposure(), 1.0);
    assert!(!rig.dir.path().join("status.json").exists());
    assert!(rig.uploads.try_recv().is_err());
}

#[tokio::test]
async fn queued_jobs_are_processed_in_order_until_stop() {
    let rig = rig();
    let Rig {
        dir,
        state,
        orchestrator,
        jobs,
        mut uploads,
    } = rig;

    // 30 -> 2.5s, then 60 at 2.5s -> 3.125s
    jobs.send(CaptureMessage::Job(job(gray_frame(dir.path(), "a.png", 30), 1.0)))
        .await
        .unwrap();
    jobs.send(CaptureMessage::Job(job(gray_frame(dir.path(), "b.png", 60), 2.5)))
        .await
        .unwrap();
    jobs.send(CaptureMessage::Stop).await.unwrap();
    let leftover = gray_frame(dir.path(), "c.png", 75);
    jobs.send(CaptureMessage::Job(job(leftover.clone(), 3.0)))
        .await
        .unwrap();

    let orchestrator = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(ShutdownToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(orchestrator.image_count(), 2);
    assert!((state.exposure() - 3.125).abs() < 1e-9);
    assert!(!leftover.exists(), "jobs behind the stop marker are discarded");
    assert!(uploads.try_recv().is_ok());
    assert!(uploads.try_recv().is_ok());
    assert!(uploads.try_recv().is_err());
}

#[tokio::test]
async fn frames_already_in_flight_are_corrected_from_their_own_exposure() {
    let rig = rig();
    let Rig {
        dir,
        state,
        orchestrator,
        jobs,
        uploads: _uploads,
    } = rig;

    // both exposed at 1.0s before the first correction landed
    for name in ["first.png", "second.png"] {
        jobs.send(CaptureMessage::Job(job(gray_frame(dir.path(), name, 30), 1.0)))
            .await
            .unwrap();
    }
    jobs.send(CaptureMessage::Stop).await.unwrap();

    let orchestrator = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(ShutdownToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(orchestrator.image_count(), 2);
    assert!((state.exposure() - 2.5).abs() < 1e-9);
}

#[tokio::test]
async fn idle_orchestrator_observes_shutdown() {
    let rig = rig();
    let shutdown = ShutdownToken::new();
    let handle = tokio::spawn(rig.orchestrator.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(120)).await;
    shutdown.cancel();

    let orchestrator = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(orchestrator.image_count(), 0);
    drop(rig.jobs);
}
