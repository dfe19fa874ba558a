//! Camera adapter against a scripted stand-in for the capture tool.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use sky_daq::camera::libcamera::ImageFileType;
use sky_daq::camera::{
    profile, CameraAdapter, CaptureDevice, CaptureMessage, CaptureSettings, ExposureState,
    PollStatus,
};
use sky_daq::error::DaqError;
use sky_daq::state::SharedControlState;

/// Scripts are written and executed under this lock so no other test forks
/// while a script is still open for writing.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

struct FakeTool {
    sleep_s: f64,
    exit_code: i32,
    write_frame: bool,
    stderr_line: Option<&'static str>,
}

impl FakeTool {
    fn install(&self, dir: &Path) -> PathBuf {
        let path = dir.join("fake-still");
        let mut script = String::from(
            "#!/bin/sh\nout=\"\"\nall=\"$*\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--output\" ]; then out=\"$2\"; fi\n  shift\ndone\n",
        );
        script.push_str(&format!("sleep {}\n", self.sleep_s));
        if self.write_frame {
            script.push_str("echo \"$all\" > \"$out\"\n");
        }
        if let Some(line) = self.stderr_line {
            script.push_str(&format!("echo \"{line}\" >&2\n"));
        }
        script.push_str(&format!("exit {}\n", self.exit_code));

        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}

fn adapter(
    tool: &Path,
    frames: &Path,
) -> (CameraAdapter, mpsc::Receiver<CaptureMessage>) {
    let settings = CaptureSettings {
        command: tool.to_string_lossy().into_owned(),
        file_type: ImageFileType::Jpg,
        quality: 95,
        extra_options: vec!["--hflip".to_string()],
        temp_dir: frames.to_path_buf(),
        camera_id: 7,
        filename_template: "ccd{camera_id}_{timestamp}.{ext}".to_string(),
    };
    let (tx, rx) = mpsc::channel(4);
    let profile = profile::lookup("imx477").unwrap();
    (
        CameraAdapter::new(profile, settings, SharedControlState::default(), tx),
        rx,
    )
}

async fn poll_until_ready(adapter: &mut CameraAdapter) {
    for _ in 0..250 {
        if adapter.poll_status().await.unwrap() == PollStatus::Ready {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("capture never completed");
}

fn expect_job(rx: &mut mpsc::Receiver<CaptureMessage>) -> sky_daq::camera::CaptureJob {
    match rx.try_recv() {
        Ok(CaptureMessage::Job(job)) => job,
        other => panic!("expected a job, got {other:?}"),
    }
}

#[tokio::test]
async fn start_while_exposing_is_a_no_op() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let tool = FakeTool {
        sleep_s: 0.5,
        exit_code: 0,
        write_frame: true,
        stderr_line: None,
    }
    .install(dir.path());
    let (mut adapter, mut rx) = adapter(&tool, dir.path());

    adapter.start_exposure(1.5).await.unwrap();
    assert_eq!(adapter.state(), ExposureState::Exposing);
    let first = adapter.in_flight_path().unwrap().to_path_buf();

    adapter.start_exposure(3.0).await.unwrap();
    assert_eq!(adapter.in_flight_path().unwrap(), first);
    assert_eq!(adapter.poll_status().await.unwrap(), PollStatus::Busy);

    poll_until_ready(&mut adapter).await;
    let job = expect_job(&mut rx);
    assert_eq!(job.frame_path, first);
    assert_eq!(job.exposure_seconds, 1.5);
    assert_eq!(job.camera_id, 7);
    assert!(job.capture_elapsed_s >= 0.4);

    let args = std::fs::read_to_string(&job.frame_path).unwrap();
    assert!(args.contains("--encoding jpg --quality 95"));
    assert!(args.contains("--gain 1 --shutter 1500000 --hflip --output"));

    // later polls stay ready without new jobs
    assert_eq!(adapter.poll_status().await.unwrap(), PollStatus::Ready);
    assert!(rx.try_recv().is_err());
    assert_eq!(adapter.state(), ExposureState::Idle);
}

#[tokio::test]
async fn nonzero_exit_still_yields_ready_and_job() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let tool = FakeTool {
        sleep_s: 0.0,
        exit_code: 3,
        write_frame: false,
        stderr_line: Some("ERROR: no cameras available"),
    }
    .install(dir.path());
    let (mut adapter, mut rx) = adapter(&tool, dir.path());

    adapter.start_exposure(0.5).await.unwrap();
    poll_until_ready(&mut adapter).await;

    let job = expect_job(&mut rx);
    let size = std::fs::metadata(&job.frame_path).unwrap().len();
    assert_eq!(size, 0, "failed capture leaves an empty frame");
}

#[tokio::test]
async fn sync_wait_times_out_and_leaves_process_running() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let tool = FakeTool {
        sleep_s: 1.0,
        exit_code: 0,
        write_frame: true,
        stderr_line: None,
    }
    .install(dir.path());
    let (mut adapter, mut rx) = adapter(&tool, dir.path());

    let err = adapter
        .start_exposure_sync(1.0, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::Timeout { .. }));
    assert_eq!(adapter.state(), ExposureState::Exposing);
    assert!(rx.try_recv().is_err());

    poll_until_ready(&mut adapter).await;
    let job = expect_job(&mut rx);
    assert!(std::fs::metadata(&job.frame_path).unwrap().len() > 0);
}

#[tokio::test]
async fn sync_wait_emits_job_on_completion() {
    let _guard = SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();
    let tool = FakeTool {
        sleep_s: 0.1,
        exit_code: 0,
        write_frame: true,
        stderr_line: None,
    }
    .install(dir.path());
    let (mut adapter, mut rx) = adapter(&tool, dir.path());

    adapter
        .start_exposure_sync(0.25, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(adapter.state(), ExposureState::Idle);
    let job = expect_job(&mut rx);
    assert_eq!(job.exposure_seconds, 0.25);
}
