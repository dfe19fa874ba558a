//! Full worker set against a scripted capture tool, start to clean shutdown.
#![cfg(unix)]

use image::{GrayImage, Luma};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sky_daq::config::SkyConfig;
use sky_daq::supervisor::{Supervisor, SupervisorState};

/// Capture tool that touches `marker`, waits `delay` seconds, then copies a
/// gray frame to its `--output` path.
fn fake_still(dir: &Path, delay: &str, marker: &Path) -> PathBuf {
    let source = dir.join("sky.png");
    GrayImage::from_pixel(32, 24, Luma([40])).save(&source).unwrap();

    let tool = dir.join("fake-still");
    let script = format!(
        "#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"--output\" ]; then out=\"$2\"; fi\n  shift\ndone\ntouch \"{}\"\nsleep {}\ncp \"{}\" \"$out\"\n",
        marker.display(),
        delay,
        source.display()
    );
    std::fs::write(&tool, script).unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    tool
}

fn config_for(dir: &Path, tool: &Path, period_s: f64) -> SkyConfig {
    let data = dir.join("data");
    let frames = dir.join("frames");
    std::fs::create_dir_all(&frames).unwrap();

    let mut config = SkyConfig::default();
    config.application.data_dir = data.clone();
    config.application.status_file = Some(data.join("status.json"));
    config.camera.command = tool.to_string_lossy().into_owned();
    config.camera.image_file_type = "png".to_string();
    config.camera.temp_dir = Some(frames);
    config.camera.exposure_period_s = period_s;
    config.camera.exposure_period_day_s = period_s;
    config.camera.poll_interval_ms = 20;
    config.orchestrator.queue_wait_ms = 50;
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn frames_flow_to_store_and_uploads_then_shutdown_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    let data = dir.path().join("data");
    let tool = fake_still(dir.path(), "0.05", &dir.path().join("started"));
    let config = config_for(dir.path(), &tool, 0.2);

    let mut supervisor = Supervisor::start(&config).unwrap();
    let mut uploads = supervisor.take_upload_receiver().unwrap();
    assert!(supervisor.take_upload_receiver().is_none());

    let first = tokio::time::timeout(Duration::from_secs(10), uploads.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.local_path.exists());
    assert!(first.remote_name.starts_with("ccd1_"));

    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert!(supervisor.shutdown_token().is_cancelled());

    let index = std::fs::read_to_string(data.join("images.jsonl")).unwrap();
    assert!(index.lines().count() >= 1);
    assert!(data.join("status.json").exists());

    // a dark sky pushes exposure up from the sensor minimum
    assert!(supervisor.control_state().exposure() > 0.001);

    let leftovers: Vec<_> = std::fs::read_dir(&frames).unwrap().collect();
    assert!(leftovers.is_empty(), "in-flight frames are consumed or removed");
}

#[tokio::test]
async fn shutdown_mid_exposure_still_processes_the_last_frame() {
    let dir = tempfile::tempdir().unwrap();
    let frames = dir.path().join("frames");
    let data = dir.path().join("data");
    let started = dir.path().join("started");
    let tool = fake_still(dir.path(), "1", &started);
    let config = config_for(dir.path(), &tool, 600.0);

    let mut supervisor = Supervisor::start(&config).unwrap();
    let mut uploads = supervisor.take_upload_receiver().unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while !started.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    supervisor.shutdown().await.unwrap();
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let upload = uploads.try_recv().unwrap();
    assert!(upload.local_path.exists());
    assert!(uploads.try_recv().is_err());

    let index = std::fs::read_to_string(data.join("images.jsonl")).unwrap();
    assert_eq!(index.lines().count(), 1);

    let leftovers: Vec<_> = std::fs::read_dir(&frames).unwrap().collect();
    assert!(leftovers.is_empty());
}
