//! sky_daq command-line interface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use sky_daq::camera::{profile, CameraAdapter, CaptureMessage, CaptureSettings};
use sky_daq::config::SkyConfig;
use sky_daq::devices::DeviceRegistry;
use sky_daq::logging;
use sky_daq::shutdown::spawn_signal_listener;
use sky_daq::state::SharedControlState;
use sky_daq::storage::UploadTask;
use sky_daq::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "sky_daq")]
#[command(about = "Closed-loop capture and control for an all-sky camera", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture, processing and dew heater loops until signalled
    Run {
        /// Configuration file
        #[arg(long, default_value = "config/sky_daq.toml")]
        config: PathBuf,
    },
    /// Load and validate a configuration, including device construction
    CheckConfig {
        /// Configuration file
        #[arg(long, default_value = "config/sky_daq.toml")]
        config: PathBuf,
        /// Also print the effective configuration (file plus environment) as TOML
        #[arg(long)]
        dump: bool,
    },
    /// List known camera profiles
    Profiles,
    /// Take one exposure synchronously and print the capture job
    Snap {
        /// Configuration file
        #[arg(long, default_value = "config/sky_daq.toml")]
        config: PathBuf,
        /// Exposure in seconds (defaults to the configured starting exposure)
        #[arg(long)]
        exposure: Option<f64>,
        /// Seconds to wait for the capture tool
        #[arg(long, default_value = "60")]
        timeout: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(config).await,
        Command::CheckConfig { config, dump } => check_config(config, dump),
        Command::Profiles => {
            print_profiles();
            Ok(())
        }
        Command::Snap {
            config,
            exposure,
            timeout,
        } => snap(config, exposure, timeout).await,
    }
}

fn load(path: &Path) -> Result<SkyConfig> {
    let config = SkyConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    let _ = logging::init(&config.application);
    Ok(config)
}

async fn run(path: PathBuf) -> Result<()> {
    let config = load(&path)?;
    tracing::info!(name = %config.application.name, "Starting");

    let mut supervisor = Supervisor::start(&config).context("starting workers")?;
    spawn_signal_listener(supervisor.shutdown_token());
    if let Some(rx) = supervisor.take_upload_receiver() {
        tokio::spawn(drain_uploads(rx));
    }

    supervisor.wait().await.context("shutting down")?;
    Ok(())
}

async fn drain_uploads(mut rx: mpsc::Receiver<UploadTask>) {
    while let Some(task) = rx.recv().await {
        tracing::info!(
            entry = %task.entry_id,
            path = %task.local_path.display(),
            remote = %task.remote_name,
            "Upload queued"
        );
    }
}

fn check_config(path: PathBuf, dump: bool) -> Result<()> {
    let config = load(&path)?;
    let profile = config.camera_profile()?;
    let devices = DeviceRegistry::new()
        .build(&config)
        .context("building devices")?;
    let limits = config.exposure.resolve(profile);

    println!("Configuration OK: {}", path.display());
    println!(
        "  Camera:     {} ({}x{}, {})",
        profile.name, profile.width, profile.height, config.camera.image_file_type
    );
    println!(
        "  Exposure:   {:.4}s - {:.4}s (day min {:.4}s)",
        limits.min_night, limits.max, limits.min_day
    );
    println!(
        "  Target ADU: {} +/- {} (day {} +/- {})",
        config.brightness.target_adu,
        config.brightness.adu_dev,
        config.brightness.target_adu_day,
        config.brightness.adu_dev_day
    );
    println!(
        "  Dew heater: {} (threshold control {})",
        devices.heater.name(),
        if config.dew_heater.threshold_enable {
            "on"
        } else {
            "off"
        }
    );
    for sensor in &devices.sensors {
        println!("  Sensor:     {} -> slot {}", sensor.name(), sensor.slot());
    }

    if dump {
        let effective = toml::to_string_pretty(&config).context("serializing configuration")?;
        println!();
        print!("{effective}");
    }
    Ok(())
}

fn print_profiles() {
    println!(
        "{:<8} {:>6} {:>6} {:>7} {:>9} {:>14} {:>5}",
        "name", "width", "height", "pixel", "gain", "exposure (s)", "cfa"
    );
    for p in profile::all() {
        println!(
            "{:<8} {:>6} {:>6} {:>6.2}u {:>4}-{:<4} {:>6}-{:<7} {:>5}",
            p.name,
            p.width,
            p.height,
            p.pixel_size_um,
            p.min_gain,
            p.max_gain,
            p.min_exposure,
            p.max_exposure,
            p.cfa.to_string()
        );
    }
}

async fn snap(path: PathBuf, exposure: Option<f64>, timeout: f64) -> Result<()> {
    let config = load(&path)?;
    let profile = config.camera_profile()?;
    let settings = CaptureSettings::from_config(&config.camera)?;
    let state = SharedControlState::from_config(&config, profile);
    let exposure = exposure.unwrap_or_else(|| state.exposure());

    let (tx, mut rx) = mpsc::channel(1);
    let mut adapter = CameraAdapter::new(profile, settings, state, tx);
    let camera = adapter.profile();
    let exposure = camera.clamp_exposure(exposure);
    tracing::info!(camera = camera.name, exposure_s = exposure, "Single capture");
    adapter
        .start_exposure_sync(exposure, Duration::from_secs_f64(timeout.max(0.0)))
        .await
        .context("capturing")?;

    match rx.recv().await {
        Some(CaptureMessage::Job(job)) => {
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        _ => anyhow::bail!("capture finished without producing a job"),
    }
}
