//! Capture-complete queue payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A finished capture waiting to be processed.
///
/// Created by the camera adapter when the capture process exits, consumed
/// (and its frame file deleted) by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureJob {
    /// Frame written by the capture tool
    pub frame_path: PathBuf,
    /// Requested exposure in seconds
    pub exposure_seconds: f64,
    /// Wall-clock start of the exposure
    pub capture_started_at: DateTime<Utc>,
    /// Seconds from launch to observed exit
    pub capture_elapsed_s: f64,
    /// Camera that produced the frame
    pub camera_id: i64,
    /// Template for the persisted file name
    pub filename_template: String,
}

impl CaptureJob {
    /// Render the persisted file name from the template.
    ///
    /// Recognised placeholders: `{camera_id}`, `{timestamp}` (`%Y%m%d_%H%M%S`)
    /// and `{ext}`.
    pub fn render_filename(&self, ext: &str) -> String {
        self.filename_template
            .replace("{camera_id}", &self.camera_id.to_string())
            .replace(
                "{timestamp}",
                &self.capture_started_at.format("%Y%m%d_%H%M%S").to_string(),
            )
            .replace("{ext}", ext)
    }
}

/// Message carried on the capture-complete queue.
#[derive(Debug, Clone)]
pub enum CaptureMessage {
    /// Work item
    Job(CaptureJob),
    /// Stop after the current item
    Stop,
}
