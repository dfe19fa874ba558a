//! Downstream collaborators of the orchestrator.
//!
//! - [`ImageStore`]: persistence entry creation. [`JsonLinesStore`] appends one
//!   JSON record per image to an index file.
//! - [`UploadQueue`]: non-blocking hand-off of finished images to an uploader.
//! - [`write_status`]: atomically replaced status document for dashboards.

use chrono::{DateTime, Utc};
use image::{ImageBuffer, ImageFormat, Luma};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{AppResult, DaqError};
use crate::pipeline::PixelBuffer;

/// Metadata attached to a persisted image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Record type
    #[serde(rename = "type")]
    pub kind: String,
    /// Capture start, unix seconds
    #[serde(rename = "createDate")]
    pub create_date: i64,
    /// Exposure in seconds
    pub exposure: f64,
    /// Capture duration in seconds
    pub exp_elapsed: f64,
    /// Gain at capture
    pub gain: i64,
    /// Binning at capture
    pub binmode: u32,
    /// Sensor temperature
    pub temp: f64,
    /// Measured brightness
    pub adu: f64,
    /// Auto-exposure was locked
    pub stable: bool,
    /// Moon-mode
    pub moonmode: bool,
    /// Night mode
    pub night: bool,
    /// Seconds spent processing
    pub process_elapsed: f64,
    /// Height in pixels
    pub height: u32,
    /// Width in pixels
    pub width: u32,
}

/// Record returned by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Entry id
    pub id: Uuid,
    /// Persisted image path
    pub path: PathBuf,
    /// Producing camera
    pub camera_id: i64,
    /// When the entry was created
    pub recorded_at: DateTime<Utc>,
    /// Image metadata
    pub metadata: ImageMetadata,
}

/// Persistence collaborator.
pub trait ImageStore: Send {
    /// Create an entry for a persisted image.
    fn record_image(
        &mut self,
        path: &Path,
        camera_id: i64,
        metadata: &ImageMetadata,
    ) -> AppResult<ImageEntry>;
}

/// Appends entries to `<dir>/images.jsonl`.
#[derive(Debug)]
pub struct JsonLinesStore {
    index: PathBuf,
}

impl JsonLinesStore {
    /// Store rooted at `dir`, created if missing.
    pub fn open<P: AsRef<Path>>(dir: P) -> AppResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            index: dir.as_ref().join("images.jsonl"),
        })
    }

    /// Index file path.
    pub fn index_path(&self) -> &Path {
        &self.index
    }
}

impl ImageStore for JsonLinesStore {
    fn record_image(
        &mut self,
        path: &Path,
        camera_id: i64,
        metadata: &ImageMetadata,
    ) -> AppResult<ImageEntry> {
        let entry = ImageEntry {
            id: Uuid::new_v4(),
            path: path.to_path_buf(),
            camera_id,
            recorded_at: Utc::now(),
            metadata: metadata.clone(),
        };

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index)?
            .write_all(line.as_bytes())?;

        Ok(entry)
    }
}

/// Write a processed frame as PNG, creating parent directories.
pub fn save_image(path: &Path, width: u32, height: u32, pixels: &PixelBuffer) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mismatch = || DaqError::Processing(format!("pixel count does not match {width}x{height}"));

    let result = match pixels {
        PixelBuffer::U8(data) => ImageBuffer::<Luma<u8>, _>::from_raw(width, height, data.clone())
            .ok_or_else(mismatch)?
            .save_with_format(path, ImageFormat::Png),
        PixelBuffer::U16(data) => {
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, data.clone())
                .ok_or_else(mismatch)?
                .save_with_format(path, ImageFormat::Png)
        }
    };
    result.map_err(|e| DaqError::Processing(format!("failed to save {}: {e}", path.display())))
}

/// Upload work item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    /// Store entry the image belongs to
    pub entry_id: Uuid,
    /// File to transfer
    pub local_path: PathBuf,
    /// Name on the remote side
    pub remote_name: String,
}

/// Sending half of the upload channel.
#[derive(Debug, Clone)]
pub struct UploadQueue {
    tx: mpsc::Sender<UploadTask>,
}

impl UploadQueue {
    /// Bounded queue and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<UploadTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a task without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, task: UploadTask) -> bool {
        match self.tx.try_send(task) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(path = %task.local_path.display(), "Upload queue full, dropping task");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Upload queue closed");
                false
            }
        }
    }
}

/// Status document published after each frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    /// Application name
    pub device: String,
    /// Night mode
    pub night: bool,
    /// Sensor temperature
    pub temp: f64,
    /// Gain
    pub gain: i64,
    /// Exposure of the processed frame
    pub exposure: f64,
    /// Auto-exposure was locked
    pub stable_exposure: bool,
    /// Configured target for the active mode
    pub target_adu: f64,
    /// Brightness the controller locked on
    pub current_adu_target: f64,
    /// Measured brightness
    pub current_adu: f64,
    /// Rolling average (0 while searching)
    pub adu_average: f64,
    /// Unix seconds
    pub time: i64,
    /// Site latitude
    pub latitude: f64,
    /// Site longitude
    pub longitude: f64,
}

/// Replace `path` with `status` atomically.
pub fn write_status(path: &Path, status: &StatusDocument) -> AppResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, status)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path).map_err(|e| DaqError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ImageMetadata {
        ImageMetadata {
            kind: "image".into(),
            create_date: 1_700_000_000,
            exposure: 1.5,
            exp_elapsed: 1.7,
            gain: 8,
            binmode: 1,
            temp: 21.5,
            adu: 74.0,
            stable: true,
            moonmode: false,
            night: true,
            process_elapsed: 0.2,
            height: 10,
            width: 20,
        }
    }

    #[test]
    fn test_jsonl_store_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonLinesStore::open(dir.path().join("db")).unwrap();

        let a = store
            .record_image(Path::new("a.png"), 1, &metadata())
            .unwrap();
        let b = store
            .record_image(Path::new("b.png"), 1, &metadata())
            .unwrap();
        assert_ne!(a.id, b.id);

        let contents = std::fs::read_to_string(store.index_path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: ImageEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.path, PathBuf::from("b.png"));
        assert!(lines[0].contains("\"createDate\":1700000000"));
        assert!(lines[0].contains("\"type\":\"image\""));
    }

    #[test]
    fn test_save_image_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        assert!(save_image(&path, 4, 4, &PixelBuffer::U8(vec![0; 3])).is_err());

        save_image(&path, 2, 2, &PixelBuffer::U16(vec![0, 1, 2, 3])).unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_upload_queue_drops_when_full() {
        let (queue, mut rx) = UploadQueue::channel(1);
        let task = UploadTask {
            entry_id: Uuid::new_v4(),
            local_path: PathBuf::from("/tmp/a.png"),
            remote_name: "a.png".into(),
        };

        assert!(queue.enqueue(task.clone()));
        assert!(!queue.enqueue(task.clone()));
        assert_eq!(rx.recv().await.unwrap(), task);
    }

    #[test]
    fn test_write_status_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut status = StatusDocument {
            device: "sky_daq".into(),
            night: true,
            temp: 10.0,
            gain: 16,
            exposure: 2.0,
            stable_exposure: false,
            target_adu: 75.0,
            current_adu_target: 0.0,
            current_adu: 60.0,
            adu_average: 0.0,
            time: 0,
            latitude: 33.0,
            longitude: -84.0,
        };

        write_status(&path, &status).unwrap();
        status.exposure = 3.0;
        write_status(&path, &status).unwrap();

        let read: StatusDocument =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read.exposure, 3.0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
