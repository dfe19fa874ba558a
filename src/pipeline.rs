//! Image processing collaborator.
//!
//! The orchestrator only sees the [`ImagePipeline`] contract and calls it in a
//! fixed order: `ingest`, `calibrate`, `measure_brightness`, then `image`.
//! [`StandardPipeline`] is a small decoder-backed implementation good enough
//! to close the exposure loop; heavier processing plugs in behind the trait.

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::camera::CaptureJob;
use crate::error::{AppResult, DaqError};

/// Pixel data in its native depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mean pixel value projected onto 0-255.
    pub fn mean_8bit(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        match self {
            PixelBuffer::U8(data) => {
                let sum: u64 = data.iter().map(|&v| u64::from(v)).sum();
                sum as f64 / data.len() as f64
            }
            PixelBuffer::U16(data) => {
                let sum: u64 = data.iter().map(|&v| u64::from(v)).sum();
                sum as f64 / data.len() as f64 * 255.0 / 65_535.0
            }
        }
    }

    /// Subtract a black level, saturating at zero.
    fn subtract(&mut self, black_level: u32) {
        match self {
            PixelBuffer::U8(data) => {
                let bl = u8::try_from(black_level).unwrap_or(u8::MAX);
                data.iter_mut().for_each(|v| *v = v.saturating_sub(bl));
            }
            PixelBuffer::U16(data) => {
                let bl = u16::try_from(black_level).unwrap_or(u16::MAX);
                data.iter_mut().for_each(|v| *v = v.saturating_sub(bl));
            }
        }
    }
}

/// Handle to an ingested frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRef {
    /// Source frame on disk (deleted by the orchestrator after ingest)
    pub source: PathBuf,
    /// Exposure in seconds
    pub exposure: f64,
    /// Capture start
    pub capture_time: DateTime<Utc>,
    /// Capture duration in seconds
    pub elapsed: f64,
    /// Producing camera
    pub camera_id: i64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// External processing pipeline contract.
pub trait ImagePipeline: Send {
    /// Load a captured frame.
    ///
    /// # Errors
    ///
    /// `DaqError::BadImage` when the frame is unusable.
    fn ingest(&mut self, job: &CaptureJob) -> AppResult<FrameRef>;

    /// Apply calibration to the loaded frame.
    fn calibrate(&mut self, black_level: u32) -> AppResult<()>;

    /// Mean brightness of the calibrated frame in an 8-bit projection.
    fn measure_brightness(&self) -> AppResult<f64>;

    /// Pixels of the loaded frame.
    fn image(&self) -> Option<&PixelBuffer>;
}

/// Decoder-backed pipeline producing a single luma plane.
#[derive(Debug, Default)]
pub struct StandardPipeline {
    frame: Option<(FrameRef, PixelBuffer)>,
}

impl StandardPipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(job: &CaptureJob) -> AppResult<DynamicImage> {
        let bad = |e: &dyn std::fmt::Display| {
            DaqError::BadImage(format!("{}: {e}", job.frame_path.display()))
        };
        let reader = match ImageReader::open(&job.frame_path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(bad(&e)),
            Err(e) => return Err(e.into()),
        };
        reader
            .with_guessed_format()
            .map_err(|e| bad(&e))?
            .decode()
            .map_err(|e| bad(&e))
    }
}

impl ImagePipeline for StandardPipeline {
    fn ingest(&mut self, job: &CaptureJob) -> AppResult<FrameRef> {
        self.frame = None;
        let img = Self::decode(job)?;

        let (width, height) = (img.width(), img.height());
        if width == 0 || height == 0 {
            return Err(DaqError::BadImage(format!(
                "{}: zero-sized image",
                job.frame_path.display()
            )));
        }

        let pixels = match &img {
            DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba16(_) => PixelBuffer::U16(img.to_luma16().into_raw()),
            _ => PixelBuffer::U8(img.to_luma8().into_raw()),
        };

        let frame = FrameRef {
            source: job.frame_path.clone(),
            exposure: job.exposure_seconds,
            capture_time: job.capture_started_at,
            elapsed: job.capture_elapsed_s,
            camera_id: job.camera_id,
            width,
            height,
        };
        tracing::debug!(width, height, "Frame ingested");
        self.frame = Some((frame.clone(), pixels));
        Ok(frame)
    }

    fn calibrate(&mut self, black_level: u32) -> AppResult<()> {
        let (_, pixels) = self
            .frame
            .as_mut()
            .ok_or_else(|| DaqError::Processing("calibrate called before ingest".into()))?;
        if black_level > 0 {
            pixels.subtract(black_level);
        }
        Ok(())
    }

    fn measure_brightness(&self) -> AppResult<f64> {
        self.frame
            .as_ref()
            .map(|(_, pixels)| pixels.mean_8bit())
            .ok_or_else(|| DaqError::Processing("no frame loaded".into()))
    }

    fn image(&self) -> Option<&PixelBuffer> {
        self.frame.as_ref().map(|(_, pixels)| pixels)
    }
}
