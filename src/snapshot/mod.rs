//! Still capture from the bound session.
//!
//! A capture merges per-call overrides over the configured defaults and the
//! active slot's resolution, pulls one frame from the sink, draws it onto a
//! surface (scale, mirror, rotate) and hands the surface to the
//! [`ImageEncoder`].

pub mod encode;
pub mod rotate;

pub use encode::{encode_bytes, ImageEncoder, ObjectUrlStore, UrlEncoder};
pub use rotate::{calc_rotation, fit_within, CaptureSurface, RotationParams};

use crate::connector::StreamConnector;
use crate::errors::CameraError;
use crate::events::{EventBus, LifecycleEvent};
use crate::slots::SlotTable;
use image::imageops;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Longest side of a thumbnail when no size is requested.
pub const THUMBNAIL_MAX_PIXEL: u32 = 1600;

/// Shape of the returned image reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "dataURL", alias = "dataurl")]
    DataUrl,
    #[serde(rename = "objectURL", alias = "objecturl")]
    ObjectUrl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

/// Encoder-facing subset of the capture options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOptions {
    pub data_type: DataType,
    pub image_format: ImageFormat,
    pub jpeg_quality: u8,
}

/// Resolved options for one capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapOptions {
    pub width: u32,
    pub height: u32,
    /// Degrees clockwise; unset means "use the slot's rotation".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate: Option<i32>,
    pub flip_horiz: bool,
    pub snap_delay_ms: u64,
    pub data_type: DataType,
    pub image_format: ImageFormat,
    pub jpeg_quality: u8,
}

impl Default for SnapOptions {
    fn default() -> Self {
        Self {
            width: 600,
            height: 400,
            rotate: None,
            flip_horiz: false,
            snap_delay_ms: 0,
            data_type: DataType::DataUrl,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 97,
        }
    }
}

impl SnapOptions {
    pub fn image_options(&self) -> ImageOptions {
        ImageOptions {
            data_type: self.data_type,
            image_format: self.image_format,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

/// Per-call overrides; unset fields keep the merged default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub rotate: Option<i32>,
    pub flip_horiz: Option<bool>,
    pub snap_delay_ms: Option<u64>,
    pub data_type: Option<DataType>,
    pub image_format: Option<ImageFormat>,
    pub jpeg_quality: Option<u8>,
}

impl SnapOverrides {
    pub fn apply(&self, options: &mut SnapOptions) {
        if let Some(width) = self.width {
            options.width = width;
        }
        if let Some(height) = self.height {
            options.height = height;
        }
        if self.rotate.is_some() {
            options.rotate = self.rotate;
        }
        if let Some(flip) = self.flip_horiz {
            options.flip_horiz = flip;
        }
        if let Some(delay) = self.snap_delay_ms {
            options.snap_delay_ms = delay;
        }
        if let Some(data_type) = self.data_type {
            options.data_type = data_type;
        }
        if let Some(format) = self.image_format {
            options.image_format = format;
        }
        if let Some(quality) = self.jpeg_quality {
            options.jpeg_quality = quality;
        }
    }

    pub fn rotate(mut self, rotate: i32) -> Self {
        self.rotate = Some(rotate);
        self
    }

    pub fn delay_ms(mut self, delay: u64) -> Self {
        self.snap_delay_ms = Some(delay);
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = Some(data_type);
        self
    }
}

/// Thumbnail options. Without a size the source is fit within
/// [`THUMBNAIL_MAX_PIXEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImgOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub data_type: DataType,
    pub image_format: ImageFormat,
    pub jpeg_quality: u8,
}

impl Default for ImgOptions {
    fn default() -> Self {
        Self {
            width: Some(400),
            height: Some(300),
            data_type: DataType::DataUrl,
            image_format: ImageFormat::Jpeg,
            jpeg_quality: 90,
        }
    }
}

/// Result of a capture
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCapture {
    pub url: String,
    pub options: SnapOptions,
    /// Surface size after rotation
    pub width: u32,
    pub height: u32,
}

pub struct SnapshotPipeline {
    connector: Arc<StreamConnector>,
    slots: Arc<SlotTable>,
    encoder: Arc<dyn ImageEncoder>,
    bus: Arc<EventBus>,
    defaults: SnapOptions,
    timeout: Duration,
}

impl SnapshotPipeline {
    pub fn new(
        connector: Arc<StreamConnector>,
        slots: Arc<SlotTable>,
        encoder: Arc<dyn ImageEncoder>,
        bus: Arc<EventBus>,
        defaults: SnapOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            slots,
            encoder,
            bus,
            defaults,
            timeout,
        }
    }

    pub fn defaults(&self) -> &SnapOptions {
        &self.defaults
    }

    pub fn encoder(&self) -> &Arc<dyn ImageEncoder> {
        &self.encoder
    }

    /// Take a still from the bound session. Failures are returned and
    /// mirrored as `exception` events.
    pub async fn capture(&self, overrides: Option<SnapOverrides>) -> Result<ImageCapture, CameraError> {
        let result = self.take(overrides).await;
        if let Err(e) = &result {
            log::error!("Capture failed: {}", e);
            self.bus.publish(LifecycleEvent::exception(e.clone()));
        }
        result
    }

    /// Options a capture with `overrides` would use right now.
    pub async fn resolve_options(&self, overrides: Option<&SnapOverrides>) -> SnapOptions {
        let slot = self.slots.get(self.connector.current_index()).await;
        let mut options = self.defaults.clone();
        if let Some(slot) = &slot {
            options.width = slot.config.width;
            options.height = slot.config.height;
        }
        if let Some(overrides) = overrides {
            overrides.apply(&mut options);
        }
        if options.rotate.is_none() {
            options.rotate = Some(slot.map(|s| s.rotate()).unwrap_or(0));
        }
        options
    }

    async fn take(&self, overrides: Option<SnapOverrides>) -> Result<ImageCapture, CameraError> {
        let options = self.resolve_options(overrides.as_ref()).await;
        let sink = self.connector.sink().clone();
        if !sink.has_session() {
            return Err(CameraError::CaptureFailed("no active stream".to_string()));
        }

        let delay = Duration::from_millis(options.snap_delay_ms);
        let pause = delay.is_zero();
        let budget = self.timeout + delay;

        match tokio::time::timeout(budget, self.draw_and_encode(&options)).await {
            Ok(result) => result,
            Err(_) => {
                if pause {
                    sink.play();
                }
                Err(CameraError::CaptureFailed(format!(
                    "timed out after {}ms",
                    budget.as_millis()
                )))
            }
        }
    }

    async fn draw_and_encode(&self, options: &SnapOptions) -> Result<ImageCapture, CameraError> {
        let sink = self.connector.sink().clone();
        let pause = options.snap_delay_ms == 0;

        if pause {
            // Freeze on a frame pulled now, not whatever the sink last held.
            sink.current_frame()
                .await
                .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
            sink.pause();
        } else {
            tokio::time::sleep(Duration::from_millis(options.snap_delay_ms)).await;
        }

        let drawn = self.draw(options).await;
        if pause {
            sink.play();
        }
        let surface = drawn?;

        let encoder = self.encoder.clone();
        let image_options = options.image_options();
        let (width, height) = (surface.width(), surface.height());
        let url = tokio::task::spawn_blocking(move || encoder.encode(&surface, &image_options))
            .await
            .map_err(|e| CameraError::EncodingError(format!("Task join error: {}", e)))??;

        log::info!("Captured {}x{} still", width, height);
        Ok(ImageCapture {
            url,
            options: options.clone(),
            width,
            height,
        })
    }

    async fn draw(&self, options: &SnapOptions) -> Result<CaptureSurface, CameraError> {
        let frame = self
            .connector
            .sink()
            .current_frame()
            .await
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))?;

        let (width, height, flip) = (options.width, options.height, options.flip_horiz);
        let rotate = options.rotate.unwrap_or(0);
        let surface = tokio::task::spawn_blocking(move || {
            CaptureSurface::draw(&frame, width, height, flip).map(|s| s.rotated(rotate))
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("Task join error: {}", e)))??;

        let expected = calc_rotation(width, height, rotate);
        crate::check_invariant!(
            surface.width() == expected.width && surface.height() == expected.height,
            "capture surface matches post-rotation size",
            "snapshot::draw"
        );
        Ok(surface)
    }

    /// Resample an image reference produced earlier.
    pub async fn thumbnail(&self, url: &str, options: ImgOptions) -> Result<String, CameraError> {
        let encoder = self.encoder.clone();
        let url = url.to_string();
        let task = tokio::task::spawn_blocking(move || -> Result<String, CameraError> {
            let source = encoder.decode(&url)?;
            let (width, height) = match (options.width, options.height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                _ => fit_within(source.width(), source.height(), THUMBNAIL_MAX_PIXEL),
            };
            let resized = imageops::resize(&source, width, height, imageops::FilterType::Triangle);
            encoder.encode(
                &CaptureSurface::from_image(resized),
                &ImageOptions {
                    data_type: options.data_type,
                    image_format: options.image_format,
                    jpeg_quality: options.jpeg_quality,
                },
            )
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => {
                joined.map_err(|e| CameraError::EncodingError(format!("Task join error: {}", e)))?
            }
            Err(_) => Err(CameraError::EncodingError(format!(
                "thumbnail timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}
