//! Real camera devices through nokhwa.

use crate::errors::{AcquireError, AcquireErrorKind, CameraError};
use crate::platform::{CapabilityProvider, CaptureSession};
use crate::types::{CameraFrame, DeviceId, DeviceRecord, Resolution, StreamConstraints};
use async_trait::async_trait;
use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    CallbackCamera, NokhwaError,
};

/// Provider backed by the platform camera API nokhwa selects.
#[derive(Debug, Clone)]
pub struct NokhwaProvider {
    backend: ApiBackend,
    fps: u32,
}

impl NokhwaProvider {
    pub fn new(fps: u32) -> Self {
        Self {
            backend: ApiBackend::Auto,
            fps,
        }
    }

    pub fn with_backend(mut self, backend: ApiBackend) -> Self {
        self.backend = backend;
        self
    }

    fn open(
        backend: ApiBackend,
        fps: u32,
        constraints: StreamConstraints,
    ) -> Result<NokhwaSession, AcquireError> {
        let device_id = match constraints.device_id.clone() {
            Some(id) => id,
            None => {
                let cameras = query(backend).map_err(classify)?;
                cameras
                    .first()
                    .map(|info| info.index().to_string())
                    .ok_or_else(|| {
                        AcquireError::new(AcquireErrorKind::NotFound, "no video devices")
                    })?
            }
        };

        let index = match device_id.parse::<u32>() {
            Ok(i) => CameraIndex::Index(i),
            Err(_) => CameraIndex::String(device_id.clone()),
        };

        let format = if constraints.width.ideal > 0 && constraints.height.ideal > 0 {
            RequestedFormatType::Closest(nokhwa::utils::CameraFormat::new(
                nokhwa::utils::Resolution::new(constraints.width.ideal, constraints.height.ideal),
                FrameFormat::MJPEG,
                fps,
            ))
        } else {
            RequestedFormatType::None
        };

        let mut camera =
            CallbackCamera::new(index, RequestedFormat::new::<RgbFormat>(format), |_| {})
                .map_err(classify)?;
        camera.open_stream().map_err(classify)?;

        let negotiated = camera.resolution().map_err(classify)?;
        let resolution = Resolution::new(negotiated.width_x, negotiated.height_y);

        if resolution.width < constraints.width.min || resolution.height < constraints.height.min {
            let _ = camera.stop_stream();
            return Err(AcquireError::overconstrained(format!(
                "device {} negotiated {} below minimum {}",
                device_id,
                resolution,
                constraints.min()
            )));
        }

        log::info!("Opened nokhwa camera {} at {}", device_id, resolution);

        Ok(NokhwaSession {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            resolution,
            camera,
            live: true,
        })
    }
}

impl Default for NokhwaProvider {
    fn default() -> Self {
        Self::new(30)
    }
}

fn classify(error: NokhwaError) -> AcquireError {
    match error {
        NokhwaError::OpenDeviceError(..) | NokhwaError::OpenStreamError(..) => {
            AcquireError::not_readable(error.to_string())
        }
        NokhwaError::UnsupportedOperationError(..) => {
            AcquireError::overconstrained(error.to_string())
        }
        other => AcquireError::new(
            AcquireErrorKind::Other("NokhwaError".to_string()),
            other.to_string(),
        ),
    }
}

#[async_trait]
impl CapabilityProvider for NokhwaProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CameraError> {
        let backend = self.backend;
        let cameras = tokio::task::spawn_blocking(move || query(backend))
            .await
            .map_err(|e| CameraError::EnumerationFailed(format!("Task join error: {}", e)))?
            .map_err(|e| CameraError::EnumerationFailed(format!("Failed to query cameras: {}", e)))?;

        Ok(cameras
            .into_iter()
            .map(|info| DeviceRecord::video(info.index().to_string(), info.human_name()))
            .collect())
    }

    async fn acquire(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn CaptureSession>, AcquireError> {
        let backend = self.backend;
        let fps = self.fps;
        let constraints = constraints.clone();
        let session = tokio::task::spawn_blocking(move || Self::open(backend, fps, constraints))
            .await
            .map_err(|e| {
                AcquireError::new(
                    AcquireErrorKind::Other("AbortError".to_string()),
                    format!("Task join error: {}", e),
                )
            })??;
        Ok(Box::new(session))
    }
}

/// Open nokhwa stream
pub struct NokhwaSession {
    id: String,
    device_id: DeviceId,
    resolution: Resolution,
    camera: CallbackCamera,
    live: bool,
}

impl CaptureSession for NokhwaSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// nokhwa may hand back MJPEG even when RGB was requested, so JPEG
    /// payloads are decoded here.
    fn read_frame(&mut self) -> Result<CameraFrame, CameraError> {
        if !self.live {
            return Err(CameraError::StreamError("session stopped".to_string()));
        }

        let frame = self
            .camera
            .poll_frame()
            .map_err(|e| CameraError::StreamError(format!("Failed to capture frame: {}", e)))?;

        let raw = frame.buffer_bytes();
        let width = frame.resolution().width_x;
        let height = frame.resolution().height_y;

        let rgb = if raw.len() >= 3 && raw[0] == 0xFF && raw[1] == 0xD8 && raw[2] == 0xFF {
            let img = image::load_from_memory(&raw)
                .map_err(|e| CameraError::StreamError(format!("Failed to decode MJPEG: {}", e)))?;
            img.to_rgb8().into_raw()
        } else if raw.len() == (width as usize) * (height as usize) * 3 {
            raw.to_vec()
        } else {
            return Err(CameraError::StreamError(format!(
                "Unexpected frame payload: {} bytes for {}x{}",
                raw.len(),
                width,
                height
            )));
        };

        Ok(CameraFrame::new(rgb, width, height, self.device_id.clone()))
    }

    fn stop(&mut self) {
        if !self.live {
            return;
        }
        self.live = false;
        if let Err(e) = self.camera.stop_stream() {
            log::warn!("Failed to stop camera {}: {}", self.device_id, e);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for NokhwaSession {
    fn drop(&mut self) {
        self.stop();
    }
}
