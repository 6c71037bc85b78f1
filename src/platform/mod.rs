//! Capability provider seam.
//!
//! The lifecycle never talks to camera hardware directly. A
//! [`CapabilityProvider`] enumerates devices and opens [`CaptureSession`]s;
//! everything else is built on top of those two calls.

pub mod device_monitor;
#[cfg(feature = "native")]
pub mod native;

pub use device_monitor::{DeviceChangeNotice, DeviceWatcher};
#[cfg(feature = "native")]
pub use native::NokhwaProvider;

use crate::errors::{AcquireError, CameraError};
use crate::types::{CameraFrame, DeviceId, DeviceRecord, Resolution, StreamConstraints};
use async_trait::async_trait;

/// A live capture session opened against one device.
pub trait CaptureSession: Send {
    fn id(&self) -> &str;

    fn device_id(&self) -> &DeviceId;

    /// Resolution actually negotiated with the device.
    fn resolution(&self) -> Resolution;

    /// Pull the next frame. May block until the device delivers one.
    fn read_frame(&mut self) -> Result<CameraFrame, CameraError>;

    /// Stop every underlying track. Must be idempotent.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

impl std::fmt::Debug for dyn CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("id", &self.id())
            .field("device_id", self.device_id())
            .field("resolution", &self.resolution())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Source of devices and capture sessions.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Every input device currently visible, in enumeration order.
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CameraError>;

    /// Open a capture session satisfying `constraints`.
    async fn acquire(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn CaptureSession>, AcquireError>;

    /// Release a session obtained from [`CapabilityProvider::acquire`].
    fn release_session(&self, session: &mut dyn CaptureSession) {
        log::debug!(
            "Releasing session {} on device {}",
            session.id(),
            session.device_id()
        );
        session.stop();
    }
}
