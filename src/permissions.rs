//! Camera permission priming.
//!
//! Some platforms only reveal device labels (and sometimes devices at all)
//! after the process has opened a camera once. Priming acquires any video
//! device, releases it straight away, and reports what happened.

use crate::errors::{AcquireErrorKind, CameraError};
use crate::platform::CapabilityProvider;
use crate::types::StreamConstraints;
use std::time::Duration;

/// Permission status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PermissionStatus {
    /// Permission granted
    Granted,
    /// Permission denied
    Denied,
    /// Permission not determined (no device to ask about, or an unrelated
    /// failure)
    NotDetermined,
}

impl std::fmt::Display for PermissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionStatus::Granted => write!(f, "granted"),
            PermissionStatus::Denied => write!(f, "denied"),
            PermissionStatus::NotDetermined => write!(f, "not_determined"),
        }
    }
}

/// Detailed permission information
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PermissionInfo {
    pub status: PermissionStatus,
    pub message: String,
    pub can_request: bool,
}

/// Open and immediately release any video device.
///
/// Only a timeout is an error; rejections are reported through the
/// returned status so startup can carry on and enumerate anyway.
pub async fn invoke_permission(
    provider: &dyn CapabilityProvider,
    timeout: Duration,
) -> Result<PermissionInfo, CameraError> {
    log::debug!("Priming camera permission");
    let attempt = tokio::time::timeout(timeout, provider.acquire(&StreamConstraints::any_video())).await;

    let info = match attempt {
        Err(_) => {
            log::error!("Permission request timed out after {:?}", timeout);
            return Err(CameraError::PermissionTimeout(timeout.as_millis() as u64));
        }
        Ok(Ok(mut session)) => {
            provider.release_session(session.as_mut());
            PermissionInfo {
                status: PermissionStatus::Granted,
                message: "Camera access granted".to_string(),
                can_request: false,
            }
        }
        Ok(Err(e)) => match e.kind {
            AcquireErrorKind::NotAllowed => PermissionInfo {
                status: PermissionStatus::Denied,
                message: format!("Camera access denied: {}", e.message),
                can_request: true,
            },
            AcquireErrorKind::NotFound => PermissionInfo {
                status: PermissionStatus::NotDetermined,
                message: "No cameras found - permission may not be granted".to_string(),
                can_request: true,
            },
            _ => PermissionInfo {
                status: PermissionStatus::NotDetermined,
                message: format!("Permission probe failed: {}", e),
                can_request: true,
            },
        },
    };

    log::info!("Camera permission: {} ({})", info.status, info.message);
    Ok(info)
}
