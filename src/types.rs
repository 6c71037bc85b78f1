//! Core data types shared across the stream lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity of a physical device as reported by the provider.
pub type DeviceId = String;

/// Caller-facing logical stream index.
pub type StreamIdx = usize;

/// Kind of input device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::VideoInput => "videoinput",
            DeviceKind::AudioInput => "audioinput",
        }
    }
}

/// One enumerated input device.
///
/// Replaced wholesale on every enumeration pass; `label` is a human hint
/// that may be empty and is not unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub kind: DeviceKind,
    pub label: String,
}

impl DeviceRecord {
    pub fn video(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::VideoInput,
            label: label.into(),
        }
    }

    pub fn audio(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind: DeviceKind::AudioInput,
            label: label.into(),
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind == DeviceKind::VideoInput
    }
}

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both sides by `ratio`, flooring like the browser does.
    pub fn scaled(&self, ratio: f64) -> Self {
        Self {
            width: (self.width as f64 * ratio).floor() as u32,
            height: (self.height as f64 * ratio).floor() as u32,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Ideal/minimum pair for one dimension of an acquisition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionConstraint {
    pub ideal: u32,
    pub min: u32,
}

/// Fraction of the ideal resolution a provider may fall to before the
/// request counts as over-constrained.
pub const MIN_RESOLUTION_SLACK: f64 = 0.9;

/// Constraints handed to [`crate::platform::CapabilityProvider::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConstraints {
    /// Exact device to open; `None` means any video device.
    pub device_id: Option<DeviceId>,
    pub width: DimensionConstraint,
    pub height: DimensionConstraint,
}

impl StreamConstraints {
    /// Request `width`x`height` on `device_id` with 10% slack for driver rounding.
    pub fn for_device(device_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_id: Some(device_id.into()),
            width: DimensionConstraint {
                ideal: width,
                min: (width as f64 * MIN_RESOLUTION_SLACK).floor() as u32,
            },
            height: DimensionConstraint {
                ideal: height,
                min: (height as f64 * MIN_RESOLUTION_SLACK).floor() as u32,
            },
        }
    }

    /// Any video device, no resolution floor. Used to prime permissions.
    pub fn any_video() -> Self {
        Self {
            device_id: None,
            width: DimensionConstraint { ideal: 0, min: 0 },
            height: DimensionConstraint { ideal: 0, min: 0 },
        }
    }

    pub fn ideal(&self) -> Resolution {
        Resolution::new(self.width.ideal, self.height.ideal)
    }

    pub fn min(&self) -> Resolution {
        Resolution::new(self.width.min, self.height.min)
    }
}

/// A decoded RGB8 frame pulled from a live session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraFrame {
    pub id: String,
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub device_id: DeviceId,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
}

impl CameraFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, device_id: DeviceId) -> Self {
        let size_bytes = data.len();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            data,
            width,
            height,
            format: "RGB8".to_string(),
            device_id,
            timestamp: Utc::now(),
            size_bytes,
        }
    }

    pub fn with_format(mut self, format: String) -> Self {
        self.format = format;
        self
    }

    /// Whether the buffer holds exactly `width * height` RGB pixels.
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == (self.width as usize) * (self.height as usize) * 3
    }
}

/// The single currently-bound capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub logical_index: StreamIdx,
    pub device_id: DeviceId,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraints_slack() {
        let c = StreamConstraints::for_device("cam", 640, 480);
        assert_eq!(c.ideal(), Resolution::new(640, 480));
        assert_eq!(c.min(), Resolution::new(576, 432));
        assert_eq!(c.device_id.as_deref(), Some("cam"));
    }

    #[test]
    fn test_resolution_scaled_floors() {
        let r = Resolution::new(641, 481).scaled(0.6);
        assert_eq!(r, Resolution::new(384, 288));
    }

    #[test]
    fn test_frame_validity() {
        let frame = CameraFrame::new(vec![0; 2 * 2 * 3], 2, 2, "a".to_string());
        assert!(frame.is_valid());
        assert_eq!(frame.size_bytes, 12);

        let short = CameraFrame::new(vec![0; 5], 2, 2, "a".to_string());
        assert!(!short.is_valid());
    }

    #[test]
    fn test_device_kind_serde() {
        let json = serde_json::to_string(&DeviceKind::VideoInput).unwrap();
        assert_eq!(json, "\"videoinput\"");
        assert_eq!(DeviceKind::AudioInput.as_str(), "audioinput");
    }
}
