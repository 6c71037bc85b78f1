use thiserror::Error;

/// Errors surfaced by the stream lifecycle.
///
/// `Clone` so a failure can be returned to the caller and mirrored onto the
/// event channel at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    #[error("No device resolved for stream slot {0}")]
    DeviceNotFound(usize),
    #[error("Next stream not available")]
    NoNextStream,
    #[error("Retry connect({slot}) failed with minimum config w/h: {width}/{height}")]
    ResolutionExhausted {
        slot: usize,
        width: u32,
        height: u32,
    },
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Connect failed: {0}")]
    UnclassifiedConnectError(String),
    #[error("Capture failed: {0}")]
    CaptureFailed(String),
    #[error("Permission request timed out after {0}ms")]
    PermissionTimeout(u64),
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),
    #[error("Connect already in progress for stream slot {0}")]
    ConnectInProgress(usize),
    #[error("Connect for stream slot {0} cancelled by disconnect")]
    ConnectCancelled(usize),
    #[error("Stream slot {0} not configured")]
    SlotNotFound(usize),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Encoding error: {0}")]
    EncodingError(String),
}

/// Error names reported by a capability provider when an acquisition is
/// rejected. Names follow the media-capture API so providers can forward
/// them verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireErrorKind {
    Overconstrained,
    ConstraintNotSatisfied,
    NotReadable,
    TrackStart,
    NotAllowed,
    NotFound,
    Other(String),
}

impl AcquireErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "OverconstrainedError" => AcquireErrorKind::Overconstrained,
            "ConstraintNotSatisfiedError" => AcquireErrorKind::ConstraintNotSatisfied,
            "NotReadableError" => AcquireErrorKind::NotReadable,
            "TrackStartError" => AcquireErrorKind::TrackStart,
            "NotAllowedError" => AcquireErrorKind::NotAllowed,
            "NotFoundError" => AcquireErrorKind::NotFound,
            other => AcquireErrorKind::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AcquireErrorKind::Overconstrained => "OverconstrainedError",
            AcquireErrorKind::ConstraintNotSatisfied => "ConstraintNotSatisfiedError",
            AcquireErrorKind::NotReadable => "NotReadableError",
            AcquireErrorKind::TrackStart => "TrackStartError",
            AcquireErrorKind::NotAllowed => "NotAllowedError",
            AcquireErrorKind::NotFound => "NotFoundError",
            AcquireErrorKind::Other(name) => name,
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            AcquireErrorKind::Overconstrained | AcquireErrorKind::ConstraintNotSatisfied => {
                FailureClass::Overconstrained
            }
            AcquireErrorKind::NotReadable | AcquireErrorKind::TrackStart => FailureClass::Busy,
            _ => FailureClass::Other,
        }
    }
}

/// How the connector reacts to a rejected acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Resolution cannot be satisfied; degrade and retry.
    Overconstrained,
    /// Device busy or hardware fault; release and retry once.
    Busy,
    /// Surfaced immediately.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.name())]
pub struct AcquireError {
    pub kind: AcquireErrorKind,
    pub message: String,
}

impl AcquireError {
    pub fn new(kind: AcquireErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn overconstrained(message: impl Into<String>) -> Self {
        Self::new(AcquireErrorKind::Overconstrained, message)
    }

    pub fn not_readable(message: impl Into<String>) -> Self {
        Self::new(AcquireErrorKind::NotReadable, message)
    }

    pub fn class(&self) -> FailureClass {
        self.kind.class()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_name_round_trip() {
        for name in [
            "OverconstrainedError",
            "ConstraintNotSatisfiedError",
            "NotReadableError",
            "TrackStartError",
            "NotAllowedError",
            "NotFoundError",
            "AbortError",
        ] {
            assert_eq!(AcquireErrorKind::from_name(name).name(), name);
        }
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(
            AcquireErrorKind::from_name("ConstraintNotSatisfiedError").class(),
            FailureClass::Overconstrained
        );
        assert_eq!(
            AcquireErrorKind::from_name("TrackStartError").class(),
            FailureClass::Busy
        );
        assert_eq!(
            AcquireErrorKind::from_name("SecurityError").class(),
            FailureClass::Other
        );
    }

    #[test]
    fn test_resolution_exhausted_display() {
        let err = CameraError::ResolutionExhausted {
            slot: 1,
            width: 384,
            height: 288,
        };
        assert_eq!(
            err.to_string(),
            "Retry connect(1) failed with minimum config w/h: 384/288"
        );
    }

    #[test]
    fn test_acquire_error_display() {
        let err = AcquireError::not_readable("device in use");
        assert_eq!(err.to_string(), "NotReadableError: device in use");
    }
}
