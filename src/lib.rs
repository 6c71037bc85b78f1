//! CrabStream: multi-slot camera stream lifecycle
//!
//! This crate manages which physical camera backs each logical stream slot,
//! negotiates resolutions with the device, follows hot-plug changes and
//! takes stills from whatever stream is bound.
//!
//! # Features
//! - Device registry with label-based slot assignment
//! - Resolution degradation ladder for over-constrained devices
//! - Busy-device retry and reject-on-race connection handling
//! - Debounced hot-plug reconciliation
//! - Snapshots with scaling, mirroring and rotation as data or object URLs
//! - One ordered lifecycle event channel
//!
//! # Usage
//! ```rust,ignore
//! use crabstream::{CrabStreamConfig, StreamCamera};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), crabstream::CameraError> {
//!     crabstream::init_logging();
//!     let provider = Arc::new(crabstream::platform::NokhwaProvider::new(30));
//!     let camera = StreamCamera::initialize(CrabStreamConfig::load_or_default(), provider).await?;
//!     let mut events = camera.subscribe();
//!
//!     camera.connect(Some(0)).await?;
//!     let still = camera.capture(None).await?;
//!     println!("{} ({}x{})", &still.url[..32], still.width, still.height);
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.name());
//!     }
//!     Ok(())
//! }
//! ```
pub mod camera;
pub mod config;
pub mod connector;
pub mod errors;
pub mod events;
pub mod invariants;
pub mod permissions;
pub mod platform;
pub mod reconciler;
pub mod registry;
pub mod sink;
pub mod slots;
pub mod snapshot;
pub mod types;

// Testing utilities - synthetic devices and frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use camera::StreamCamera;
pub use config::CrabStreamConfig;
pub use connector::{ConnectionState, ConnectorSettings, StreamConnector};
pub use errors::{AcquireError, AcquireErrorKind, CameraError, FailureClass};
pub use events::{EventBus, EventStream, LifecycleAction, LifecycleEvent};
pub use platform::{CapabilityProvider, CaptureSession, DeviceChangeNotice, DeviceWatcher};
pub use reconciler::{DeviceChangeReconciler, ReconcileOutcome};
pub use registry::{DeviceRegistry, RegistrySnapshot};
pub use sink::{FrameSink, Sink};
pub use slots::{BaseStreamConfig, MatchLabel, ResolvedSlot, SlotTable, StreamSlotConfig};
pub use snapshot::{
    DataType, ImageCapture, ImageEncoder, ImageFormat, ImgOptions, SnapOptions, SnapOverrides,
    SnapshotPipeline, UrlEncoder,
};
pub use types::{
    ActiveConnection, CameraFrame, DeviceId, DeviceKind, DeviceRecord, Resolution,
    StreamConstraints, StreamIdx,
};

/// Initialize logging for the stream lifecycle
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabstream=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        native_backend: cfg!(feature = "native"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub native_backend: bool,
}
