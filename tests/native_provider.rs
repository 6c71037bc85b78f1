//! Smoke tests against whatever cameras the host exposes.
//!
//! Run with: cargo test --test native_provider --features native
//! Hosts without cameras (CI) only exercise the empty/error paths.

use crabstream::platform::NokhwaProvider;
use crabstream::{CameraError, CapabilityProvider, CrabStreamConfig, StreamCamera};
use std::sync::Arc;

#[tokio::test]
async fn test_enumeration_never_panics() {
    let provider = NokhwaProvider::default();
    match provider.list_devices().await {
        Ok(devices) => {
            for device in &devices {
                assert!(device.is_video());
                assert!(!device.device_id.is_empty());
            }
        }
        Err(e) => assert!(matches!(e, CameraError::EnumerationFailed(_))),
    }
}

#[tokio::test]
async fn test_camera_initializes_or_fails_cleanly() {
    let mut config = CrabStreamConfig::default();
    config.events.skip_invoke_permission = true;
    config.timeouts.sink_ready_ms = 5_000;

    let camera = match StreamCamera::initialize(config, Arc::new(NokhwaProvider::default())).await {
        Ok(camera) => camera,
        Err(e) => {
            assert!(matches!(e, CameraError::EnumerationFailed(_)));
            return;
        }
    };

    if camera.slot_count().await == 0 {
        assert!(camera.connect(Some(0)).await.is_err());
        return;
    }

    // A present camera may still be held by another process.
    if camera.connect(Some(0)).await.is_ok() {
        let still = camera.capture(None).await.unwrap();
        assert!(still.url.starts_with("data:image/jpeg;base64,"));
    }
    camera.destroy().await;
}
