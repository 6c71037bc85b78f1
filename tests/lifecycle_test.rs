//! End-to-end lifecycle scenarios against the synthetic provider.
//!
//! Run with: cargo test --test lifecycle_test

use crabstream::testing::{AcceptRule, SyntheticProvider};
use crabstream::{
    BaseStreamConfig, CameraError, ConnectionState, CrabStreamConfig, DataType, DeviceChangeNotice,
    DeviceRecord, EventStream, LifecycleAction, MatchLabel, ReconcileOutcome, SnapOverrides,
    StreamCamera, StreamSlotConfig,
};
use std::sync::Arc;
use std::time::Duration;

fn config() -> CrabStreamConfig {
    let mut config = CrabStreamConfig::default();
    config.events.skip_invoke_permission = true;
    config.default_stream = BaseStreamConfig::default();
    config
}

fn front_cam() -> Vec<DeviceRecord> {
    vec![DeviceRecord::video("a", "FrontCam")]
}

async fn camera_with(devices: Vec<DeviceRecord>, config: CrabStreamConfig) -> (Arc<SyntheticProvider>, StreamCamera) {
    let provider = Arc::new(SyntheticProvider::new(devices));
    let camera = StreamCamera::initialize(config, provider.clone())
        .await
        .expect("camera should initialize");
    (provider, camera)
}

fn names(events: &mut EventStream) -> Vec<&'static str> {
    events.drain().iter().map(|e| e.name()).collect()
}

#[tokio::test]
async fn test_connect_then_capture_stays_bound() {
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    let mut events = camera.subscribe();

    let conn = camera.connect(Some(0)).await.unwrap();
    assert_eq!(conn.device_id, "a");
    assert_eq!((conn.width, conn.height), (640, 480));

    let still = camera.capture(None).await.unwrap();
    assert!(still.url.starts_with("data:image/jpeg;base64,"));
    assert_eq!((still.width, still.height), (640, 480));

    assert_eq!(camera.connection_state(0), ConnectionState::Bound);
    assert!(camera.is_playing());
    assert_eq!(names(&mut events), vec!["connected"]);
}

#[tokio::test]
async fn test_capture_without_stream_fails_and_mirrors() {
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    let mut events = camera.subscribe();

    let err = camera.capture(None).await.unwrap_err();
    assert!(matches!(err, CameraError::CaptureFailed(_)));
    let events = events.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, LifecycleAction::Exception);
    assert_eq!(events[0].error, Some(err));
}

#[tokio::test]
async fn test_rotation_changes_surface_shape() {
    crabstream::invariants::clear();
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    camera.connect(Some(0)).await.unwrap();

    let quarter = camera
        .capture(Some(SnapOverrides::default().rotate(90)))
        .await
        .unwrap();
    assert_eq!((quarter.width, quarter.height), (480, 640));

    let half = camera
        .capture(Some(SnapOverrides::default().rotate(180)))
        .await
        .unwrap();
    assert_eq!((half.width, half.height), (640, 480));

    crabstream::invariants::assert_checked(
        "rotated capture",
        &["capture surface matches post-rotation size"],
    );
}

#[tokio::test]
async fn test_slot_rotation_applies_when_not_overridden() {
    let mut config = config();
    config.streams = vec![StreamSlotConfig::new(640, 480).with_rotate(270)];
    let (_provider, camera) = camera_with(front_cam(), config).await;
    camera.connect(Some(0)).await.unwrap();

    let still = camera.capture(None).await.unwrap();
    assert_eq!(still.options.rotate, Some(270));
    assert_eq!((still.width, still.height), (480, 640));
}

#[tokio::test]
async fn test_object_url_capture_thumbnail_and_revoke() {
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    camera.connect(Some(0)).await.unwrap();

    let still = camera
        .capture(Some(SnapOverrides::default().data_type(DataType::ObjectUrl)))
        .await
        .unwrap();
    assert!(still.url.starts_with("blob:crabstream/"));

    let thumb = camera
        .thumbnail(&still.url, crabstream::ImgOptions::default())
        .await
        .unwrap();
    assert!(thumb.starts_with("data:image/jpeg;base64,"));

    assert!(camera.revoke_object_url(&still.url));
    assert!(!camera.revoke_object_url(&still.url));
    assert!(camera
        .thumbnail(&still.url, crabstream::ImgOptions::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_undelayed_captures_read_live_frames() {
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    camera.connect(Some(0)).await.unwrap();

    let first = camera.capture(None).await.unwrap();
    let second = camera.capture(None).await.unwrap();
    assert_ne!(first.url, second.url);
    assert!(camera.is_playing());

    let delayed = camera
        .capture(Some(SnapOverrides::default().delay_ms(20)))
        .await
        .unwrap();
    assert_ne!(second.url, delayed.url);
}

#[tokio::test]
async fn test_empty_device_change_removes_everything() {
    let mut config = config();
    config.device_change.delay_ms = 100;
    let (provider, camera) = camera_with(front_cam(), config).await;
    camera.connect(Some(0)).await.unwrap();
    let mut events = camera.subscribe();

    provider.set_devices(vec![]);
    let notifier = camera.device_change_notifier().unwrap();
    notifier
        .send(DeviceChangeNotice {
            connected: vec![],
            disconnected: vec!["a".to_string()],
        })
        .unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            let done = event.action == LifecycleAction::DeviceRemoved;
            seen.push(event.name());
            if done {
                break;
            }
        }
    })
    .await
    .expect("deviceRemoved should arrive");

    tokio::time::sleep(Duration::from_millis(300)).await;
    seen.extend(names(&mut events));

    assert_eq!(seen.iter().filter(|n| **n == "deviceRemoved").count(), 1);
    assert_eq!(seen, vec!["disconnected", "deviceRemoved"]);
    assert!(camera.active_connection().is_none());
    assert_eq!(camera.connection_state(0), ConnectionState::Idle);
    assert!(camera.get_all_device_info().await.is_empty());
    assert!(camera.get_device_ids().await.is_empty());
    assert_eq!(provider.live_sessions(), 0);
}

#[tokio::test]
async fn test_plugging_a_camera_back_in_reconnects() {
    let (provider, camera) = camera_with(front_cam(), config()).await;
    provider.set_devices(vec![]);
    assert_eq!(camera.reconcile_devices().await, ReconcileOutcome::Removed);

    let mut events = camera.subscribe();
    provider.set_devices(vec![DeviceRecord::video("b", "USB Camera")]);
    assert_eq!(
        camera.reconcile_devices().await,
        ReconcileOutcome::Changed { video_count: 1 }
    );
    assert_eq!(names(&mut events), vec!["deviceChange", "connected"]);
    assert_eq!(camera.active_connection().unwrap().device_id, "b");
}

#[tokio::test]
async fn test_degradation_ladder_binds_smaller_resolution() {
    let mut config = config();
    config.video.retry_ratio = Some(0.6);
    config.streams = vec![StreamSlotConfig::new(1280, 720)];
    let (provider, camera) = camera_with(front_cam(), config).await;
    provider.set_rule("a", AcceptRule::max(800, 600));
    let mut events = camera.subscribe();

    let conn = camera.connect(Some(0)).await.unwrap();
    assert_eq!((conn.width, conn.height), (768, 432));
    assert_eq!(provider.acquire_count(), 2);

    let actions: Vec<LifecycleAction> = events.drain().into_iter().map(|e| e.action).collect();
    assert_eq!(
        actions[0],
        LifecycleAction::RetryConnect {
            slot: 0,
            attempt: 2,
            width: 768,
            height: 432
        }
    );
    assert!(matches!(actions[1], LifecycleAction::Connected { width: 768, .. }));

    // The negotiated size sticks to the slot.
    assert_eq!(camera.get_slot(0).await.unwrap().config.width, 768);
}

#[tokio::test]
async fn test_device_change_reconnects_at_negotiated_resolution() {
    let mut config = config();
    config.video.retry_ratio = Some(0.6);
    config.streams = vec![StreamSlotConfig::new(1280, 720)];
    let (provider, camera) = camera_with(front_cam(), config).await;
    provider.set_rule("a", AcceptRule::max(800, 600));
    camera.connect(Some(0)).await.unwrap();
    camera.disconnect().await;

    let mut devices = front_cam();
    devices.push(DeviceRecord::video("b", "USB Camera"));
    provider.set_devices(devices);
    provider.reset_attempts();
    assert_eq!(
        camera.reconcile_devices().await,
        ReconcileOutcome::Changed { video_count: 2 }
    );

    assert_eq!(provider.acquire_count(), 1);
    let conn = camera.active_connection().unwrap();
    assert_eq!((conn.device_id.as_str(), conn.width, conn.height), ("a", 768, 432));
    assert_eq!(camera.get_slot(0).await.unwrap().config.width, 768);
}

#[tokio::test]
async fn test_exhausted_ladder_reports_last_request() {
    let mut config = config();
    config.video.retry_ratio = Some(0.6);
    let (provider, camera) = camera_with(front_cam(), config).await;
    provider.set_default_rule(AcceptRule::reject_all());

    let err = camera.connect(Some(0)).await.unwrap_err();
    assert_eq!(
        err,
        CameraError::ResolutionExhausted {
            slot: 0,
            width: 384,
            height: 288
        }
    );
    assert_eq!(provider.acquire_count(), 2);
    assert_eq!(camera.connection_state(0), ConnectionState::Failed);
}

#[tokio::test]
async fn test_connect_then_disconnect_twice() {
    let (provider, camera) = camera_with(front_cam(), config()).await;
    let before = camera.get_all_device_info().await;
    let mut events = camera.subscribe();

    camera.connect(Some(0)).await.unwrap();
    assert!(camera.disconnect().await);
    assert!(!camera.disconnect().await);

    assert_eq!(names(&mut events), vec!["connected", "disconnected"]);
    assert_eq!(camera.connection_state(0), ConnectionState::Idle);
    assert_eq!(camera.get_all_device_info().await, before);
    assert_eq!(provider.live_sessions(), 0);
}

#[tokio::test]
async fn test_connect_next_walks_slots_by_label() {
    let mut config = config();
    config.streams = vec![
        StreamSlotConfig::default().with_labels(vec![MatchLabel::substring("Rear")]),
        StreamSlotConfig::default().with_labels(vec![MatchLabel::substring("Front")]),
    ];
    let devices = vec![
        DeviceRecord::video("front", "Front Camera"),
        DeviceRecord::audio("mic", "Microphone"),
        DeviceRecord::video("rear", "Rear Camera"),
    ];
    let (_provider, camera) = camera_with(devices, config).await;

    assert_eq!(camera.get_device_ids().await, vec!["rear", "front"]);
    assert_eq!(camera.get_all_device_info().await.len(), 3);

    assert_eq!(camera.connect(None).await.unwrap().device_id, "rear");
    assert_eq!(camera.connect_next().await.unwrap().device_id, "front");
    assert_eq!(camera.connect_next().await.unwrap().device_id, "rear");
}

#[tokio::test]
async fn test_single_device_has_no_next_stream() {
    let (_provider, camera) = camera_with(front_cam(), config()).await;
    camera.connect(Some(0)).await.unwrap();
    assert_eq!(camera.connect_next().await.unwrap_err(), CameraError::NoNextStream);
    assert!(camera.is_playing());
}

#[tokio::test]
async fn test_busy_device_retries_once_then_switches_policy() {
    let (provider, camera) = camera_with(front_cam(), config()).await;
    provider.fail_busy("a", 1);

    camera.connect(Some(0)).await.unwrap();
    assert_eq!(provider.acquire_count(), 2);

    provider.fail_busy("a", 2);
    let mut events = camera.subscribe();
    let err = camera.connect(Some(0)).await.unwrap_err();
    assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    assert_eq!(
        names(&mut events),
        vec!["disconnected", "retryConnect", "exception"]
    );
}

#[tokio::test]
async fn test_switch_video_by_device_id() {
    let devices = vec![
        DeviceRecord::video("a", "FrontCam"),
        DeviceRecord::video("b", "RearCam"),
    ];
    let (_provider, camera) = camera_with(devices, config()).await;

    let conn = camera.switch_video("b", 320, 240).await.unwrap();
    assert_eq!(conn.logical_index, 1);
    assert_eq!((conn.width, conn.height), (320, 240));
    assert_eq!(camera.current_index(), 1);

    assert!(matches!(
        camera.switch_video("zzz", 320, 240).await,
        Err(CameraError::DeviceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_concurrent_connect_to_same_slot_is_rejected() {
    let (provider, camera) = camera_with(front_cam(), config()).await;
    provider.hold_acquisitions();

    let (first, second, _) = futures::join!(camera.connect(Some(0)), camera.connect(Some(0)), async {
        tokio::task::yield_now().await;
        provider.release_acquisitions();
    });

    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(CameraError::ConnectInProgress(0)))));
    assert_eq!(camera.connection_state(0), ConnectionState::Bound);
    assert_eq!(provider.live_sessions(), 1);
}
