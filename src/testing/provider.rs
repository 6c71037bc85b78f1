//! Scriptable in-memory capability provider
//!
//! Every behaviour the lifecycle has to cope with can be staged here:
//! resolution limits, busy devices, hard failures, slow or failing
//! enumeration, and acquisitions that stay pending until released.

use crate::errors::{AcquireError, AcquireErrorKind, CameraError};
use crate::platform::{CapabilityProvider, CaptureSession};
use crate::testing::synthetic_video_frame;
use crate::types::{CameraFrame, DeviceId, DeviceRecord, Resolution, StreamConstraints};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Resolution a permission-priming acquisition negotiates.
const ANY_VIDEO_RESOLUTION: Resolution = Resolution {
    width: 640,
    height: 480,
};

/// How a device answers an acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptRule {
    /// Largest ideal resolution accepted; anything bigger is over-constrained.
    pub max: Option<Resolution>,
    /// Resolution actually delivered, regardless of what was asked.
    pub negotiated: Option<Resolution>,
}

impl AcceptRule {
    pub fn max(width: u32, height: u32) -> Self {
        Self {
            max: Some(Resolution::new(width, height)),
            negotiated: None,
        }
    }

    pub fn negotiate(width: u32, height: u32) -> Self {
        Self {
            max: None,
            negotiated: Some(Resolution::new(width, height)),
        }
    }

    /// Over-constrained at every size.
    pub fn reject_all() -> Self {
        Self::max(0, 0)
    }
}

#[derive(Default)]
struct ProviderState {
    devices: Vec<DeviceRecord>,
    rules: HashMap<DeviceId, AcceptRule>,
    default_rule: AcceptRule,
    busy: HashMap<DeviceId, u32>,
    failures: HashMap<DeviceId, AcquireError>,
    enumeration_failure: Option<String>,
    hang_enumeration: bool,
    attempts: Vec<StreamConstraints>,
}

/// In-memory [`CapabilityProvider`] for tests and demos.
pub struct SyntheticProvider {
    state: Mutex<ProviderState>,
    gate: watch::Sender<bool>,
    enumerations: AtomicUsize,
    releases: AtomicUsize,
    live: Arc<AtomicUsize>,
}

impl SyntheticProvider {
    pub fn new(devices: Vec<DeviceRecord>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(ProviderState {
                devices,
                ..Default::default()
            }),
            gate,
            enumerations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap the visible device list, as a plug or unplug would.
    pub fn set_devices(&self, devices: Vec<DeviceRecord>) {
        self.state().devices = devices;
    }

    pub fn set_rule(&self, device_id: &str, rule: AcceptRule) {
        self.state().rules.insert(device_id.to_string(), rule);
    }

    pub fn set_default_rule(&self, rule: AcceptRule) {
        self.state().default_rule = rule;
    }

    /// Reject the next `times` acquisitions of `device_id` as busy.
    pub fn fail_busy(&self, device_id: &str, times: u32) {
        self.state().busy.insert(device_id.to_string(), times);
    }

    /// Reject every acquisition of `device_id` with `error`.
    pub fn fail_with(&self, device_id: &str, error: AcquireError) {
        self.state().failures.insert(device_id.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.busy.clear();
        state.failures.clear();
    }

    pub fn fail_enumeration(&self, message: Option<&str>) {
        self.state().enumeration_failure = message.map(str::to_string);
    }

    /// Make enumeration pend forever.
    pub fn hang_enumeration(&self, hang: bool) {
        self.state().hang_enumeration = hang;
    }

    /// Park every acquisition until [`SyntheticProvider::release_acquisitions`].
    pub fn hold_acquisitions(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_acquisitions(&self) {
        self.gate.send_replace(true);
    }

    pub fn acquire_count(&self) -> usize {
        self.state().attempts.len()
    }

    /// Every constraint set passed to `acquire`, in order.
    pub fn attempts(&self) -> Vec<StreamConstraints> {
        self.state().attempts.clone()
    }

    pub fn reset_attempts(&self) {
        self.state().attempts.clear();
    }

    pub fn enumeration_count(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet stopped
    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn decide(&self, constraints: &StreamConstraints) -> Result<(DeviceId, Resolution), AcquireError> {
        let mut state = self.state();

        let device_id = match &constraints.device_id {
            Some(id) => {
                if !state.devices.iter().any(|d| d.is_video() && &d.device_id == id) {
                    return Err(AcquireError::new(
                        AcquireErrorKind::NotFound,
                        format!("device {} not present", id),
                    ));
                }
                id.clone()
            }
            None => state
                .devices
                .iter()
                .find(|d| d.is_video())
                .map(|d| d.device_id.clone())
                .ok_or_else(|| AcquireError::new(AcquireErrorKind::NotFound, "no video devices"))?,
        };

        if let Some(error) = state.failures.get(&device_id) {
            return Err(error.clone());
        }

        if let Some(remaining) = state.busy.get_mut(&device_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AcquireError::not_readable(format!("device {} is busy", device_id)));
            }
        }

        let rule = state
            .rules
            .get(&device_id)
            .copied()
            .unwrap_or(state.default_rule);

        let ideal = constraints.ideal();
        if ideal.width == 0 || ideal.height == 0 {
            return Ok((device_id, rule.negotiated.unwrap_or(ANY_VIDEO_RESOLUTION)));
        }

        if let Some(max) = rule.max {
            if ideal.width > max.width || ideal.height > max.height {
                return Err(AcquireError::overconstrained(format!(
                    "{} exceeds {} on {}",
                    ideal, max, device_id
                )));
            }
        }

        let negotiated = rule.negotiated.unwrap_or(ideal);
        let min = constraints.min();
        if negotiated.width < min.width || negotiated.height < min.height {
            return Err(AcquireError::overconstrained(format!(
                "{} below minimum {} on {}",
                negotiated, min, device_id
            )));
        }

        Ok((device_id, negotiated))
    }
}

#[async_trait]
impl CapabilityProvider for SyntheticProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, CameraError> {
        self.enumerations.fetch_add(1, Ordering::SeqCst);
        let (hang, failure, devices) = {
            let state = self.state();
            (
                state.hang_enumeration,
                state.enumeration_failure.clone(),
                state.devices.clone(),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        match failure {
            Some(message) => Err(CameraError::EnumerationFailed(message)),
            None => Ok(devices),
        }
    }

    async fn acquire(
        &self,
        constraints: &StreamConstraints,
    ) -> Result<Box<dyn CaptureSession>, AcquireError> {
        self.state().attempts.push(constraints.clone());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(AcquireError::new(
                AcquireErrorKind::Other("AbortError".to_string()),
                "provider shut down",
            ));
        }

        let (device_id, resolution) = self.decide(constraints)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        log::debug!("Synthetic session opened on {} at {}", device_id, resolution);

        Ok(Box::new(SyntheticSession {
            id: uuid::Uuid::new_v4().to_string(),
            device_id,
            resolution,
            frames: 0,
            live: true,
            live_counter: self.live.clone(),
        }))
    }

    fn release_session(&self, session: &mut dyn CaptureSession) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        session.stop();
    }
}

/// Session producing gradient frames at the negotiated resolution
pub struct SyntheticSession {
    id: String,
    device_id: DeviceId,
    resolution: Resolution,
    frames: u64,
    live: bool,
    live_counter: Arc<AtomicUsize>,
}

impl CaptureSession for SyntheticSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn read_frame(&mut self) -> Result<CameraFrame, CameraError> {
        if !self.live {
            return Err(CameraError::StreamError("session stopped".to_string()));
        }
        let n = self.frames;
        self.frames += 1;
        let mut frame = synthetic_video_frame(n, self.resolution.width, self.resolution.height);
        frame.device_id = self.device_id.clone();
        Ok(frame)
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.live_counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::video_devices;

    #[tokio::test]
    async fn test_accepts_within_limits() {
        let provider = SyntheticProvider::new(video_devices(1));
        provider.set_rule("video-0", AcceptRule::max(1280, 720));

        let mut session = provider
            .acquire(&StreamConstraints::for_device("video-0", 640, 480))
            .await
            .unwrap();
        assert_eq!(session.resolution(), Resolution::new(640, 480));
        assert_eq!(provider.live_sessions(), 1);

        let frame = session.read_frame().unwrap();
        assert_eq!(frame.device_id, "video-0");
        assert!(frame.is_valid());

        provider.release_session(session.as_mut());
        assert_eq!(provider.live_sessions(), 0);
        assert_eq!(provider.release_count(), 1);
    }

    #[tokio::test]
    async fn test_overconstrained_and_busy() {
        let provider = SyntheticProvider::new(video_devices(1));
        provider.set_rule("video-0", AcceptRule::max(640, 480));
        provider.fail_busy("video-0", 1);

        let big = StreamConstraints::for_device("video-0", 1920, 1080);
        let small = StreamConstraints::for_device("video-0", 640, 480);

        let err = provider.acquire(&small).await.unwrap_err();
        assert_eq!(err.kind, AcquireErrorKind::NotReadable);
        let err = provider.acquire(&big).await.unwrap_err();
        assert_eq!(err.kind, AcquireErrorKind::Overconstrained);
        assert!(provider.acquire(&small).await.is_ok());
        assert_eq!(provider.acquire_count(), 3);
    }

    #[tokio::test]
    async fn test_negotiated_below_minimum_is_overconstrained() {
        let provider = SyntheticProvider::new(video_devices(1));
        provider.set_rule("video-0", AcceptRule::negotiate(320, 240));
        let err = provider
            .acquire(&StreamConstraints::for_device("video-0", 640, 480))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AcquireErrorKind::Overconstrained);
    }

    #[tokio::test]
    async fn test_unknown_device_not_found() {
        let provider = SyntheticProvider::new(video_devices(1));
        let err = provider
            .acquire(&StreamConstraints::for_device("ghost", 640, 480))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AcquireErrorKind::NotFound);
    }
}
