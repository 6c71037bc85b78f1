//! Stream connection state machine with resolution degradation.
//!
//! Per logical slot: `Idle -> Opening -> Bound`, with `Retrying` between
//! attempts and `Failed` when the ladder or busy retry is exhausted. Only one
//! session is bound to the sink at a time.
//!
//! Cancellation is epoch based: [`StreamConnector::disconnect`] bumps the
//! epoch, and an acquisition that resolves under a stale epoch releases its
//! session instead of binding it.

use crate::errors::{CameraError, FailureClass};
use crate::events::{EventBus, LifecycleAction, LifecycleEvent};
use crate::registry::DeviceRegistry;
use crate::sink::Sink;
use crate::slots::SlotTable;
use crate::types::{ActiveConnection, DeviceId, Resolution, StreamConstraints, StreamIdx};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Candidate widths below this end the degradation ladder.
pub const LADDER_FLOOR_WIDTH: u32 = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Opening,
    Retrying,
    Bound,
    Failed,
}

impl ConnectionState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ConnectionState::Opening | ConnectionState::Retrying)
    }
}

/// Connector tuning taken from the `[video]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConnectorSettings {
    /// Scale factor per over-constrained retry; `None` disables the ladder.
    pub retry_ratio: Option<f64>,
    pub disconnect_before_switch: bool,
}

#[derive(Debug, Default)]
struct ConnectorState {
    slots: HashMap<StreamIdx, ConnectionState>,
    active: Option<ActiveConnection>,
    current: StreamIdx,
    epoch: u64,
    disconnect_before_switch: bool,
}

impl ConnectorState {
    fn slot(&self, index: StreamIdx) -> ConnectionState {
        self.slots.get(&index).copied().unwrap_or(ConnectionState::Idle)
    }

    fn in_flight(&self) -> bool {
        self.slots.values().any(ConnectionState::is_in_flight)
    }
}

/// What a single call is trying to open.
struct Target {
    index: StreamIdx,
    device_id: DeviceId,
    resolution: Resolution,
    min_width: Option<u32>,
    min_height: Option<u32>,
    ladder: bool,
}

pub struct StreamConnector {
    registry: Arc<DeviceRegistry>,
    slots: Arc<SlotTable>,
    sink: Arc<dyn Sink>,
    bus: Arc<EventBus>,
    retry_ratio: Option<f64>,
    state: Mutex<ConnectorState>,
}

impl StreamConnector {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        slots: Arc<SlotTable>,
        sink: Arc<dyn Sink>,
        bus: Arc<EventBus>,
        settings: ConnectorSettings,
    ) -> Self {
        let retry_ratio = settings.retry_ratio.filter(|r| *r > 0.0 && *r < 1.0);
        Self {
            registry,
            slots,
            sink,
            bus,
            retry_ratio,
            state: Mutex::new(ConnectorState {
                disconnect_before_switch: settings.disconnect_before_switch,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, index: StreamIdx) -> ConnectionState {
        self.lock().slot(index)
    }

    pub fn active(&self) -> Option<ActiveConnection> {
        self.lock().active.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn current_index(&self) -> StreamIdx {
        self.lock().current
    }

    pub fn set_current_index(&self, index: StreamIdx) {
        self.lock().current = index;
    }

    pub fn disconnect_before_switch(&self) -> bool {
        self.lock().disconnect_before_switch
    }

    pub fn set_disconnect_before_switch(&self, value: bool) {
        self.lock().disconnect_before_switch = value;
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    fn publish(&self, action: LifecycleAction) {
        self.bus.publish(LifecycleEvent::new(action));
    }

    fn mirror<T>(&self, result: Result<T, CameraError>) -> Result<T, CameraError> {
        if let Err(e) = &result {
            self.bus.publish(LifecycleEvent::exception(e.clone()));
        }
        result
    }

    /// Connect slot `index` at its configured resolution.
    pub async fn connect(&self, index: StreamIdx) -> Result<ActiveConnection, CameraError> {
        let result = self.connect_slot(index, None).await;
        self.mirror(result)
    }

    /// Connect slot `index` asking for `resolution` instead of the slot's.
    pub async fn connect_at(
        &self,
        index: StreamIdx,
        resolution: Resolution,
    ) -> Result<ActiveConnection, CameraError> {
        let result = self.connect_slot(index, Some(resolution)).await;
        self.mirror(result)
    }

    /// Round-robin to the next slot whose device is still present, wrapping
    /// once past the end.
    pub async fn connect_next(&self) -> Result<ActiveConnection, CameraError> {
        let slots = self.slots.snapshot().await;
        let count = slots.len();
        let current = self.current_index();
        for step in 1..count {
            let slot = &slots[(current + step) % count];
            if self.registry.contains(&slot.device_id).await {
                return self.connect(slot.index).await;
            }
            log::debug!("Skipping slot {}: {} is gone", slot.index, slot.device_id);
        }
        self.mirror(Err(CameraError::NoNextStream))
    }

    /// Bind `device_id` directly, without slot lookup or degradation.
    pub async fn switch_video(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<ActiveConnection, CameraError> {
        let result = self.switch_device(device_id, resolution).await;
        self.mirror(result)
    }

    async fn switch_device(
        &self,
        device_id: &str,
        resolution: Resolution,
    ) -> Result<ActiveConnection, CameraError> {
        if !self.registry.contains(device_id).await {
            return Err(CameraError::DeviceUnavailable(format!(
                "unknown device {}",
                device_id
            )));
        }
        let index = self
            .slots
            .snapshot()
            .await
            .into_iter()
            .find(|slot| slot.device_id == device_id)
            .map(|slot| slot.index)
            .unwrap_or_else(|| self.current_index());

        self.open(Target {
            index,
            device_id: device_id.to_string(),
            resolution,
            min_width: None,
            min_height: None,
            ladder: false,
        })
        .await
    }

    /// Connect without mirroring failures onto the event channel.
    pub(crate) async fn connect_slot(
        &self,
        index: StreamIdx,
        resolution: Option<Resolution>,
    ) -> Result<ActiveConnection, CameraError> {
        let slot = self
            .slots
            .get(index)
            .await
            .ok_or(CameraError::DeviceNotFound(index))?;
        if !self.registry.contains(&slot.device_id).await {
            return Err(CameraError::DeviceNotFound(index));
        }

        self.open(Target {
            index,
            device_id: slot.device_id.clone(),
            resolution: resolution.unwrap_or_else(|| slot.resolution()),
            min_width: slot.min_width(),
            min_height: slot.min_height(),
            ladder: true,
        })
        .await
    }

    async fn open(&self, target: Target) -> Result<ActiveConnection, CameraError> {
        if self.state(target.index).is_in_flight() {
            log::warn!("Connect for slot {} already in progress", target.index);
            return Err(CameraError::ConnectInProgress(target.index));
        }

        if self.disconnect_before_switch() && self.sink.has_session() {
            log::debug!("Disconnecting before switching to slot {}", target.index);
            self.disconnect().await;
        }

        let epoch = {
            let mut state = self.lock();
            if state.slot(target.index).is_in_flight() {
                return Err(CameraError::ConnectInProgress(target.index));
            }
            state.slots.insert(target.index, ConnectionState::Opening);
            state.current = target.index;
            state.epoch
        };

        let original = target.resolution;
        let mut request = original;
        let mut attempt: u32 = 0;
        let mut busy_retried = false;

        loop {
            attempt += 1;
            let constraints =
                StreamConstraints::for_device(target.device_id.clone(), request.width, request.height);
            log::info!(
                "Connect slot {} attempt {}: {} at {}",
                target.index,
                attempt,
                target.device_id,
                request
            );

            let acquired = self.registry.provider().acquire(&constraints).await;

            if self.lock().epoch != epoch {
                if let Ok(mut session) = acquired {
                    log::info!("Releasing session acquired after disconnect on slot {}", target.index);
                    self.registry.provider().release_session(session.as_mut());
                }
                return Err(CameraError::ConnectCancelled(target.index));
            }

            let error = match acquired {
                Ok(session) => return self.bind(&target, session, epoch, busy_retried).await,
                Err(error) => error,
            };
            log::warn!("Connect slot {} attempt {} rejected: {}", target.index, attempt, error);

            match error.class() {
                FailureClass::Overconstrained => {
                    let ratio = match self.retry_ratio {
                        Some(ratio) if target.ladder => ratio,
                        _ => return Err(self.fail(&target, self.exhausted(&target, request))),
                    };
                    let next = request.scaled(ratio);
                    let below_min = target.min_width.map(|m| next.width < m).unwrap_or(false)
                        || target.min_height.map(|m| next.height < m).unwrap_or(false);
                    if next.width < LADDER_FLOOR_WIDTH || next.height == 0 || below_min {
                        return Err(self.fail(&target, self.exhausted(&target, request)));
                    }
                    self.retrying(&target, attempt + 1, next);
                    request = next;
                }
                FailureClass::Busy => {
                    if busy_retried {
                        return Err(self.fail(&target, CameraError::DeviceUnavailable(error.to_string())));
                    }
                    busy_retried = true;
                    self.release_sink_session();
                    self.retrying(&target, attempt + 1, original);
                    request = original;
                }
                FailureClass::Other => {
                    return Err(self.fail(
                        &target,
                        CameraError::UnclassifiedConnectError(error.to_string()),
                    ));
                }
            }
        }
    }

    fn exhausted(&self, target: &Target, last: Resolution) -> CameraError {
        CameraError::ResolutionExhausted {
            slot: target.index,
            width: last.width,
            height: last.height,
        }
    }

    fn retrying(&self, target: &Target, attempt: u32, next: Resolution) {
        log::info!(
            "Retrying slot {} at {} (attempt {})",
            target.index,
            next,
            attempt
        );
        self.lock().slots.insert(target.index, ConnectionState::Retrying);
        self.publish(LifecycleAction::RetryConnect {
            slot: target.index,
            attempt,
            width: next.width,
            height: next.height,
        });
    }

    fn fail(&self, target: &Target, error: CameraError) -> CameraError {
        log::error!("Connect slot {} failed: {}", target.index, error);
        self.lock().slots.insert(target.index, ConnectionState::Failed);
        error
    }

    async fn bind(
        &self,
        target: &Target,
        session: Box<dyn crate::platform::CaptureSession>,
        epoch: u64,
        busy_retried: bool,
    ) -> Result<ActiveConnection, CameraError> {
        let negotiated = session.resolution();
        self.release_sink_session();

        let actual = match self.sink.attach(session).await {
            Ok(actual) => actual,
            Err(e) => {
                if self.lock().epoch != epoch {
                    return Err(CameraError::ConnectCancelled(target.index));
                }
                return Err(self.fail(target, e));
            }
        };

        if self.lock().epoch != epoch {
            log::info!("Slot {} bound after disconnect, releasing", target.index);
            self.release_sink_session();
            return Err(CameraError::ConnectCancelled(target.index));
        }

        if actual != negotiated {
            log::debug!(
                "Slot {} negotiated {} but delivers {}",
                target.index,
                negotiated,
                actual
            );
        }

        if target.ladder {
            self.slots.update_resolution(target.index, actual).await;
        }

        let connection = ActiveConnection {
            logical_index: target.index,
            device_id: target.device_id.clone(),
            width: actual.width,
            height: actual.height,
        };

        {
            let mut state = self.lock();
            state.slots.insert(target.index, ConnectionState::Bound);
            state.active = Some(connection.clone());
            state.current = target.index;
            if busy_retried {
                state.disconnect_before_switch = true;
            }
        }

        crate::check_invariant!(
            self.sink.has_session(),
            "bound connection has a sink session",
            "connector::bind"
        );

        log::info!(
            "Slot {} bound to {} at {}x{}",
            target.index,
            target.device_id,
            actual.width,
            actual.height
        );
        self.publish(LifecycleAction::Connected {
            slot: target.index,
            device_id: target.device_id.clone(),
            width: actual.width,
            height: actual.height,
        });

        Ok(connection)
    }

    /// Detach whatever the sink holds and release it through the provider.
    /// Returns whether there was a session.
    fn release_sink_session(&self) -> bool {
        match self.sink.detach() {
            Some(mut session) => {
                self.registry.provider().release_session(session.as_mut());
                let mut state = self.lock();
                if let Some(previous) = state.active.take() {
                    if state.slot(previous.logical_index) == ConnectionState::Bound {
                        state.slots.insert(previous.logical_index, ConnectionState::Idle);
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Release the bound session and return every slot to Idle.
    ///
    /// Emits `disconnected` only when a session was bound or an acquisition
    /// was in flight; otherwise this is a silent no-op.
    pub async fn disconnect(&self) -> bool {
        let (was_active, was_in_flight) = {
            let mut state = self.lock();
            state.epoch += 1;
            let was_active = state.active.take().is_some();
            let was_in_flight = state.in_flight();
            for slot in state.slots.values_mut() {
                *slot = ConnectionState::Idle;
            }
            (was_active, was_in_flight)
        };

        let released = self.release_sink_session();

        crate::check_invariant!(
            !self.sink.has_session(),
            "disconnect leaves the sink empty",
            "connector::disconnect"
        );

        if was_active || was_in_flight || released {
            log::info!("Disconnected");
            self.publish(LifecycleAction::Disconnected);
            true
        } else {
            log::debug!("Disconnect with nothing bound");
            false
        }
    }

    /// Forget `Failed` marks once the slot table has been rebuilt.
    pub(crate) fn clear_failed(&self) {
        let mut state = self.lock();
        state.slots.retain(|_, s| s.is_in_flight() || *s == ConnectionState::Bound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AcquireError, AcquireErrorKind};
    use crate::events::EventStream;
    use crate::sink::FrameSink;
    use crate::slots::{BaseStreamConfig, StreamSlotConfig};
    use crate::testing::{video_devices, AcceptRule, SyntheticProvider};
    use std::time::Duration;

    struct Rig {
        provider: Arc<SyntheticProvider>,
        registry: Arc<DeviceRegistry>,
        connector: Arc<StreamConnector>,
        events: EventStream,
    }

    async fn rig(devices: usize, width: u32, height: u32, retry_ratio: Option<f64>) -> Rig {
        let provider = Arc::new(SyntheticProvider::new(video_devices(devices)));
        let registry = Arc::new(DeviceRegistry::new(provider.clone(), Duration::from_secs(5)));
        registry.refresh().await.unwrap();
        let configs = vec![StreamSlotConfig::new(width, height)];
        let slots = Arc::new(SlotTable::new(
            registry.resolve_slots(&configs, &BaseStreamConfig::default()).await,
        ));
        let bus = Arc::new(EventBus::new(64));
        let events = bus.subscribe();
        let connector = Arc::new(StreamConnector::new(
            registry.clone(),
            slots,
            Arc::new(FrameSink::default()),
            bus,
            ConnectorSettings {
                retry_ratio,
                disconnect_before_switch: false,
            },
        ));
        Rig {
            provider,
            registry,
            connector,
            events,
        }
    }

    fn names(events: &mut EventStream) -> Vec<&'static str> {
        events.drain().iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_connect_binds_negotiated_resolution() {
        let mut rig = rig(1, 640, 480, None).await;
        let conn = rig.connector.connect(0).await.unwrap();
        assert_eq!((conn.width, conn.height), (640, 480));
        assert_eq!(rig.connector.state(0), ConnectionState::Bound);
        assert_eq!(names(&mut rig.events), vec!["connected"]);
    }

    #[tokio::test]
    async fn test_missing_slot_is_device_not_found() {
        let mut rig = rig(1, 640, 480, None).await;
        let err = rig.connector.connect(4).await.unwrap_err();
        assert_eq!(err, CameraError::DeviceNotFound(4));
        assert_eq!(names(&mut rig.events), vec!["exception"]);
    }

    #[tokio::test]
    async fn test_ladder_degrades_and_persists_resolution() {
        let mut rig = rig(1, 1280, 720, Some(0.6)).await;
        rig.provider.set_rule("video-0", AcceptRule::max(800, 600));

        let conn = rig.connector.connect(0).await.unwrap();
        assert_eq!((conn.width, conn.height), (768, 432));
        assert_eq!(rig.provider.acquire_count(), 2);
        assert_eq!(names(&mut rig.events), vec!["retryConnect", "connected"]);

        rig.connector.disconnect().await;
        rig.provider.reset_attempts();
        rig.connector.connect(0).await.unwrap();
        assert_eq!(rig.provider.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_ladder_exhaustion_counts() {
        for (width, height, expected) in [(640u32, 480u32, 2usize), (1920, 1080, 5)] {
            let mut rig = rig(1, width, height, Some(0.6)).await;
            rig.provider.set_default_rule(AcceptRule::reject_all());

            let err = rig.connector.connect(0).await.unwrap_err();
            assert!(matches!(err, CameraError::ResolutionExhausted { slot: 0, .. }));
            assert_eq!(rig.provider.acquire_count(), expected);
            assert_eq!(rig.connector.state(0), ConnectionState::Failed);

            let retries = rig
                .events
                .drain()
                .iter()
                .filter(|e| e.name() == "retryConnect")
                .count();
            assert_eq!(retries, expected - 1);
        }
    }

    #[tokio::test]
    async fn test_no_ratio_fails_on_first_overconstrained() {
        let rig = rig(1, 1920, 1080, None).await;
        rig.provider.set_default_rule(AcceptRule::reject_all());
        let err = rig.connector.connect(0).await.unwrap_err();
        assert_eq!(
            err,
            CameraError::ResolutionExhausted {
                slot: 0,
                width: 1920,
                height: 1080
            }
        );
        assert_eq!(rig.provider.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_busy_retried_once_at_original_resolution() {
        let mut rig = rig(1, 640, 480, Some(0.6)).await;
        rig.provider.fail_busy("video-0", 1);

        rig.connector.connect(0).await.unwrap();
        let attempts = rig.provider.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].ideal(), Resolution::new(640, 480));
        assert!(rig.connector.disconnect_before_switch());
        assert_eq!(names(&mut rig.events), vec!["retryConnect", "connected"]);
    }

    #[tokio::test]
    async fn test_second_busy_is_device_unavailable() {
        let rig = rig(1, 640, 480, None).await;
        rig.provider.fail_busy("video-0", 2);
        let err = rig.connector.connect(0).await.unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
        assert_eq!(rig.provider.acquire_count(), 2);
    }

    #[tokio::test]
    async fn test_other_errors_surface_immediately() {
        let rig = rig(1, 640, 480, Some(0.6)).await;
        rig.provider.fail_with(
            "video-0",
            AcquireError::new(AcquireErrorKind::NotAllowed, "permission denied"),
        );
        let err = rig.connector.connect(0).await.unwrap_err();
        assert!(matches!(err, CameraError::UnclassifiedConnectError(_)));
        assert_eq!(rig.provider.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_double_disconnect_emits_once() {
        let mut rig = rig(1, 640, 480, None).await;
        rig.connector.connect(0).await.unwrap();
        rig.events.drain();

        assert!(rig.connector.disconnect().await);
        assert!(!rig.connector.disconnect().await);
        assert_eq!(names(&mut rig.events), vec!["disconnected"]);
        assert_eq!(rig.connector.state(0), ConnectionState::Idle);
        assert_eq!(rig.provider.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_acquire_releases_late_session() {
        let mut rig = rig(1, 640, 480, None).await;
        rig.provider.hold_acquisitions();

        let connector = rig.connector.clone();
        let pending = tokio::spawn(async move { connector.connect(0).await });
        while rig.provider.acquire_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(rig.connector.state(0), ConnectionState::Opening);
        assert_eq!(
            rig.connector.connect(0).await.unwrap_err(),
            CameraError::ConnectInProgress(0)
        );

        assert!(rig.connector.disconnect().await);
        rig.provider.release_acquisitions();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), CameraError::ConnectCancelled(0));
        assert_eq!(rig.provider.live_sessions(), 0);
        assert!(!rig.connector.is_bound());

        let seen = names(&mut rig.events);
        assert_eq!(seen.iter().filter(|n| **n == "disconnected").count(), 1);
        assert!(!seen.contains(&"connected"));
    }

    #[tokio::test]
    async fn test_connect_next_round_robin() {
        let rig = rig(3, 640, 480, None).await;
        rig.connector.connect(0).await.unwrap();
        assert_eq!(rig.connector.connect_next().await.unwrap().logical_index, 1);
        assert_eq!(rig.connector.connect_next().await.unwrap().logical_index, 2);
        assert_eq!(rig.connector.connect_next().await.unwrap().logical_index, 0);
        assert_eq!(rig.provider.live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_connect_next_skips_departed_devices() {
        let rig = rig(3, 640, 480, None).await;
        rig.connector.connect(0).await.unwrap();

        let mut devices = video_devices(3);
        devices.remove(1);
        rig.provider.set_devices(devices);
        rig.registry.rebuild().await.unwrap();
        assert_eq!(rig.connector.connect_next().await.unwrap().logical_index, 2);

        rig.provider.set_devices(vec![video_devices(3).remove(2)]);
        rig.registry.rebuild().await.unwrap();
        assert_eq!(
            rig.connector.connect_next().await.unwrap_err(),
            CameraError::NoNextStream
        );
        assert_eq!(rig.connector.active().unwrap().device_id, "video-2");
    }

    #[tokio::test]
    async fn test_connect_next_single_device() {
        let rig = rig(1, 640, 480, None).await;
        rig.connector.connect(0).await.unwrap();
        assert_eq!(
            rig.connector.connect_next().await.unwrap_err(),
            CameraError::NoNextStream
        );
    }

    #[tokio::test]
    async fn test_switch_video_by_device_id() {
        let rig = rig(2, 640, 480, Some(0.6)).await;
        let conn = rig
            .connector
            .switch_video("video-1", Resolution::new(320, 240))
            .await
            .unwrap();
        assert_eq!(conn.logical_index, 1);
        assert_eq!((conn.width, conn.height), (320, 240));

        let err = rig
            .connector
            .switch_video("nope", Resolution::new(320, 240))
            .await
            .unwrap_err();
        assert!(matches!(err, CameraError::DeviceUnavailable(_)));
    }
}
