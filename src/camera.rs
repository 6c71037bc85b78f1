//! Public facade over the stream lifecycle.
//!
//! [`StreamCamera`] wires one registry, slot table, connector, snapshot
//! pipeline and hot-plug reconciler around a single [`EventBus`].

use crate::config::CrabStreamConfig;
use crate::connector::{ConnectionState, ConnectorSettings, StreamConnector};
use crate::errors::CameraError;
use crate::events::{EventBus, EventStream};
use crate::permissions::{invoke_permission, PermissionInfo};
use crate::platform::{CapabilityProvider, DeviceChangeNotice, DeviceWatcher};
use crate::reconciler::{DeviceChangeReconciler, ReconcileOutcome};
use crate::registry::DeviceRegistry;
use crate::sink::{FrameSink, Sink};
use crate::slots::{ResolvedSlot, SlotTable};
use crate::snapshot::{ImageCapture, ImageEncoder, ImgOptions, SnapOverrides, SnapshotPipeline, UrlEncoder};
use crate::types::{ActiveConnection, DeviceId, DeviceRecord, Resolution, StreamIdx};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct StreamCamera {
    config: CrabStreamConfig,
    registry: Arc<DeviceRegistry>,
    slots: Arc<SlotTable>,
    bus: Arc<EventBus>,
    connector: Arc<StreamConnector>,
    snapshot: SnapshotPipeline,
    reconciler: Arc<DeviceChangeReconciler>,
    notifier: Mutex<Option<mpsc::UnboundedSender<DeviceChangeNotice>>>,
    watcher: Option<DeviceWatcher>,
    permission: Option<PermissionInfo>,
    destroyed: AtomicBool,
}

impl StreamCamera {
    /// Start with the built-in [`FrameSink`] and [`UrlEncoder`].
    pub async fn initialize(
        config: CrabStreamConfig,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Result<Self, CameraError> {
        let sink = Arc::new(FrameSink::new(config.timeouts.sink_ready()));
        Self::initialize_with(config, provider, sink, Arc::new(UrlEncoder::default())).await
    }

    /// Prime permission, enumerate, resolve slots and start listening for
    /// device changes. Nothing is connected yet.
    pub async fn initialize_with(
        config: CrabStreamConfig,
        provider: Arc<dyn CapabilityProvider>,
        sink: Arc<dyn Sink>,
        encoder: Arc<dyn ImageEncoder>,
    ) -> Result<Self, CameraError> {
        config.validate().map_err(CameraError::InvalidConfig)?;
        log::info!("Initializing stream camera");

        let permission = if config.events.skip_invoke_permission {
            None
        } else {
            Some(invoke_permission(&*provider, config.timeouts.permission()).await?)
        };

        let registry = Arc::new(DeviceRegistry::new(
            provider.clone(),
            config.timeouts.enumeration(),
        ));
        registry.refresh().await?;

        let stream_configs = config.stream_configs();
        let slots = Arc::new(SlotTable::new(
            registry
                .resolve_slots(&stream_configs, &config.default_stream)
                .await,
        ));

        let bus = Arc::new(EventBus::new(config.events.capacity));
        let connector = Arc::new(StreamConnector::new(
            registry.clone(),
            slots.clone(),
            sink,
            bus.clone(),
            ConnectorSettings {
                retry_ratio: config.video.retry_ratio,
                disconnect_before_switch: config.video.disconnect_before_switch,
            },
        ));

        let mut snap_defaults = config.snapshot.clone();
        snap_defaults.flip_horiz |= config.video.flip_horiz;
        let snapshot = SnapshotPipeline::new(
            connector.clone(),
            slots.clone(),
            encoder,
            bus.clone(),
            snap_defaults,
            config.timeouts.snapshot(),
        );

        let reconciler = Arc::new(DeviceChangeReconciler::new(
            registry.clone(),
            slots.clone(),
            connector.clone(),
            bus.clone(),
            stream_configs,
            config.default_stream.clone(),
            config.device_change.delay(),
        ));
        let (notifier, notices) = mpsc::unbounded_channel();
        reconciler.spawn(notices);

        let watcher = match config.device_change.poll_interval() {
            Some(interval) => {
                let watcher = DeviceWatcher::new(provider, notifier.clone(), interval);
                watcher.start().await;
                Some(watcher)
            }
            None => None,
        };

        log::info!(
            "Stream camera ready: {} slot(s)",
            slots.len().await
        );

        Ok(Self {
            config,
            registry,
            slots,
            bus,
            connector,
            snapshot,
            reconciler,
            notifier: Mutex::new(Some(notifier)),
            watcher,
            permission,
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_alive(&self) -> Result<(), CameraError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(CameraError::StreamError("camera has been destroyed".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &CrabStreamConfig {
        &self.config
    }

    /// Outcome of startup permission priming, if it ran.
    pub fn permission(&self) -> Option<&PermissionInfo> {
        self.permission.as_ref()
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Connect slot `index`, or the current slot when `None`.
    pub async fn connect(&self, index: Option<StreamIdx>) -> Result<ActiveConnection, CameraError> {
        self.ensure_alive()?;
        let index = index.unwrap_or_else(|| self.connector.current_index());
        self.connector.connect(index).await
    }

    pub async fn connect_next(&self) -> Result<ActiveConnection, CameraError> {
        self.ensure_alive()?;
        self.connector.connect_next().await
    }

    /// Bind a device by id at the given size, bypassing slot resolution.
    pub async fn switch_video(
        &self,
        device_id: &str,
        width: u32,
        height: u32,
    ) -> Result<ActiveConnection, CameraError> {
        self.ensure_alive()?;
        self.connector
            .switch_video(device_id, Resolution::new(width, height))
            .await
    }

    /// Returns true when something was torn down.
    pub async fn disconnect(&self) -> bool {
        self.connector.disconnect().await
    }

    pub async fn capture(&self, overrides: Option<SnapOverrides>) -> Result<ImageCapture, CameraError> {
        self.ensure_alive()?;
        self.snapshot.capture(overrides).await
    }

    pub async fn thumbnail(&self, image_url: &str, options: ImgOptions) -> Result<String, CameraError> {
        self.snapshot.thumbnail(image_url, options).await
    }

    pub fn revoke_object_url(&self, url: &str) -> bool {
        self.snapshot.encoder().revoke(url)
    }

    /// Video device ids in logical slot order
    pub async fn get_device_ids(&self) -> Vec<DeviceId> {
        self.slots.device_ids().await
    }

    pub async fn get_all_device_info(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot().await.devices()
    }

    pub async fn get_slot(&self, index: StreamIdx) -> Result<ResolvedSlot, CameraError> {
        self.slots
            .get(index)
            .await
            .ok_or(CameraError::SlotNotFound(index))
    }

    pub async fn slot_count(&self) -> usize {
        self.slots.len().await
    }

    pub fn current_index(&self) -> StreamIdx {
        self.connector.current_index()
    }

    pub fn active_connection(&self) -> Option<ActiveConnection> {
        self.connector.active()
    }

    pub fn connection_state(&self, index: StreamIdx) -> ConnectionState {
        self.connector.state(index)
    }

    pub fn is_playing(&self) -> bool {
        self.connector.is_bound() && self.connector.sink().is_playing()
    }

    pub fn pause_video(&self) {
        log::debug!("Pausing video");
        self.connector.sink().pause();
    }

    pub fn play_video(&self) {
        log::debug!("Resuming video");
        self.connector.sink().play();
    }

    /// Sender for OS-level device change notifications. `None` after
    /// [`StreamCamera::destroy`].
    pub fn device_change_notifier(&self) -> Option<mpsc::UnboundedSender<DeviceChangeNotice>> {
        self.notifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Run one reconciliation pass immediately, skipping the debounce.
    pub async fn reconcile_devices(&self) -> ReconcileOutcome {
        self.reconciler.reconcile().await
    }

    /// Disconnect, stop hot-plug handling and close the event channel.
    /// Later calls are no-ops.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Destroying stream camera");

        if let Some(watcher) = &self.watcher {
            watcher.stop();
        }
        self.notifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.reconciler.stop();
        self.connector.disconnect().await;
        self.bus.close();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamCamera {
    fn drop(&mut self) {
        self.reconciler.stop();
    }
}
