//! Hot-plug reconciliation.
//!
//! Device-change notices are debounced: a burst of notices collapses into a
//! single pass once the channel has been quiet for the configured delay.
//! Each pass rebuilds the registry, re-resolves the slot table and decides
//! whether the active connection survives.

use crate::connector::StreamConnector;
use crate::errors::CameraError;
use crate::events::{EventBus, LifecycleAction, LifecycleEvent};
use crate::platform::DeviceChangeNotice;
use crate::registry::DeviceRegistry;
use crate::slots::{BaseStreamConfig, SlotTable, StreamSlotConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Shortest accepted debounce window.
pub const MIN_DEBOUNCE: Duration = Duration::from_millis(100);

/// What a reconciliation pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No video devices left; slots cleared.
    Removed,
    /// Slots rebuilt for `video_count` devices.
    Changed { video_count: usize },
    /// Rebuild failed; slots cleared.
    Failed(CameraError),
}

pub struct DeviceChangeReconciler {
    registry: Arc<DeviceRegistry>,
    slots: Arc<SlotTable>,
    connector: Arc<StreamConnector>,
    bus: Arc<EventBus>,
    stream_configs: Vec<StreamSlotConfig>,
    default_stream: BaseStreamConfig,
    delay: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceChangeReconciler {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        slots: Arc<SlotTable>,
        connector: Arc<StreamConnector>,
        bus: Arc<EventBus>,
        stream_configs: Vec<StreamSlotConfig>,
        default_stream: BaseStreamConfig,
        delay: Duration,
    ) -> Self {
        Self {
            registry,
            slots,
            connector,
            bus,
            stream_configs,
            default_stream,
            delay: delay.max(MIN_DEBOUNCE),
            task: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Consume notices from `notices` until the sender side closes or
    /// [`DeviceChangeReconciler::stop`] is called.
    pub fn spawn(self: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<DeviceChangeNotice>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(first) = notices.recv().await {
                let mut coalesced = 1usize;
                let mut closed = false;
                log::debug!("Device change notice: {:?}", first);

                loop {
                    match tokio::time::timeout(this.delay, notices.recv()).await {
                        Ok(Some(_)) => coalesced += 1,
                        Ok(None) => {
                            closed = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }

                log::info!("Reconciling after {} device change notice(s)", coalesced);
                this.reconcile().await;
                if closed {
                    break;
                }

                // The pass already saw the latest topology.
                let mut dropped = 0usize;
                while notices.try_recv().is_ok() {
                    dropped += 1;
                }
                if dropped > 0 {
                    log::debug!("Dropped {} notice(s) received mid-pass", dropped);
                }
            }
            log::debug!("Device change stream closed");
        });

        if let Ok(mut task) = self.task.lock() {
            if let Some(previous) = task.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                log::debug!("Stopping device change reconciler");
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// One reconciliation pass. Failures are absorbed: they leave the system
    /// disconnected with no slots and surface as an `exception` event.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let resolved = match self.registry.rebuild().await {
            Ok(_) => {
                self.registry
                    .resolve_slots(&self.stream_configs, &self.default_stream)
                    .await
            }
            Err(e) => {
                log::error!("Device change reconciliation failed: {}", e);
                self.slots.clear().await;
                self.connector.disconnect().await;
                self.bus.publish(LifecycleEvent::exception(e.clone()));
                return ReconcileOutcome::Failed(e);
            }
        };

        if resolved.is_empty() {
            log::info!("All video devices removed");
            self.slots.clear().await;
            self.connector.disconnect().await;
            self.bus.publish(LifecycleEvent::new(LifecycleAction::DeviceRemoved));
            return ReconcileOutcome::Removed;
        }

        let video_count = resolved.len();
        let active = self.connector.active();
        let survives = active.as_ref().map(|conn| {
            resolved
                .get(conn.logical_index)
                .map(|slot| slot.device_id == conn.device_id)
                .unwrap_or(false)
        });

        self.slots.replace(resolved).await;
        self.connector.clear_failed();
        log::info!("Device topology changed: {} video device(s)", video_count);
        self.bus
            .publish(LifecycleEvent::new(LifecycleAction::DeviceChange { video_count }));

        if survives == Some(false) {
            log::info!("Active device no longer backs its slot, disconnecting");
            self.connector.disconnect().await;
        }

        if !self.connector.is_bound() {
            let current = self.connector.current_index();
            let index = if current < video_count { current } else { 0 };
            if let Err(e) = self.connector.connect_slot(index, None).await {
                log::warn!("Reconnect of slot {} after device change failed: {}", index, e);
                self.bus.publish(LifecycleEvent::exception(e));
            }
        }

        ReconcileOutcome::Changed { video_count }
    }
}

impl Drop for DeviceChangeReconciler {
    fn drop(&mut self) {
        self.stop();
    }
}
