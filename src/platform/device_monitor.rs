//! Device monitoring and hot-plug detection
//!
//! Backends without native hot-plug callbacks are polled: the watcher lists
//! devices on an interval and emits a [`DeviceChangeNotice`] whenever the
//! set of device ids differs from the previous scan.

use crate::platform::CapabilityProvider;
use crate::types::DeviceId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// One OS-level "devices changed" notification.
///
/// Reconciliation re-reads the whole topology, so the id lists are only
/// informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChangeNotice {
    pub connected: Vec<DeviceId>,
    pub disconnected: Vec<DeviceId>,
}

impl DeviceChangeNotice {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

/// Polling device watcher
pub struct DeviceWatcher {
    provider: Arc<dyn CapabilityProvider>,
    known: Arc<RwLock<HashSet<DeviceId>>>,
    sender: mpsc::UnboundedSender<DeviceChangeNotice>,
    interval: Duration,
    is_monitoring: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceWatcher {
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        sender: mpsc::UnboundedSender<DeviceChangeNotice>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            known: Arc::new(RwLock::new(HashSet::new())),
            sender,
            interval,
            is_monitoring: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Take the initial scan and start polling. Calling twice is a no-op.
    pub async fn start(&self) {
        if self.is_monitoring.swap(true, Ordering::SeqCst) {
            return;
        }

        log::info!("Starting device watcher (poll every {:?})", self.interval);

        // Baseline scan so the first tick only reports real changes.
        Self::scan(&*self.provider, &self.known).await;

        let provider = self.provider.clone();
        let known = self.known.clone();
        let sender = self.sender.clone();
        let is_monitoring = self.is_monitoring.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            while is_monitoring.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if !is_monitoring.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(notice) = Self::scan(&*provider, &known).await {
                    if sender.send(notice).is_err() {
                        log::debug!("Device change receiver dropped, stopping watcher");
                        break;
                    }
                }
            }
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    pub fn stop(&self) {
        if !self.is_monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Stopping device watcher");
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.is_monitoring.load(Ordering::SeqCst)
    }

    /// Currently known device ids
    pub async fn known_devices(&self) -> Vec<DeviceId> {
        self.known.read().await.iter().cloned().collect()
    }

    /// Rescan and diff against the known set. Enumeration errors are logged
    /// and leave the known set untouched.
    async fn scan(
        provider: &dyn CapabilityProvider,
        known: &RwLock<HashSet<DeviceId>>,
    ) -> Option<DeviceChangeNotice> {
        let devices = match provider.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("Device watcher scan failed: {}", e);
                return None;
            }
        };

        let current: HashSet<DeviceId> = devices.into_iter().map(|d| d.device_id).collect();
        let mut known = known.write().await;

        let mut notice = DeviceChangeNotice::default();
        for id in known.difference(&current) {
            log::info!("Device disconnected: {}", id);
            notice.disconnected.push(id.clone());
        }
        for id in current.difference(&known) {
            log::info!("Device connected: {}", id);
            notice.connected.push(id.clone());
        }
        *known = current;

        if notice.is_empty() {
            None
        } else {
            notice.connected.sort();
            notice.disconnected.sort();
            Some(notice)
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
